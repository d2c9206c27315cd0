//! Delivery worker: invoke the external sender and record the outcome.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use leadline_core::{DomainResult, PhoneNumber};
use leadline_leads::ProcessingState;
use leadline_store::Patch;

use crate::entry::{QueueEntry, QueueStatus};
use crate::policy::TenantPolicy;
use crate::repository::QueueRepository;

/// Provider acknowledgement for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Why a send attempt did not produce a receipt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The provider refused the message (bad template, blocked number, ...).
    #[error("send rejected: {0}")]
    Rejected(String),
    /// Network/timeout style failure; the attempt may succeed if retried.
    #[error("transient send failure: {0}")]
    Transient(String),
}

/// The external WhatsApp transport, reduced to what the queue needs.
///
/// Treated as at-least-once-accepting: an accepted receipt does not imply
/// exactly-once delivery, so the queue never relies on that.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        phone: &PhoneNumber,
        template: &str,
        content: &str,
    ) -> Result<SendReceipt, SendError>;
}

#[async_trait]
impl<T: MessageSender + ?Sized> MessageSender for std::sync::Arc<T> {
    async fn send(
        &self,
        phone: &PhoneNumber,
        template: &str,
        content: &str,
    ) -> Result<SendReceipt, SendError> {
        (**self).send(phone, template, content).await
    }
}

/// What happened to one claimed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Provider accepted; entry is `sent`.
    Sent { message_id: String },
    /// Attempt failed; entry went back to `queued` with backoff.
    Requeued,
    /// Attempt failed and retries are exhausted; entry is `failed`.
    FailedPermanently,
    /// The entry was cancelled (or otherwise moved) while we worked on it;
    /// nothing was overwritten.
    Superseded,
}

/// Sends claimed entries and writes the outcome back through the repository.
pub struct DeliveryWorker<S: MessageSender> {
    repo: QueueRepository,
    sender: S,
}

impl<S: MessageSender> DeliveryWorker<S> {
    pub fn new(repo: QueueRepository, sender: S) -> Self {
        Self { repo, sender }
    }

    /// Deliver one entry previously claimed by a dispatcher.
    ///
    /// Every status write is a compare-and-set from `sending`, so a takeover
    /// cancellation that lands mid-send always wins; the contract is "no
    /// further automated messages", not retraction of one already in flight.
    pub async fn deliver(
        &self,
        entry: &QueueEntry,
        policy: &TenantPolicy,
    ) -> DomainResult<SendOutcome> {
        // Status may have changed between claim and pickup; re-check before
        // talking to the provider at all.
        match self.repo.get(entry.entry_id).await? {
            Some(current) if current.queue_status == QueueStatus::Sending => {}
            _ => {
                debug!(entry = %entry.entry_id, "entry no longer sending, skipping");
                return Ok(SendOutcome::Superseded);
            }
        }

        let now = Utc::now();
        let attempt = tokio::time::timeout(
            policy.send_call_timeout,
            self.sender.send(
                &entry.recipient_phone,
                &entry.message_template,
                &entry.message_content,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SendError::Transient(format!(
                "send call exceeded {:?}",
                policy.send_call_timeout
            )))
        });

        match attempt {
            Ok(receipt) => {
                // The entry must be `sent` before any lead bookkeeping: an
                // accepted send that leaves the entry `sending` would be
                // requeued by the stale sweep and go out a second time.
                let won = self
                    .repo
                    .transition(
                        entry.entry_id,
                        QueueStatus::Sending,
                        QueueStatus::Sent,
                        Patch::new()
                            .set("sent_at", now.to_rfc3339())
                            .set("provider_message_id", receipt.message_id.clone()),
                    )
                    .await?;

                // The attempt is recorded on the lead even if the entry was
                // cancelled meanwhile; the send outcome is already durable,
                // so a bookkeeping failure only costs a counter, not a resend.
                if let Err(err) = self
                    .repo
                    .leads()
                    .record_interaction(entry.lead_id, now)
                    .await
                {
                    warn!(
                        lead = %entry.lead_id,
                        error = %err,
                        "interaction bookkeeping failed after accepted send"
                    );
                }

                if !won {
                    warn!(
                        entry = %entry.entry_id,
                        message_id = %receipt.message_id,
                        "send accepted but entry was cancelled mid-flight"
                    );
                    return Ok(SendOutcome::Superseded);
                }

                if let Err(err) = self
                    .repo
                    .leads()
                    .set_processing_state(
                        entry.lead_id,
                        &[ProcessingState::Queued],
                        ProcessingState::Completed,
                    )
                    .await
                {
                    warn!(
                        lead = %entry.lead_id,
                        error = %err,
                        "lead state update failed after accepted send"
                    );
                }
                info!(
                    entry = %entry.entry_id,
                    lead = %entry.lead_id,
                    message_id = %receipt.message_id,
                    "message sent"
                );
                Ok(SendOutcome::Sent {
                    message_id: receipt.message_id,
                })
            }
            Err(err) => {
                self.repo.leads().record_interaction(entry.lead_id, now).await?;
                debug!(entry = %entry.entry_id, error = %err, "send attempt failed");
                match self
                    .repo
                    .record_failure(entry, &policy.retry, &err.to_string(), now)
                    .await?
                {
                    Some(QueueStatus::Queued) => Ok(SendOutcome::Requeued),
                    Some(_) => Ok(SendOutcome::FailedPermanently),
                    None => Ok(SendOutcome::Superseded),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use crate::dispatch::Dispatcher;
    use crate::repository::EnqueueRequest;
    use leadline_core::{TenantId, UserId};
    use leadline_leads::Lead;
    use leadline_store::{
        Filter, InMemoryStore, Record, RecordStore, StoreError, StoreResult, StoreRole, Table,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("+14155550123").unwrap()
    }

    /// Sender scripted to fail a fixed number of times, then accept.
    struct ScriptedSender {
        failures: AtomicU32,
        error: SendError,
        calls: AtomicU32,
    }

    impl ScriptedSender {
        fn accepting() -> Self {
            Self {
                failures: AtomicU32::new(0),
                error: SendError::Transient("unused".into()),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(times: u32, error: SendError) -> Self {
            Self {
                failures: AtomicU32::new(times),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(
            &self,
            _phone: &PhoneNumber,
            _template: &str,
            _content: &str,
        ) -> Result<SendReceipt, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(SendReceipt {
                message_id: "wamid.1".into(),
            })
        }
    }

    /// Store dropping a scripted number of reads against one table.
    struct FlakyStore {
        inner: Arc<InMemoryStore>,
        table: Table,
        read_failures: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        fn role(&self) -> StoreRole {
            self.inner.role()
        }

        async fn get(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Record>> {
            if table == self.table {
                let remaining = self.read_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.read_failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(StoreError::transient("read dropped"));
                }
            }
            self.inner.get(table, filter).await
        }

        async fn insert(&self, table: Table, rows: Vec<Record>) -> StoreResult<usize> {
            self.inner.insert(table, rows).await
        }

        async fn update(
            &self,
            table: Table,
            filter: &Filter,
            patch: &Patch,
        ) -> StoreResult<u64> {
            self.inner.update(table, filter, patch).await
        }

        async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<u64> {
            self.inner.delete(table, filter).await
        }
    }

    async fn claimed_entry(
        repo: &QueueRepository,
        dispatcher: &Dispatcher,
        tenant: TenantId,
    ) -> QueueEntry {
        let lead = Lead::new(tenant, "Ada", phone());
        let lead_id = lead.lead_id;
        repo.leads().insert(&lead).await.unwrap();
        repo.enqueue(EnqueueRequest {
            lead_id,
            client_id: tenant,
            user_id: UserId::system(),
            priority: 1,
            message_type: "followup".into(),
            message_template: "intro_v1".into(),
            message_content: "Hi".into(),
            recipient_phone: phone(),
            scheduled_for: None,
        })
        .await
        .unwrap();
        dispatcher
            .pull_batch(tenant, &TenantPolicy::unrestricted(), 1)
            .await
            .unwrap()
            .remove(0)
    }

    fn setup() -> (QueueRepository, Dispatcher, TenantId) {
        let store: Arc<InMemoryStore> = InMemoryStore::site();
        let repo = QueueRepository::new(store.clone());
        let dispatcher = Dispatcher::new(repo.clone(), RateLimiter::new(store));
        (repo, dispatcher, TenantId::new())
    }

    #[tokio::test]
    async fn accepted_send_marks_sent_and_updates_lead() {
        let (repo, dispatcher, tenant) = setup();
        let entry = claimed_entry(&repo, &dispatcher, tenant).await;

        let worker = DeliveryWorker::new(repo.clone(), ScriptedSender::accepting());
        let outcome = worker
            .deliver(&entry, &TenantPolicy::unrestricted())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Sent {
                message_id: "wamid.1".into()
            }
        );

        let after = repo.get(entry.entry_id).await.unwrap().unwrap();
        assert_eq!(after.queue_status, QueueStatus::Sent);
        assert!(after.sent_at.is_some());
        assert_eq!(after.provider_message_id.as_deref(), Some("wamid.1"));

        let lead = repo.leads().get(entry.lead_id).await.unwrap().unwrap();
        assert_eq!(lead.interaction_count, 1);
        assert!(lead.last_interaction.is_some());
        assert_eq!(lead.processing_state, ProcessingState::Completed);
    }

    #[tokio::test]
    async fn rejected_send_requeues_with_backoff() {
        let (repo, dispatcher, tenant) = setup();
        let entry = claimed_entry(&repo, &dispatcher, tenant).await;

        let worker = DeliveryWorker::new(
            repo.clone(),
            ScriptedSender::failing(1, SendError::Rejected("template paused".into())),
        );
        let outcome = worker
            .deliver(&entry, &TenantPolicy::unrestricted())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Requeued);

        let after = repo.get(entry.entry_id).await.unwrap().unwrap();
        assert_eq!(after.queue_status, QueueStatus::Queued);
        assert_eq!(after.retry_count, 1);
        assert!(after.scheduled_for > Utc::now());
        assert!(after.last_error.unwrap().contains("template paused"));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally() {
        let (repo, dispatcher, tenant) = setup();
        let entry = claimed_entry(&repo, &dispatcher, tenant).await;

        let mut policy = TenantPolicy::unrestricted();
        policy.retry.max_retries = 1;
        let worker = DeliveryWorker::new(
            repo.clone(),
            ScriptedSender::failing(10, SendError::Transient("timeout".into())),
        );

        let outcome = worker.deliver(&entry, &policy).await.unwrap();
        assert_eq!(outcome, SendOutcome::FailedPermanently);

        let after = repo.get(entry.entry_id).await.unwrap().unwrap();
        assert_eq!(after.queue_status, QueueStatus::Failed);
        assert_eq!(after.retry_count, 1);

        // The lead stays visibly failed rather than disappearing.
        let lead = repo.leads().get(entry.lead_id).await.unwrap().unwrap();
        assert_eq!(lead.processing_state, ProcessingState::Failed);
    }

    #[tokio::test]
    async fn bookkeeping_failure_after_accept_does_not_resend() {
        let flaky = Arc::new(FlakyStore {
            inner: InMemoryStore::site(),
            table: Table::Leads,
            read_failures: AtomicU32::new(0),
        });
        let repo = QueueRepository::new(flaky.clone());
        let dispatcher = Dispatcher::new(repo.clone(), RateLimiter::new(flaky.clone()));
        let tenant = TenantId::new();
        let entry = claimed_entry(&repo, &dispatcher, tenant).await;

        // One lead read drops right after the provider accepts.
        flaky.read_failures.store(1, Ordering::SeqCst);
        let sender = Arc::new(ScriptedSender::accepting());
        let worker = DeliveryWorker::new(repo.clone(), sender.clone());

        let mut policy = TenantPolicy::unrestricted();
        policy.sending_timeout = std::time::Duration::ZERO;
        let outcome = worker.deliver(&entry, &policy).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Sent {
                message_id: "wamid.1".into()
            }
        );

        // The send is durable despite the dropped read: nothing for the
        // stale sweep, nothing to re-pull, one provider call total.
        let after = repo.get(entry.entry_id).await.unwrap().unwrap();
        assert_eq!(after.queue_status, QueueStatus::Sent);
        assert_eq!(dispatcher.sweep_stale(tenant, &policy).await.unwrap(), 0);
        assert!(dispatcher
            .pull_batch(tenant, &policy, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);

        // Only the interaction counter was lost; the lead still completed.
        let lead = repo.leads().get(entry.lead_id).await.unwrap().unwrap();
        assert_eq!(lead.processing_state, ProcessingState::Completed);
        assert_eq!(lead.interaction_count, 0);
    }

    #[tokio::test]
    async fn cancellation_mid_send_wins() {
        let (repo, dispatcher, tenant) = setup();
        let entry = claimed_entry(&repo, &dispatcher, tenant).await;

        // Takeover lands between claim and delivery.
        repo.cancel(entry.lead_id, "taken by human").await.unwrap();

        let worker = DeliveryWorker::new(repo.clone(), ScriptedSender::accepting());
        let outcome = worker
            .deliver(&entry, &TenantPolicy::unrestricted())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Superseded);

        let after = repo.get(entry.entry_id).await.unwrap().unwrap();
        assert_eq!(after.queue_status, QueueStatus::Cancelled);
        assert!(after.sent_at.is_none());
    }
}
