//! Repositories over the record store: queue entries and leads.
//!
//! Entries are never deleted; every status change is a conditional update
//! guarded by the expected current status, so a lost race is reported as
//! `Ok(false)` and the caller simply does not proceed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use leadline_core::{DomainError, DomainResult, EntryId, LeadId, PhoneNumber, TenantId, UserId};
use leadline_leads::{Lead, ProcessingState};
use leadline_store::{Filter, Patch, Record, RecordStore, StoreError, Table};
use uuid::Uuid;

use crate::entry::{QueueEntry, QueueStatus};
use crate::retry::RetryPolicy;

const CAS_ATTEMPTS: u32 = 16;

/// Namespace for deriving per-tenant position counter ids.
const POSITION_NAMESPACE: Uuid = Uuid::from_u128(0x3b7c2e19_a4f6_4d58_8e01_5c9d7f2b6a43);

fn position_counter_id(tenant_id: TenantId) -> Uuid {
    Uuid::new_v5(&POSITION_NAMESPACE, tenant_id.to_string().as_bytes())
}

fn status_labels(statuses: &[QueueStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

/// Read/write access to leads.
#[derive(Clone)]
pub struct LeadRepository {
    store: Arc<dyn RecordStore>,
}

impl LeadRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn insert(&self, lead: &Lead) -> DomainResult<()> {
        let record = Record::from_entity(*lead.lead_id.as_uuid(), lead)?;
        self.store.insert(Table::Leads, vec![record]).await?;
        Ok(())
    }

    pub async fn get(&self, lead_id: LeadId) -> DomainResult<Option<Lead>> {
        let rows = self
            .store
            .get(Table::Leads, &Filter::by_id(*lead_id.as_uuid()))
            .await?;
        rows.into_iter()
            .next()
            .map(|r| r.to_entity::<Lead>().map_err(Into::into))
            .transpose()
    }

    /// Leads a bulk enqueue may pick up for a tenant.
    pub async fn list_eligible(&self, tenant_id: TenantId) -> DomainResult<Vec<Lead>> {
        let filter = Filter::all()
            .eq("client_id", tenant_id.to_string())
            .eq("processing_state", ProcessingState::Pending.as_str());
        let rows = self.store.get(Table::Leads, &filter).await?;
        rows.into_iter()
            .map(|r| r.to_entity::<Lead>().map_err(Into::into))
            .collect()
    }

    /// Conditionally move a lead between processing states.
    ///
    /// Returns `Ok(false)` when the lead was not in any of the expected
    /// states (lost race or repeated call).
    pub async fn set_processing_state(
        &self,
        lead_id: LeadId,
        expected: &[ProcessingState],
        next: ProcessingState,
    ) -> DomainResult<bool> {
        let labels: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let filter = Filter::by_id(*lead_id.as_uuid()).any_of("processing_state", labels);
        let patch = Patch::new()
            .set("processing_state", next.as_str())
            .set("updated_at", Utc::now().to_rfc3339());
        let affected = self.store.update(Table::Leads, &filter, &patch).await?;
        Ok(affected > 0)
    }

    /// Bump `interaction_count` / `last_interaction` after a send attempt.
    ///
    /// Compare-and-set loop on the current count so concurrent workers never
    /// lose an increment.
    pub async fn record_interaction(
        &self,
        lead_id: LeadId,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(lead) = self.get(lead_id).await? else {
                return Err(DomainError::not_found());
            };
            let filter = Filter::by_id(*lead_id.as_uuid())
                .eq("interaction_count", lead.interaction_count);
            let patch = Patch::new()
                .set("interaction_count", lead.interaction_count + 1)
                .set("last_interaction", at.to_rfc3339())
                .set("updated_at", at.to_rfc3339());
            if self.store.update(Table::Leads, &filter, &patch).await? > 0 {
                return Ok(());
            }
        }
        Err(DomainError::conflict(format!(
            "interaction counter contention for lead {lead_id}"
        )))
    }
}

/// What to enqueue for one lead.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub lead_id: LeadId,
    pub client_id: TenantId,
    pub user_id: UserId,
    pub priority: i32,
    pub message_type: String,
    pub message_template: String,
    pub message_content: String,
    pub recipient_phone: PhoneNumber,
    /// Earliest send time; defaults to now.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Per-lead failure inside a batch enqueue.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FailedLead {
    pub lead_id: LeadId,
    pub reason: String,
}

/// Result of a batch enqueue: one outcome per lead, never all-or-nothing.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchOutcome {
    pub created: Vec<EntryId>,
    pub failed: Vec<FailedLead>,
}

/// Owns the lifecycle of queue entries.
#[derive(Clone)]
pub struct QueueRepository {
    store: Arc<dyn RecordStore>,
    leads: LeadRepository,
}

impl QueueRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        let leads = LeadRepository::new(store.clone());
        Self { store, leads }
    }

    pub fn leads(&self) -> &LeadRepository {
        &self.leads
    }

    /// Enqueue one lead.
    ///
    /// Rejects when the lead already has an in-flight entry (single active
    /// entry invariant) or is not eligible; assigns the next tenant-scoped
    /// queue position; moves the lead to `queued`.
    pub async fn enqueue(&self, request: EnqueueRequest) -> DomainResult<QueueEntry> {
        let in_flight = self.in_flight_count(request.lead_id).await?;
        if in_flight > 0 {
            return Err(DomainError::invariant(format!(
                "lead {} already has an active queue entry",
                request.lead_id
            )));
        }

        let Some(lead) = self.leads.get(request.lead_id).await? else {
            return Err(DomainError::not_found());
        };
        let already_queued = lead.processing_state == ProcessingState::Queued;
        if !already_queued && !lead.processing_state.can_transition(ProcessingState::Queued) {
            return Err(DomainError::invariant(format!(
                "lead {} is {} and not eligible for enqueue",
                request.lead_id,
                lead.processing_state.as_str()
            )));
        }

        let now = Utc::now();
        let entry = QueueEntry {
            entry_id: EntryId::new(),
            lead_id: request.lead_id,
            client_id: request.client_id,
            user_id: request.user_id,
            queue_position: self.next_position(request.client_id).await?,
            priority: request.priority,
            queue_status: QueueStatus::Queued,
            scheduled_for: request.scheduled_for.unwrap_or(now),
            message_type: request.message_type,
            message_template: request.message_template,
            message_content: request.message_content,
            recipient_phone: request.recipient_phone,
            retry_count: 0,
            last_error: None,
            provider_message_id: None,
            created_at: now,
            processed_at: None,
            sent_at: None,
            updated_at: now,
        };

        let record = Record::from_entity(*entry.entry_id.as_uuid(), &entry)?;
        self.store.insert(Table::QueueEntries, vec![record]).await?;

        if !already_queued {
            self.leads
                .set_processing_state(
                    request.lead_id,
                    &[ProcessingState::Pending],
                    ProcessingState::Queued,
                )
                .await?;
        }

        info!(
            entry = %entry.entry_id,
            lead = %entry.lead_id,
            tenant = %entry.client_id,
            position = entry.queue_position,
            priority = entry.priority,
            "enqueued"
        );
        Ok(entry)
    }

    /// Enqueue many leads, tolerating per-lead failures.
    ///
    /// One lead's constraint violation never aborts the batch; operators get
    /// one outcome per lead.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> DomainResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for request in requests {
            let lead_id = request.lead_id;
            match self.enqueue(request).await {
                Ok(entry) => outcome.created.push(entry.entry_id),
                Err(err @ DomainError::Store(_)) => {
                    // Store-level failures are not per-lead conditions; bail
                    // so the caller can retry the remainder.
                    warn!(lead = %lead_id, error = %err, "batch enqueue aborted on store failure");
                    return Err(err);
                }
                Err(err) => {
                    debug!(lead = %lead_id, error = %err, "lead skipped in batch enqueue");
                    outcome.failed.push(FailedLead {
                        lead_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!(
            created = outcome.created.len(),
            failed = outcome.failed.len(),
            "batch enqueue complete"
        );
        Ok(outcome)
    }

    /// Cancel all non-terminal entries for a lead.
    ///
    /// Idempotent: a second call finds nothing non-terminal and returns 0.
    pub async fn cancel(&self, lead_id: LeadId, reason: &str) -> DomainResult<u64> {
        let filter = Filter::all()
            .eq("lead_id", lead_id.to_string())
            .any_of("queue_status", status_labels(&QueueStatus::NON_TERMINAL));
        let patch = Patch::new()
            .set("queue_status", QueueStatus::Cancelled.as_str())
            .set("last_error", reason)
            .set("updated_at", Utc::now().to_rfc3339());
        let cancelled = self.store.update(Table::QueueEntries, &filter, &patch).await?;
        if cancelled > 0 {
            info!(lead = %lead_id, cancelled, reason, "queue entries cancelled");
        }
        Ok(cancelled)
    }

    /// Compare-and-set one entry's status, stamping extra fields with it.
    ///
    /// Rejects edges not in the state machine; returns `Ok(false)` when the
    /// entry was no longer in `from` (a concurrent cancellation always wins).
    pub async fn transition(
        &self,
        entry_id: EntryId,
        from: QueueStatus,
        to: QueueStatus,
        extra: Patch,
    ) -> DomainResult<bool> {
        if !from.can_transition(to) {
            return Err(DomainError::invariant(format!(
                "illegal queue transition {from} -> {to}"
            )));
        }
        let filter = Filter::by_id(*entry_id.as_uuid()).eq("queue_status", from.as_str());
        let mut patch = Patch::new()
            .set("queue_status", to.as_str())
            .set("updated_at", Utc::now().to_rfc3339());
        for (field, value) in extra.fields() {
            patch = patch.set(field.clone(), value.clone());
        }
        let affected = self.store.update(Table::QueueEntries, &filter, &patch).await?;
        if affected == 0 {
            debug!(entry = %entry_id, %from, %to, "transition lost race");
        }
        Ok(affected > 0)
    }

    pub async fn get(&self, entry_id: EntryId) -> DomainResult<Option<QueueEntry>> {
        let rows = self
            .store
            .get(Table::QueueEntries, &Filter::by_id(*entry_id.as_uuid()))
            .await?;
        rows.into_iter()
            .next()
            .map(|r| r.to_entity::<QueueEntry>().map_err(Into::into))
            .transpose()
    }

    pub async fn list_for_lead(&self, lead_id: LeadId) -> DomainResult<Vec<QueueEntry>> {
        self.list(Filter::all().eq("lead_id", lead_id.to_string())).await
    }

    /// Entries a dispatcher may claim right now (status `queued`, schedule due).
    ///
    /// Ordering and the per-entry claim happen in the dispatcher; this is
    /// just the eligibility read.
    pub async fn list_dispatchable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<QueueEntry>> {
        self.list(
            Filter::all()
                .eq("client_id", tenant_id.to_string())
                .eq("queue_status", QueueStatus::Queued.as_str())
                .lte("scheduled_for", now.to_rfc3339()),
        )
        .await
    }

    /// `sending` entries whose claim is older than `cutoff` (stale claims).
    pub async fn list_stale_sending(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> DomainResult<Vec<QueueEntry>> {
        self.list(
            Filter::all()
                .eq("client_id", tenant_id.to_string())
                .eq("queue_status", QueueStatus::Sending.as_str())
                .lte("processed_at", cutoff.to_rfc3339()),
        )
        .await
    }

    /// Record a failed attempt for an entry currently in `sending`.
    ///
    /// Increments `retry_count`, then either requeues with exponential
    /// backoff on `scheduled_for` or marks the entry terminally `failed` once
    /// retries are exhausted. Returns the state written, or `None` when the
    /// compare-and-set lost (a concurrent cancellation wins and stays won).
    pub async fn record_failure(
        &self,
        entry: &QueueEntry,
        retry: &RetryPolicy,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<QueueStatus>> {
        let attempts = entry.retry_count + 1;
        let (to, patch) = if retry.should_retry(attempts) {
            let delay = retry.backoff(attempts);
            let next = now + chrono::Duration::from_std(delay).unwrap_or_default();
            (
                QueueStatus::Queued,
                Patch::new()
                    .set("retry_count", attempts)
                    .set("last_error", reason)
                    .set("scheduled_for", next.to_rfc3339()),
            )
        } else {
            (
                QueueStatus::Failed,
                Patch::new()
                    .set("retry_count", attempts)
                    .set("last_error", reason),
            )
        };

        if !self
            .transition(entry.entry_id, QueueStatus::Sending, to, patch)
            .await?
        {
            return Ok(None);
        }

        if to == QueueStatus::Failed {
            warn!(
                entry = %entry.entry_id,
                lead = %entry.lead_id,
                attempts,
                reason,
                "entry failed permanently"
            );
            // The lead stays visibly failed for an operator; takeover (lead
            // already `active`) wins this CAS instead, which is fine.
            self.leads
                .set_processing_state(
                    entry.lead_id,
                    &[ProcessingState::Queued],
                    ProcessingState::Failed,
                )
                .await?;
        }
        Ok(Some(to))
    }

    pub async fn list_by_status(
        &self,
        tenant_id: TenantId,
        statuses: &[QueueStatus],
    ) -> DomainResult<Vec<QueueEntry>> {
        self.list(
            Filter::all()
                .eq("client_id", tenant_id.to_string())
                .any_of("queue_status", status_labels(statuses)),
        )
        .await
    }

    /// Entries counting against the single-active-entry invariant.
    pub async fn in_flight_count(&self, lead_id: LeadId) -> DomainResult<u64> {
        let filter = Filter::all()
            .eq("lead_id", lead_id.to_string())
            .any_of("queue_status", status_labels(&QueueStatus::IN_FLIGHT));
        Ok(self.store.get(Table::QueueEntries, &filter).await?.len() as u64)
    }

    async fn list(&self, filter: Filter) -> DomainResult<Vec<QueueEntry>> {
        let rows = self.store.get(Table::QueueEntries, &filter).await?;
        rows.into_iter()
            .map(|r| r.to_entity::<QueueEntry>().map_err(Into::into))
            .collect()
    }

    /// Claim the next tenant-scoped queue position.
    ///
    /// Positions come from a per-tenant counter row whose id is derived from
    /// the tenant, advanced by a compare-and-set on the expected value, so
    /// concurrent enqueues each claim a distinct position and the tie-break
    /// stays stable. A missing counter is seeded from the largest position
    /// already stored; the derived id makes racing seeders collide on the
    /// insert instead of double-seeding.
    async fn next_position(&self, tenant_id: TenantId) -> DomainResult<u64> {
        let id = position_counter_id(tenant_id);
        for _ in 0..CAS_ATTEMPTS {
            let rows = self.store.get(Table::Counters, &Filter::by_id(id)).await?;
            let Some(row) = rows.into_iter().next() else {
                let seed = self.max_position(tenant_id).await? + 1;
                let record = Record::new(
                    id,
                    serde_json::json!({
                        "tenant_id": tenant_id.to_string(),
                        "next_position": seed + 1,
                    }),
                );
                match self.store.insert(Table::Counters, vec![record]).await {
                    Ok(_) => return Ok(seed),
                    // Another enqueue seeded the counter first; claim from it.
                    Err(StoreError::Constraint(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            let next = row
                .field("next_position")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);
            let affected = self
                .store
                .update(
                    Table::Counters,
                    &Filter::by_id(id).eq("next_position", next),
                    &Patch::new().set("next_position", next + 1),
                )
                .await?;
            if affected == 1 {
                return Ok(next);
            }
        }
        Err(DomainError::conflict(format!(
            "queue position contention for tenant {tenant_id}"
        )))
    }

    async fn max_position(&self, tenant_id: TenantId) -> DomainResult<u64> {
        let rows = self
            .store
            .get(
                Table::QueueEntries,
                &Filter::all().eq("client_id", tenant_id.to_string()),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.field("queue_position").and_then(|v| v.as_u64()))
            .max()
            .unwrap_or(0))
    }
}
