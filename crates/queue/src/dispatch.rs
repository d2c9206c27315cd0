//! Scheduler/dispatcher: select and claim the next batch to send.

use chrono::Utc;
use tracing::{debug, info, warn};

use leadline_core::{DomainResult, TenantId};
use leadline_store::Patch;

use crate::entry::{QueueEntry, QueueStatus};
use crate::policy::TenantPolicy;
use crate::rate_limit::RateLimiter;
use crate::repository::QueueRepository;

/// Pulls eligible entries and claims them one by one.
///
/// Several dispatcher instances may run against the same store; the per-entry
/// `queued → sending` compare-and-set ensures each entry is claimed at most
/// once, and the store-backed rate limiter shares one budget between them.
#[derive(Clone)]
pub struct Dispatcher {
    repo: QueueRepository,
    limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(repo: QueueRepository, limiter: RateLimiter) -> Self {
        Self { repo, limiter }
    }

    /// Claim up to `max_items` entries for a tenant.
    ///
    /// Selection order is `priority DESC, queue_position ASC`. Outside the
    /// tenant's business window this returns an empty batch and entries stay
    /// `queued` for the next tick.
    pub async fn pull_batch(
        &self,
        tenant_id: TenantId,
        policy: &TenantPolicy,
        max_items: usize,
    ) -> DomainResult<Vec<QueueEntry>> {
        let now = Utc::now();
        if !policy.window.contains(now) {
            debug!(tenant = %tenant_id, "outside business window, nothing pulled");
            return Ok(Vec::new());
        }

        let mut candidates = self.repo.list_dispatchable(tenant_id, now).await?;
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queue_position.cmp(&b.queue_position))
        });

        let mut claimed = Vec::new();
        for mut entry in candidates {
            if claimed.len() >= max_items {
                break;
            }
            if !self
                .limiter
                .try_acquire(tenant_id, &policy.rate_limit, now)
                .await?
            {
                debug!(tenant = %tenant_id, "rate budget exhausted for this window");
                break;
            }

            let won = self
                .repo
                .transition(
                    entry.entry_id,
                    QueueStatus::Queued,
                    QueueStatus::Sending,
                    Patch::new().set("processed_at", now.to_rfc3339()),
                )
                .await?;
            if won {
                entry.queue_status = QueueStatus::Sending;
                entry.processed_at = Some(now);
                claimed.push(entry);
            } else {
                // Another dispatcher (or a cancellation) got here first;
                // give the budget unit back.
                self.limiter
                    .release(tenant_id, &policy.rate_limit, now)
                    .await?;
            }
        }

        if !claimed.is_empty() {
            info!(tenant = %tenant_id, batch = claimed.len(), "claimed dispatch batch");
        }
        Ok(claimed)
    }

    /// Reclaim entries stuck in `sending` beyond the tenant's timeout.
    ///
    /// A stale claim is treated as a failed attempt: requeued with backoff or
    /// terminally failed, through the same path the worker uses. Returns how
    /// many entries were swept.
    pub async fn sweep_stale(
        &self,
        tenant_id: TenantId,
        policy: &TenantPolicy,
    ) -> DomainResult<u64> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(policy.sending_timeout).unwrap_or_default();
        let stale = self.repo.list_stale_sending(tenant_id, cutoff).await?;

        let mut swept = 0;
        for entry in stale {
            warn!(
                entry = %entry.entry_id,
                lead = %entry.lead_id,
                claimed_at = ?entry.processed_at,
                "reclaiming stale sending entry"
            );
            if self
                .repo
                .record_failure(&entry, &policy.retry, "sending timed out", now)
                .await?
                .is_some()
            {
                swept += 1;
            }
        }
        Ok(swept)
    }

    pub fn repository(&self) -> &QueueRepository {
        &self.repo
    }
}
