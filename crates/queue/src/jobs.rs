//! Persisted background jobs (queue preparation and friends).
//!
//! Jobs live in the same stores as queue entries, so claiming one is the
//! same conditional-update primitive: a compare-and-set on the status field
//! that at most one runner can win.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use leadline_core::{DomainResult, JobId, TenantId};
use leadline_store::{Filter, Patch, RecordStore, Table};

use crate::retry::RetryPolicy;

/// The one built-in job kind: enqueue tomorrow's batch for a tenant.
pub const PREPARE_QUEUE: &str = "prepare_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    /// Failed at least once, waiting for its backoff to elapse.
    Retry,
    Active,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Retry => "retry",
            JobStatus::Active => "active",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub job_id: JobId,
    pub client_id: TenantId,
    pub kind: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundJob {
    pub fn new(client_id: TenantId, kind: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            client_id,
            kind: kind.into(),
            status: JobStatus::Pending,
            attempts: 0,
            scheduled_for,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Store-backed job queue shared by all runners of a tenant.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn RecordStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn schedule(&self, job: &BackgroundJob) -> DomainResult<()> {
        let record = leadline_store::Record::from_entity(*job.job_id.as_uuid(), job)?;
        self.store.insert(Table::Jobs, vec![record]).await?;
        debug!(job = %job.job_id, kind = %job.kind, at = %job.scheduled_for, "job scheduled");
        Ok(())
    }

    /// Claim the next due job for a tenant, if any.
    ///
    /// The claim is a compare-and-set from `pending`/`retry` to `active`, so
    /// a job is handed to at most one runner even with several loops ticking.
    pub async fn claim_due(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<BackgroundJob>> {
        let due = self
            .store
            .get(
                Table::Jobs,
                &Filter::all()
                    .eq("client_id", tenant_id.to_string())
                    .any_of(
                        "status",
                        [JobStatus::Pending.as_str(), JobStatus::Retry.as_str()],
                    )
                    .lte("scheduled_for", now.to_rfc3339()),
            )
            .await?;
        let mut jobs: Vec<BackgroundJob> = due
            .into_iter()
            .map(|r| r.to_entity::<BackgroundJob>().map_err(Into::into))
            .collect::<DomainResult<_>>()?;
        jobs.sort_by_key(|j| j.scheduled_for);

        for job in jobs {
            let filter = Filter::by_id(*job.job_id.as_uuid()).any_of(
                "status",
                [JobStatus::Pending.as_str(), JobStatus::Retry.as_str()],
            );
            let patch = Patch::new()
                .set("status", JobStatus::Active.as_str())
                .set("updated_at", now.to_rfc3339());
            if self.store.update(Table::Jobs, &filter, &patch).await? > 0 {
                let mut claimed = job;
                claimed.status = JobStatus::Active;
                return Ok(Some(claimed));
            }
            // Another runner took this one; try the next.
        }
        Ok(None)
    }

    pub async fn complete(&self, job_id: JobId) -> DomainResult<()> {
        let filter =
            Filter::by_id(*job_id.as_uuid()).eq("status", JobStatus::Active.as_str());
        let patch = Patch::new()
            .set("status", JobStatus::Done.as_str())
            .set("updated_at", Utc::now().to_rfc3339());
        self.store.update(Table::Jobs, &filter, &patch).await?;
        Ok(())
    }

    /// Record a handler failure: back off and retry, or fail for good.
    pub async fn fail(
        &self,
        job: &BackgroundJob,
        retry: &RetryPolicy,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<JobStatus> {
        let attempts = job.attempts + 1;
        let (status, patch) = if retry.should_retry(attempts) {
            let next = now + chrono::Duration::from_std(retry.backoff(attempts)).unwrap_or_default();
            (
                JobStatus::Retry,
                Patch::new()
                    .set("status", JobStatus::Retry.as_str())
                    .set("attempts", attempts)
                    .set("last_error", reason)
                    .set("scheduled_for", next.to_rfc3339())
                    .set("updated_at", now.to_rfc3339()),
            )
        } else {
            warn!(job = %job.job_id, kind = %job.kind, attempts, reason, "job failed permanently");
            (
                JobStatus::Failed,
                Patch::new()
                    .set("status", JobStatus::Failed.as_str())
                    .set("attempts", attempts)
                    .set("last_error", reason)
                    .set("updated_at", now.to_rfc3339()),
            )
        };
        let filter =
            Filter::by_id(*job.job_id.as_uuid()).eq("status", JobStatus::Active.as_str());
        self.store.update(Table::Jobs, &filter, &patch).await?;
        Ok(status)
    }

    pub async fn get(&self, job_id: JobId) -> DomainResult<Option<BackgroundJob>> {
        let rows = self
            .store
            .get(Table::Jobs, &Filter::by_id(*job_id.as_uuid()))
            .await?;
        rows.into_iter()
            .next()
            .map(|r| r.to_entity::<BackgroundJob>().map_err(Into::into))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadline_store::InMemoryStore;

    #[tokio::test]
    async fn claim_respects_schedule_and_is_exclusive() {
        let queue = JobQueue::new(InMemoryStore::site());
        let tenant = TenantId::new();
        let now = Utc::now();

        let future = BackgroundJob::new(tenant, PREPARE_QUEUE, now + chrono::Duration::hours(1));
        let due = BackgroundJob::new(tenant, PREPARE_QUEUE, now - chrono::Duration::minutes(1));
        queue.schedule(&future).await.unwrap();
        queue.schedule(&due).await.unwrap();

        let claimed = queue.claim_due(tenant, now).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, due.job_id);
        assert_eq!(claimed.status, JobStatus::Active);

        // Nothing else is due, and the claimed job cannot be claimed twice.
        assert!(queue.claim_due(tenant, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_runners_claim_a_job_once() {
        let queue = JobQueue::new(InMemoryStore::site());
        let tenant = TenantId::new();
        let now = Utc::now();
        let job = BackgroundJob::new(tenant, PREPARE_QUEUE, now - chrono::Duration::minutes(1));
        queue.schedule(&job).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.claim_due(tenant, now).await.unwrap()
            }));
        }
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn failed_job_retries_with_backoff_then_fails() {
        let queue = JobQueue::new(InMemoryStore::site());
        let tenant = TenantId::new();
        let retry = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let now = Utc::now();
        let job = BackgroundJob::new(tenant, PREPARE_QUEUE, now - chrono::Duration::minutes(1));
        queue.schedule(&job).await.unwrap();

        let claimed = queue.claim_due(tenant, now).await.unwrap().unwrap();
        let status = queue.fail(&claimed, &retry, "store hiccup", now).await.unwrap();
        assert_eq!(status, JobStatus::Retry);
        let after = queue.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(after.attempts, 1);
        assert!(after.scheduled_for > now);

        // Second failure exhausts max_retries = 2.
        let claimed = queue
            .claim_due(tenant, after.scheduled_for)
            .await
            .unwrap()
            .unwrap();
        let status = queue.fail(&claimed, &retry, "store hiccup", now).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(queue
            .get(job.job_id)
            .await
            .unwrap()
            .unwrap()
            .status
            .is_terminal());
    }

    #[tokio::test]
    async fn completed_job_is_done() {
        let queue = JobQueue::new(InMemoryStore::site());
        let tenant = TenantId::new();
        let now = Utc::now();
        let job = BackgroundJob::new(tenant, PREPARE_QUEUE, now);
        queue.schedule(&job).await.unwrap();

        let claimed = queue.claim_due(tenant, now).await.unwrap().unwrap();
        queue.complete(claimed.job_id).await.unwrap();
        let after = queue.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Done);
    }
}
