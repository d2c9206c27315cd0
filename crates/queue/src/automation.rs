//! Per-tenant automation loop: prepare, dispatch, deliver.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use leadline_core::{DomainResult, TenantId, UserId};
use leadline_store::RecordStore;

use crate::dispatch::Dispatcher;
use crate::jobs::{JobQueue, PREPARE_QUEUE};
use crate::policy::TenantPolicy;
use crate::rate_limit::RateLimiter;
use crate::repository::{BatchOutcome, EnqueueRequest, QueueRepository};
use crate::worker::{DeliveryWorker, MessageSender};

/// Entries pulled per tick; keeps one tenant from starving the runtime.
const BATCH_SIZE: usize = 10;

/// Runs the automation loop for any number of tenants.
///
/// One tokio task per started tenant; `start` and `stop` are idempotent so
/// API retries are harmless.
pub struct AutomationRunner {
    repo: QueueRepository,
    dispatcher: Dispatcher,
    jobs: JobQueue,
    sender: Arc<dyn MessageSender>,
    running: Mutex<HashMap<TenantId, watch::Sender<bool>>>,
}

impl AutomationRunner {
    pub fn new(store: Arc<dyn RecordStore>, sender: Arc<dyn MessageSender>) -> Self {
        let repo = QueueRepository::new(store.clone());
        let dispatcher = Dispatcher::new(repo.clone(), RateLimiter::new(store.clone()));
        Self {
            repo,
            dispatcher,
            jobs: JobQueue::new(store),
            sender,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &QueueRepository {
        &self.repo
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Start the loop for a tenant. Returns `false` when it already runs.
    pub async fn start(self: &Arc<Self>, tenant_id: TenantId, policy: TenantPolicy) -> bool {
        let mut running = self.running.lock().await;
        if let Some(stop) = running.get(&tenant_id) {
            if !stop.is_closed() {
                debug!(tenant = %tenant_id, "automation already running");
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        running.insert(tenant_id, stop_tx);
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run_loop(tenant_id, policy, stop_rx).await;
        });
        info!(tenant = %tenant_id, "automation started");
        true
    }

    /// Stop the loop for a tenant. Returns `false` when it was not running.
    pub async fn stop(&self, tenant_id: TenantId) -> bool {
        let mut running = self.running.lock().await;
        match running.remove(&tenant_id) {
            Some(stop) => {
                let _ = stop.send(true);
                info!(tenant = %tenant_id, "automation stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, tenant_id: TenantId) -> bool {
        let running = self.running.lock().await;
        running.get(&tenant_id).is_some_and(|s| !s.is_closed())
    }

    async fn run_loop(
        self: Arc<Self>,
        tenant_id: TenantId,
        policy: TenantPolicy,
        mut stop: watch::Receiver<bool>,
    ) {
        let worker = DeliveryWorker::new(self.repo.clone(), Arc::clone(&self.sender));
        let mut ticker = tokio::time::interval(policy.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    debug!(tenant = %tenant_id, "automation loop exiting");
                    return;
                }
            }
            if let Err(err) = self.tick(tenant_id, &policy, &worker).await {
                // A failing store call delays work; the next tick retries.
                error!(tenant = %tenant_id, error = %err, "automation tick failed");
            }
        }
    }

    async fn tick(
        &self,
        tenant_id: TenantId,
        policy: &TenantPolicy,
        worker: &DeliveryWorker<Arc<dyn MessageSender>>,
    ) -> DomainResult<()> {
        let now = Utc::now();

        // Due background jobs first, so a prepared batch can go out this tick.
        while let Some(job) = self.jobs.claim_due(tenant_id, now).await? {
            let result = match job.kind.as_str() {
                PREPARE_QUEUE => self.prepare_batch(tenant_id, policy).await.map(|_| ()),
                other => Err(leadline_core::DomainError::invariant(format!(
                    "unknown job kind {other}"
                ))),
            };
            match result {
                Ok(()) => self.jobs.complete(job.job_id).await?,
                Err(err) => {
                    self.jobs
                        .fail(&job, &policy.retry, &err.to_string(), now)
                        .await?;
                }
            }
        }

        self.dispatcher.sweep_stale(tenant_id, policy).await?;

        let batch = self.dispatcher.pull_batch(tenant_id, policy, BATCH_SIZE).await?;
        for entry in &batch {
            worker.deliver(entry, policy).await?;
        }
        Ok(())
    }

    /// Enqueue every eligible lead of a tenant using its prepare config.
    ///
    /// Per-lead failures never abort the batch; callers get one outcome per
    /// lead.
    pub async fn prepare_batch(
        &self,
        tenant_id: TenantId,
        policy: &TenantPolicy,
    ) -> DomainResult<BatchOutcome> {
        let leads = self.repo.leads().list_eligible(tenant_id).await?;
        let requests: Vec<EnqueueRequest> = leads
            .into_iter()
            .map(|lead| EnqueueRequest {
                lead_id: lead.lead_id,
                client_id: tenant_id,
                user_id: UserId::system(),
                priority: policy.prepare.priority,
                message_type: policy.prepare.message_type.clone(),
                message_template: policy.prepare.message_template.clone(),
                message_content: policy.prepare.message_content.clone(),
                recipient_phone: lead.phone,
                scheduled_for: None,
            })
            .collect();
        let outcome = self.repo.enqueue_batch(requests).await?;
        info!(
            tenant = %tenant_id,
            created = outcome.created.len(),
            failed = outcome.failed.len(),
            "queue prepared"
        );
        Ok(outcome)
    }
}
