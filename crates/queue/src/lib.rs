//! `leadline-queue` — the lead/message processing queue.
//!
//! Enqueue leads, dispatch eligible entries in priority order within a
//! tenant's business window and rate budget, deliver through an external
//! message sender with bounded retries, and hand control to a human without
//! losing or duplicating messages.
//!
//! Every transition that matters for correctness is a conditional update at
//! the store (`queued → sending`, `sending → sent|failed`, `* → cancelled`),
//! so any number of dispatcher/worker instances can run against the same
//! store and a lost race is just a zero-row update.

pub mod automation;
pub mod dispatch;
pub mod entry;
pub mod export;
pub mod jobs;
pub mod policy;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod takeover;
pub mod window;
pub mod worker;

pub use automation::AutomationRunner;
pub use dispatch::Dispatcher;
pub use entry::{QueueEntry, QueueStatus};
pub use export::{export_queue, ExportFilter, ExportRow};
pub use jobs::{BackgroundJob, JobQueue, JobStatus, PREPARE_QUEUE};
pub use policy::{PrepareConfig, TenantPolicy};
pub use rate_limit::{RateLimit, RateLimiter};
pub use repository::{
    BatchOutcome, EnqueueRequest, FailedLead, LeadRepository, QueueRepository,
};
pub use retry::RetryPolicy;
pub use takeover::{TakeoverHandler, TakeoverResult};
pub use window::BusinessWindow;
pub use worker::{DeliveryWorker, MessageSender, SendError, SendOutcome, SendReceipt};
