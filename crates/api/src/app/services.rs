use std::sync::Arc;

use async_trait::async_trait;

use leadline_core::PhoneNumber;
use leadline_queue::{
    AutomationRunner, MessageSender, QueueRepository, SendError, SendReceipt, TakeoverHandler,
    TenantPolicy,
};
use leadline_store::RecordStore;

/// Shared state behind every handler.
pub struct AppServices {
    store: Arc<dyn RecordStore>,
    runner: Arc<AutomationRunner>,
    policy: TenantPolicy,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sender: Arc<dyn MessageSender>,
        policy: TenantPolicy,
    ) -> Self {
        let runner = Arc::new(AutomationRunner::new(store.clone(), sender));
        Self {
            store,
            runner,
            policy,
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn runner(&self) -> &Arc<AutomationRunner> {
        &self.runner
    }

    pub fn repository(&self) -> &QueueRepository {
        self.runner.repository()
    }

    pub fn takeover(&self) -> TakeoverHandler {
        TakeoverHandler::new(self.repository().clone())
    }

    pub fn policy(&self) -> &TenantPolicy {
        &self.policy
    }
}

/// Sender that accepts everything and logs it. Stands in for the real
/// transport until one is wired up.
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(
        &self,
        phone: &PhoneNumber,
        template: &str,
        _content: &str,
    ) -> Result<SendReceipt, SendError> {
        tracing::info!(%phone, template, "logging sender accepted message");
        Ok(SendReceipt {
            message_id: format!("log-{}", uuid::Uuid::now_v7()),
        })
    }
}
