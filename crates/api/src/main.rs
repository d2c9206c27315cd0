use std::sync::Arc;

use anyhow::Context;

use leadline_store::{PostgresStore, StoreRole};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leadline_observability::init();

    let policy = match std::env::var("LEADLINE_POLICY") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read policy file {path}"))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid policy file {path}"))?
        }
        Err(_) => leadline_queue::TenantPolicy::default(),
    };

    let store: Arc<dyn leadline_store::RecordStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PostgresStore::new(StoreRole::Site, pool);
            store.migrate().await.context("store migration failed")?;
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            leadline_store::InMemoryStore::site()
        }
    };

    let sender = Arc::new(leadline_api::app::services::LoggingSender);
    let app = leadline_api::app::build_app(store, sender, policy);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .context("failed to bind 0.0.0.0:8080")?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
