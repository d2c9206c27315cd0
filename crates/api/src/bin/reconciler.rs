//! Cross-store reconciliation loop.
//!
//! Runs off the hot path on a fixed interval: connects to both stores,
//! discovers tenants, and lets the reconciler repair drift tenant by tenant.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use leadline_core::TenantId;
use leadline_store::{Filter, PostgresStore, RecordStore, StoreRole, Table};
use leadline_sync::Reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leadline_observability::init();

    let site = connect("SITE_DATABASE_URL", StoreRole::Site).await?;
    let agent = connect("AGENT_DATABASE_URL", StoreRole::Agent).await?;

    let interval_secs = std::env::var("RECONCILE_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60u64);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    let reconciler = Reconciler::new(site.clone(), agent.clone());
    loop {
        ticker.tick().await;
        for tenant_id in tenants(site.as_ref(), agent.as_ref()).await? {
            if let Err(err) = reconciler.reconcile(tenant_id).await {
                tracing::error!(tenant = %tenant_id, error = %err, "reconciliation pass failed");
            }
        }
    }
}

async fn connect(var: &str, role: StoreRole) -> anyhow::Result<Arc<dyn RecordStore>> {
    let url = std::env::var(var).with_context(|| format!("{var} must be set"))?;
    let pool = sqlx::PgPool::connect(&url)
        .await
        .with_context(|| format!("failed to connect to {var}"))?;
    let store = PostgresStore::new(role, pool);
    store.migrate().await.context("store migration failed")?;
    Ok(Arc::new(store))
}

/// Every tenant either store knows about.
async fn tenants(
    site: &dyn RecordStore,
    agent: &dyn RecordStore,
) -> anyhow::Result<Vec<TenantId>> {
    let mut ids = BTreeSet::new();
    for store in [site, agent] {
        for table in [Table::Leads, Table::QueueEntries] {
            for record in store.get(table, &Filter::all()).await? {
                if let Some(raw) = record.str_field("client_id") {
                    if let Ok(id) = raw.parse::<TenantId>() {
                        ids.insert(id);
                    }
                }
            }
        }
    }
    Ok(ids.into_iter().collect())
}
