//! Store-backed per-tenant send budgets.
//!
//! Dispatchers scale horizontally with no shared memory, so the budget lives
//! in the store: one counter document per tenant and window, advanced by a
//! compare-and-set on the expected count. Over-claiming is impossible by
//! construction — two dispatchers racing on the same count see one win and
//! one retry against the new value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use leadline_core::TenantId;
use leadline_store::{Filter, Patch, Record, RecordStore, StoreError, StoreResult, Table};

/// Budget configuration: at most `max_per_window` sends per `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_per_window: u32,
    #[serde(with = "secs")]
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_per_window: 60,
            window: Duration::from_secs(3600),
        }
    }
}

impl RateLimit {
    pub fn unlimited() -> Self {
        Self {
            max_per_window: u32::MAX,
            window: Duration::from_secs(3600),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_per_window == u32::MAX
    }

    /// Epoch-aligned start of the window containing `now`.
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.window.as_secs().max(1) as i64;
        let aligned = (now.timestamp() / secs) * secs;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(now)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Attempts before giving up on a contended counter.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Namespace for deriving counter ids from `(tenant_id, window_start)`.
const COUNTER_NAMESPACE: Uuid = Uuid::from_u128(0x8f9f7a44_c5d1_4b0e_9c3a_2d6e8b1f4a07);

/// Counter id for one tenant/window pair.
///
/// The id is the only uniqueness either store enforces, so it must be a
/// function of the window key: two dispatchers seeding the same window then
/// collide on the insert instead of each creating its own budget.
fn counter_id(tenant_id: TenantId, window_start: &str) -> Uuid {
    Uuid::new_v5(
        &COUNTER_NAMESPACE,
        format!("{tenant_id}/{window_start}").as_bytes(),
    )
}

/// Acquire/release send budget against one store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RecordStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Take one unit of budget. `Ok(false)` means the window is exhausted.
    pub async fn try_acquire(
        &self,
        tenant_id: TenantId,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if limit.is_unlimited() {
            return Ok(true);
        }
        if limit.max_per_window == 0 {
            return Ok(false);
        }

        let window_start = limit.window_start(now).to_rfc3339();
        let key = Filter::all()
            .eq("tenant_id", tenant_id.to_string())
            .eq("window_start", window_start.clone());

        for _ in 0..MAX_CAS_ATTEMPTS {
            let rows = self.store.get(Table::RateLimits, &key).await?;
            let Some(row) = rows.into_iter().next() else {
                let record = Record::new(
                    counter_id(tenant_id, &window_start),
                    json!({
                        "tenant_id": tenant_id.to_string(),
                        "window_start": window_start,
                        "count": 1,
                    }),
                );
                match self.store.insert(Table::RateLimits, vec![record]).await {
                    Ok(_) => return Ok(true),
                    // Another dispatcher created the counter first; re-read it.
                    Err(StoreError::Constraint(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            let count = row
                .field("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(u64::from(limit.max_per_window));
            if count >= u64::from(limit.max_per_window) {
                debug!(tenant = %tenant_id, count, "rate limit window exhausted");
                return Ok(false);
            }

            let affected = self
                .store
                .update(
                    Table::RateLimits,
                    &Filter::by_id(row.id).eq("count", count),
                    &Patch::new().set("count", count + 1),
                )
                .await?;
            if affected == 1 {
                return Ok(true);
            }
            // Lost the CAS; loop against the fresh count.
        }

        Err(StoreError::transient("rate limit counter contention"))
    }

    /// Refund one unit (used when a claim is lost after budget was taken).
    pub async fn release(
        &self,
        tenant_id: TenantId,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if limit.is_unlimited() {
            return Ok(());
        }
        let window_start = limit.window_start(now).to_rfc3339();
        let key = Filter::all()
            .eq("tenant_id", tenant_id.to_string())
            .eq("window_start", window_start);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let rows = self.store.get(Table::RateLimits, &key).await?;
            let Some(row) = rows.into_iter().next() else {
                return Ok(());
            };
            let count = row.field("count").and_then(|v| v.as_u64()).unwrap_or(0);
            if count == 0 {
                return Ok(());
            }
            let affected = self
                .store
                .update(
                    Table::RateLimits,
                    &Filter::by_id(row.id).eq("count", count),
                    &Patch::new().set("count", count - 1),
                )
                .await?;
            if affected == 1 {
                return Ok(());
            }
        }
        Err(StoreError::transient("rate limit counter contention"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadline_store::InMemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(InMemoryStore::site())
    }

    #[tokio::test]
    async fn budget_is_enforced() {
        let limiter = limiter();
        let tenant = TenantId::new();
        let limit = RateLimit {
            max_per_window: 2,
            window: Duration::from_secs(3600),
        };
        let now = Utc::now();

        assert!(limiter.try_acquire(tenant, &limit, now).await.unwrap());
        assert!(limiter.try_acquire(tenant, &limit, now).await.unwrap());
        assert!(!limiter.try_acquire(tenant, &limit, now).await.unwrap());
    }

    #[tokio::test]
    async fn windows_roll_over() {
        let limiter = limiter();
        let tenant = TenantId::new();
        let limit = RateLimit {
            max_per_window: 1,
            window: Duration::from_secs(60),
        };
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 30).unwrap();

        assert!(limiter.try_acquire(tenant, &limit, now).await.unwrap());
        assert!(!limiter.try_acquire(tenant, &limit, now).await.unwrap());

        let next_window = now + chrono::Duration::seconds(60);
        assert!(limiter.try_acquire(tenant, &limit, next_window).await.unwrap());
    }

    #[tokio::test]
    async fn tenants_do_not_share_budget() {
        let limiter = limiter();
        let limit = RateLimit {
            max_per_window: 1,
            window: Duration::from_secs(3600),
        };
        let now = Utc::now();

        assert!(limiter.try_acquire(TenantId::new(), &limit, now).await.unwrap());
        assert!(limiter.try_acquire(TenantId::new(), &limit, now).await.unwrap());
    }

    #[tokio::test]
    async fn release_refunds_budget() {
        let limiter = limiter();
        let tenant = TenantId::new();
        let limit = RateLimit {
            max_per_window: 1,
            window: Duration::from_secs(3600),
        };
        let now = Utc::now();

        assert!(limiter.try_acquire(tenant, &limit, now).await.unwrap());
        limiter.release(tenant, &limit, now).await.unwrap();
        assert!(limiter.try_acquire(tenant, &limit, now).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquirers_share_a_fresh_window_budget() {
        let store: Arc<InMemoryStore> = InMemoryStore::site();
        let tenant = TenantId::new();
        let limit = RateLimit {
            max_per_window: 1,
            window: Duration::from_secs(3600),
        };
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = RateLimiter::new(store.clone());
            let limit = limit.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire(tenant, &limit, now).await.unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);

        // All acquirers converged on one counter row, not one each.
        let rows = store
            .get(
                Table::RateLimits,
                &Filter::all().eq("tenant_id", tenant.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = limiter();
        let tenant = TenantId::new();
        let limit = RateLimit::unlimited();
        for _ in 0..100 {
            assert!(limiter.try_acquire(tenant, &limit, Utc::now()).await.unwrap());
        }
    }
}
