//! `leadline-store` — uniform record access over two physical stores.
//!
//! Leads, queue entries and background jobs live in two independently
//! operated stores ("Site" and "Agent") with identical schemas. Everything
//! above this crate talks to the [`RecordStore`] trait and never branches on
//! which store it holds; only the reconciler is allowed to look at both.
//!
//! Correctness under concurrent dispatchers hinges on [`RecordStore::update`]:
//! the filter doubles as a compare-and-set guard, and an affected-count of
//! zero means the caller lost a race and must not proceed.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use record::{Filter, FilterOp, Patch, Record, Table};

use async_trait::async_trait;

/// Which physical store a handle points at. Business logic never branches on
/// this; it exists for logging and for the reconciler's repair writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    Site,
    Agent,
}

impl core::fmt::Display for StoreRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreRole::Site => f.write_str("site"),
            StoreRole::Agent => f.write_str("agent"),
        }
    }
}

/// Row-oriented access to one physical store.
///
/// All writes are conditional: `update` and `delete` report how many rows
/// matched, and callers treat zero as a lost race, not an error.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Which store this handle points at.
    fn role(&self) -> StoreRole;

    /// Fetch all records matching the filter.
    async fn get(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Record>>;

    /// Insert new records. Fails with [`StoreError::Constraint`] on duplicate ids.
    async fn insert(&self, table: Table, rows: Vec<Record>) -> StoreResult<usize>;

    /// Apply a patch to every record matching the filter; returns the number
    /// of rows affected. A filter on the current status turns this into a
    /// compare-and-set.
    async fn update(&self, table: Table, filter: &Filter, patch: &Patch) -> StoreResult<u64>;

    /// Delete records matching the filter; returns the number of rows removed.
    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<u64>;
}
