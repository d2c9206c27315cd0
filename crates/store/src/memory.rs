//! In-memory store for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::record::{Filter, Patch, Record, Table};
use crate::{RecordStore, StoreRole};

/// In-memory [`RecordStore`].
///
/// Each call takes the table lock for its full duration, so `update` with a
/// status filter is a real compare-and-set: concurrent claimants serialize on
/// the lock and only one sees the expected status.
#[derive(Debug)]
pub struct InMemoryStore {
    role: StoreRole,
    tables: RwLock<HashMap<Table, BTreeMap<Uuid, serde_json::Value>>>,
}

impl InMemoryStore {
    pub fn new(role: StoreRole) -> Self {
        Self {
            role,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn site() -> Arc<Self> {
        Arc::new(Self::new(StoreRole::Site))
    }

    pub fn agent() -> Arc<Self> {
        Arc::new(Self::new(StoreRole::Agent))
    }

    fn lock_poisoned() -> StoreError {
        StoreError::permanent("store lock poisoned")
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn get(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Record>> {
        let tables = self.tables.read().map_err(|_| Self::lock_poisoned())?;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .map(|(id, doc)| Record::new(*id, doc.clone()))
            .filter(|r| filter.matches(r))
            .collect())
    }

    async fn insert(&self, table: Table, rows: Vec<Record>) -> StoreResult<usize> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let stored = tables.entry(table).or_default();
        // Reject the whole call before touching anything: inserts are all-or-nothing
        // at the adapter level; batch tolerance lives in the repository.
        for row in &rows {
            if stored.contains_key(&row.id) {
                return Err(StoreError::constraint(format!(
                    "duplicate id {} in {table}",
                    row.id
                )));
            }
        }
        let count = rows.len();
        for row in rows {
            stored.insert(row.id, row.doc);
        }
        Ok(count)
    }

    async fn update(&self, table: Table, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let Some(stored) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let mut affected = 0;
        for (id, doc) in stored.iter_mut() {
            let record = Record::new(*id, doc.clone());
            if filter.matches(&record) {
                patch.apply(doc);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<u64> {
        let mut tables = self.tables.write().map_err(|_| Self::lock_poisoned())?;
        let Some(stored) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|id, doc| !filter.matches(&Record::new(*id, doc.clone())));
        Ok((before - stored.len()) as u64)
    }
}
