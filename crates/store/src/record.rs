//! Records, tables, filters and patches.
//!
//! A record is a JSON document keyed by UUID. Filters and patches operate on
//! top-level document fields by name, which keeps the two physical stores
//! schema-identical and lets the in-memory and Postgres adapters share one
//! contract.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// The closed set of tables the queue subsystem persists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Table {
    Leads,
    QueueEntries,
    Jobs,
    RateLimits,
    Counters,
}

impl Table {
    /// Physical table name. Static, so adapters can splice it into SQL
    /// without any injection surface.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Leads => "leads",
            Table::QueueEntries => "queue_entries",
            Table::Jobs => "background_jobs",
            Table::RateLimits => "rate_limits",
            Table::Counters => "counters",
        }
    }

    pub const ALL: [Table; 5] = [
        Table::Leads,
        Table::QueueEntries,
        Table::Jobs,
        Table::RateLimits,
        Table::Counters,
    ];
}

impl core::fmt::Display for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// One stored row: a JSON object plus its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Uuid,
    pub doc: Value,
}

impl Record {
    pub fn new(id: Uuid, doc: Value) -> Self {
        Self { id, doc }
    }

    /// Serialize a domain entity into a record.
    pub fn from_entity<T: Serialize>(id: Uuid, entity: &T) -> StoreResult<Self> {
        let doc = serde_json::to_value(entity)
            .map_err(|e| StoreError::permanent(format!("serialize record: {e}")))?;
        if !doc.is_object() {
            return Err(StoreError::permanent("record document must be a JSON object"));
        }
        Ok(Self { id, doc })
    }

    /// Deserialize the document back into a domain entity.
    pub fn to_entity<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.doc.clone())
            .map_err(|e| StoreError::permanent(format!("deserialize record {}: {e}", self.id)))
    }

    /// Look up a top-level field. `"id"` resolves to the record id.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.id.to_string()));
        }
        self.doc.get(name).cloned()
    }

    pub fn str_field(&self, name: &str) -> Option<String> {
        match self.field(name) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// Comparison applied to one document field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    /// Less-than-or-equal. Numbers compare numerically; strings compare
    /// lexicographically (RFC3339 UTC timestamps order correctly this way).
    Lte(Value),
    Gte(Value),
    In(Vec<Value>),
}

/// Conjunction of field conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conds: Vec<(String, FilterOp)>,
}

impl Filter {
    /// Match all rows.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self::all().eq("id", id.to_string())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conds.push((field.into(), FilterOp::Eq(value.into())));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conds.push((field.into(), FilterOp::Ne(value.into())));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conds.push((field.into(), FilterOp::Lte(value.into())));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conds.push((field.into(), FilterOp::Gte(value.into())));
        self
    }

    pub fn any_of(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.conds.push((
            field.into(),
            FilterOp::In(values.into_iter().map(Into::into).collect()),
        ));
        self
    }

    pub fn conditions(&self) -> &[(String, FilterOp)] {
        &self.conds
    }

    pub fn is_empty(&self) -> bool {
        self.conds.is_empty()
    }

    /// Evaluate the filter against a record (used by the in-memory adapter).
    pub fn matches(&self, record: &Record) -> bool {
        self.conds.iter().all(|(field, op)| {
            let actual = record.field(field);
            match op {
                FilterOp::Eq(v) => actual.as_ref() == Some(v),
                FilterOp::Ne(v) => actual.as_ref() != Some(v),
                FilterOp::Lte(v) => actual.map_or(false, |a| compare(&a, v).map_or(false, |o| o.is_le())),
                FilterOp::Gte(v) => actual.map_or(false, |a| compare(&a, v).map_or(false, |o| o.is_ge())),
                FilterOp::In(vs) => actual.map_or(false, |a| vs.contains(&a)),
            }
        })
    }
}

fn compare(a: &Value, b: &Value) -> Option<core::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// Set of top-level fields to overwrite on matching documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    fields: Vec<(String, Value)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Apply the patch to a document in place.
    pub fn apply(&self, doc: &mut Value) {
        if let Value::Object(map) = doc {
            for (field, value) in &self.fields {
                map.insert(field.clone(), value.clone());
            }
        }
    }

    /// Render as a JSON object (what Postgres merges into the document).
    pub fn to_object(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (field, value) in &self.fields {
            map.insert(field.clone(), value.clone());
        }
        Value::Object(map)
    }
}
