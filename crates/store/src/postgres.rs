//! Postgres-backed record store.
//!
//! Each logical table is `(id UUID PRIMARY KEY, doc JSONB NOT NULL)`. Filters
//! project top-level document fields as text (`doc->>'field'`), numbers get a
//! numeric cast, and patches merge with the `||` JSONB operator inside a
//! single filtered `UPDATE` — so the compare-and-set contract holds at the
//! database, not in application code.
//!
//! ## Error mapping
//!
//! | sqlx error | Mapped to |
//! |------------|-----------|
//! | Database, code `23505` (unique violation) | `StoreError::Constraint` |
//! | Database, other codes | `StoreError::Permanent` |
//! | `Io`, `PoolTimedOut`, `PoolClosed` | `StoreError::Transient` |
//! | anything else | `StoreError::Permanent` |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::record::{Filter, FilterOp, Patch, Record, Table};
use crate::{RecordStore, StoreRole};

/// Postgres [`RecordStore`]. Cheap to clone; shares one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    role: StoreRole,
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(role: StoreRole, pool: PgPool) -> Self {
        Self {
            role,
            pool: Arc::new(pool),
        }
    }

    /// Create the backing tables if they do not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        for table in Table::ALL {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id UUID PRIMARY KEY, \
                 doc JSONB NOT NULL\
                 )",
                table.name()
            );
            sqlx::query(&ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    fn push_filter(
        builder: &mut QueryBuilder<'_, Postgres>,
        filter: &Filter,
    ) -> StoreResult<()> {
        if filter.is_empty() {
            return Ok(());
        }
        builder.push(" WHERE ");
        let mut first = true;
        for (field, op) in filter.conditions() {
            validate_field(field)?;
            if !first {
                builder.push(" AND ");
            }
            first = false;
            match op {
                FilterOp::Eq(v) => {
                    push_projection(builder, field, v);
                    builder.push(" = ");
                    push_value(builder, v);
                }
                FilterOp::Ne(v) => {
                    push_projection(builder, field, v);
                    builder.push(" <> ");
                    push_value(builder, v);
                }
                FilterOp::Lte(v) => {
                    push_projection(builder, field, v);
                    builder.push(" <= ");
                    push_value(builder, v);
                }
                FilterOp::Gte(v) => {
                    push_projection(builder, field, v);
                    builder.push(" >= ");
                    push_value(builder, v);
                }
                FilterOp::In(vs) => {
                    push_projection(builder, field, vs.first().unwrap_or(&Value::Null));
                    builder.push(" = ANY(");
                    let rendered: Vec<String> = vs.iter().map(render_text).collect();
                    builder.push_bind(rendered);
                    builder.push(")");
                }
            }
        }
        Ok(())
    }
}

/// Project a document field in a way that matches the comparison value's type.
fn push_projection(builder: &mut QueryBuilder<'_, Postgres>, field: &str, value: &Value) {
    if field == "id" {
        builder.push("id::text");
    } else if value.is_number() {
        builder.push(format!("(doc->>'{field}')::numeric"));
    } else {
        builder.push(format!("doc->>'{field}'"));
    }
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    if let Some(n) = value.as_f64() {
        builder.push_bind(n);
    } else {
        builder.push_bind(render_text(value));
    }
}

/// Text rendering used for `doc->>` comparisons: bare string for strings,
/// JSON text for everything else.
fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_field(field: &str) -> StoreResult<()> {
    let valid = !field.is_empty()
        && field
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::permanent(format!(
            "invalid filter field name: {field:?}"
        )))
    }
}

fn row_to_record(row: PgRow) -> StoreResult<Record> {
    let id: Uuid = row
        .try_get("id")
        .map_err(|e| StoreError::permanent(format!("missing id column: {e}")))?;
    let doc: Value = row
        .try_get("doc")
        .map_err(|e| StoreError::permanent(format!("missing doc column: {e}")))?;
    Ok(Record::new(id, doc))
}

#[async_trait]
impl RecordStore for PostgresStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn get(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Record>> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT id, doc FROM {}", table.name()));
        Self::push_filter(&mut builder, filter)?;

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn insert(&self, table: Table, rows: Vec<Record>) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (id, doc) ", table.name()));
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.id).push_bind(row.doc);
        });

        builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(count)
    }

    async fn update(&self, table: Table, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("UPDATE {} SET doc = doc || ", table.name()));
        builder.push_bind(patch.to_object());
        Self::push_filter(&mut builder, filter)?;

        let result = builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<u64> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("DELETE FROM {}", table.name()));
        Self::push_filter(&mut builder, filter)?;

        let result = builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Constraint(msg),
                _ => StoreError::Permanent(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => StoreError::Transient(format!("pool closed in {operation}")),
        other => StoreError::Permanent(format!("sqlx error in {operation}: {other}")),
    }
}
