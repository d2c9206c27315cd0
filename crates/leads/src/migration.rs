//! One-time migration of legacy processing-state labels.
//!
//! Older validation scripts wrote a different vocabulary
//! (`new_lead/processing/ai_analysis/...`). The canonical set is the one in
//! [`ProcessingState`]; the legacy labels are accepted here and nowhere else.
//! Stores are migrated once, then only canonical labels are read.

use leadline_store::{Filter, Patch, RecordStore, StoreResult, Table};
use tracing::{info, warn};

use crate::lead::ProcessingState;

/// Map a legacy label to the canonical state. Canonical labels pass through,
/// unknown labels return `None` and must be reviewed manually.
pub fn migrate_legacy_state(raw: &str) -> Option<ProcessingState> {
    let state = match raw {
        // Legacy vocabulary.
        "new_lead" => ProcessingState::Pending,
        "processing" => ProcessingState::Queued,
        "ai_analysis" => ProcessingState::Active,
        "qualified" | "closed" => ProcessingState::Completed,
        "rejected" => ProcessingState::Failed,
        "dormant" => ProcessingState::Archived,
        // Already canonical.
        "pending" => ProcessingState::Pending,
        "queued" => ProcessingState::Queued,
        "active" => ProcessingState::Active,
        "completed" => ProcessingState::Completed,
        "failed" => ProcessingState::Failed,
        "archived" => ProcessingState::Archived,
        _ => return None,
    };
    Some(state)
}

/// Outcome of one bulk migration pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: u64,
    pub already_canonical: u64,
    pub unknown: u64,
}

/// Rewrite every legacy `processing_state` label in one store.
///
/// Unknown labels are left untouched and counted; they surface in the report
/// rather than being guessed into a canonical state.
pub async fn migrate_store(store: &dyn RecordStore) -> StoreResult<MigrationReport> {
    let mut report = MigrationReport::default();
    let rows = store.get(Table::Leads, &Filter::all()).await?;

    for row in rows {
        let Some(raw) = row.str_field("processing_state") else {
            report.unknown += 1;
            warn!(store = %store.role(), lead = %row.id, "lead missing processing_state");
            continue;
        };
        match migrate_legacy_state(&raw) {
            Some(state) if state.as_str() == raw => report.already_canonical += 1,
            Some(state) => {
                // Guard on the old label so a concurrent writer is never clobbered.
                let affected = store
                    .update(
                        Table::Leads,
                        &Filter::by_id(row.id).eq("processing_state", raw.as_str()),
                        &Patch::new().set("processing_state", state.as_str()),
                    )
                    .await?;
                report.migrated += affected;
            }
            None => {
                report.unknown += 1;
                warn!(store = %store.role(), lead = %row.id, label = %raw, "unknown processing_state label");
            }
        }
    }

    info!(
        store = %store.role(),
        migrated = report.migrated,
        already_canonical = report.already_canonical,
        unknown = report.unknown,
        "lead state migration pass complete"
    );
    Ok(report)
}
