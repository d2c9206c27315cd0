//! Pairwise diff-and-repair between the site and agent stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadline_core::{DomainResult, TenantId};
use leadline_queue::QueueStatus;
use leadline_store::{Filter, Patch, Record, RecordStore, StoreError, Table};

/// Classification of one id across the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDiff {
    Consistent,
    MissingInSite,
    MissingInAgent,
    Diverged,
}

/// Per-pass outcome counts, one report per tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconReport {
    pub consistent: u64,
    pub copied_to_site: u64,
    pub copied_to_agent: u64,
    pub lww_repaired: u64,
    /// Divergence the reconciler refuses to patch (logged, left in place).
    pub conflicts: u64,
    /// Older duplicates of concurrently-`sending` entries, cancelled in both
    /// stores.
    pub duplicate_sends_cancelled: u64,
}

/// Compares leads and queue entries across both stores and repairs drift.
///
/// Field divergence resolves last-write-wins on `updated_at`; missing rows
/// are copied to the store lacking them. Every repair is a conditional write
/// so a hot-path update that lands mid-pass wins and the repair is skipped.
pub struct Reconciler {
    site: Arc<dyn RecordStore>,
    agent: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(site: Arc<dyn RecordStore>, agent: Arc<dyn RecordStore>) -> Self {
        Self { site, agent }
    }

    /// One full pass over a tenant's leads and queue entries.
    pub async fn reconcile(&self, tenant_id: TenantId) -> DomainResult<ReconReport> {
        let mut report = ReconReport::default();
        for table in [Table::Leads, Table::QueueEntries] {
            self.reconcile_table(table, tenant_id, &mut report).await?;
        }
        self.cancel_duplicate_sends(tenant_id, &mut report).await?;
        info!(
            tenant = %tenant_id,
            consistent = report.consistent,
            copied_to_site = report.copied_to_site,
            copied_to_agent = report.copied_to_agent,
            lww_repaired = report.lww_repaired,
            conflicts = report.conflicts,
            duplicates = report.duplicate_sends_cancelled,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    async fn reconcile_table(
        &self,
        table: Table,
        tenant_id: TenantId,
        report: &mut ReconReport,
    ) -> DomainResult<()> {
        let filter = Filter::all().eq("client_id", tenant_id.to_string());
        let site_rows = index_by_id(self.site.get(table, &filter).await?);
        let agent_rows = index_by_id(self.agent.get(table, &filter).await?);

        let mut ids: Vec<Uuid> = site_rows.keys().chain(agent_rows.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        for id in ids {
            match classify(site_rows.get(&id), agent_rows.get(&id)) {
                RowDiff::Consistent => report.consistent += 1,
                RowDiff::MissingInSite => {
                    let row = &agent_rows[&id];
                    if copy_row(self.site.as_ref(), table, row).await? {
                        debug!(%table, %id, "copied row to site");
                        report.copied_to_site += 1;
                    }
                }
                RowDiff::MissingInAgent => {
                    let row = &site_rows[&id];
                    if copy_row(self.agent.as_ref(), table, row).await? {
                        debug!(%table, %id, "copied row to agent");
                        report.copied_to_agent += 1;
                    }
                }
                RowDiff::Diverged => {
                    self.repair_diverged(table, &site_rows[&id], &agent_rows[&id], report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn repair_diverged(
        &self,
        table: Table,
        site_row: &Record,
        agent_row: &Record,
        report: &mut ReconReport,
    ) -> DomainResult<()> {
        // Two terminal sends that disagree on when (or whether) the message
        // went out cannot be merged by timestamp; an operator has to look.
        if table == Table::QueueEntries && terminal_send_conflict(site_row, agent_row) {
            warn!(
                entry = %site_row.id,
                site_sent_at = site_row.str_field("sent_at").unwrap_or_default(),
                agent_sent_at = agent_row.str_field("sent_at").unwrap_or_default(),
                "terminal entries disagree on sent_at, leaving both in place"
            );
            report.conflicts += 1;
            return Ok(());
        }

        // RFC 3339 UTC timestamps order lexicographically.
        let site_ts = site_row.str_field("updated_at").unwrap_or_default();
        let agent_ts = agent_row.str_field("updated_at").unwrap_or_default();
        let (winner, loser_store, loser_ts) = if site_ts >= agent_ts {
            (site_row, self.agent.as_ref(), agent_ts)
        } else {
            (agent_row, self.site.as_ref(), site_ts)
        };

        let filter = Filter::by_id(winner.id).eq("updated_at", loser_ts);
        let affected = loser_store
            .update(table, &filter, &patch_from_doc(winner)?)
            .await?;
        if affected > 0 {
            report.lww_repaired += 1;
        } else {
            // The losing side moved on while we compared; next pass re-checks.
            debug!(%table, id = %winner.id, "row changed mid-repair, skipping");
        }
        Ok(())
    }

    /// A lead must never have two entries in `sending` at once, across stores
    /// included. Silently dropping one could hide a message the customer
    /// already received, so the older entry is cancelled and the conflict
    /// logged.
    async fn cancel_duplicate_sends(
        &self,
        tenant_id: TenantId,
        report: &mut ReconReport,
    ) -> DomainResult<()> {
        let filter = Filter::all()
            .eq("client_id", tenant_id.to_string())
            .eq("queue_status", QueueStatus::Sending.as_str());
        let mut entries = index_by_id(self.site.get(Table::QueueEntries, &filter).await?);
        for (id, row) in index_by_id(self.agent.get(Table::QueueEntries, &filter).await?) {
            entries.entry(id).or_insert(row);
        }

        let mut by_lead: HashMap<String, Vec<&Record>> = HashMap::new();
        for row in entries.values() {
            if let Some(lead_id) = row.str_field("lead_id") {
                by_lead.entry(lead_id).or_default().push(row);
            }
        }

        let now = Utc::now().to_rfc3339();
        for (lead_id, mut rows) in by_lead {
            if rows.len() < 2 {
                continue;
            }
            // Newest claim survives; everything older is a duplicate.
            rows.sort_by_key(|r| r.str_field("processed_at").unwrap_or_default());
            let survivor = rows.pop().map(|r| r.id);
            for dup in rows {
                warn!(
                    lead = lead_id,
                    entry = %dup.id,
                    survivor = ?survivor,
                    "duplicate in-flight send, cancelling older entry"
                );
                let filter = Filter::by_id(dup.id)
                    .eq("queue_status", QueueStatus::Sending.as_str());
                let patch = Patch::new()
                    .set("queue_status", QueueStatus::Cancelled.as_str())
                    .set("last_error", "duplicate in-flight send")
                    .set("updated_at", now.clone());
                let mut cancelled = 0;
                cancelled += self.site.update(Table::QueueEntries, &filter, &patch).await?;
                cancelled += self.agent.update(Table::QueueEntries, &filter, &patch).await?;
                if cancelled > 0 {
                    report.duplicate_sends_cancelled += 1;
                }
            }
        }
        Ok(())
    }
}

fn index_by_id(rows: Vec<Record>) -> BTreeMap<Uuid, Record> {
    rows.into_iter().map(|r| (r.id, r)).collect()
}

fn classify(site: Option<&Record>, agent: Option<&Record>) -> RowDiff {
    match (site, agent) {
        (Some(s), Some(a)) if s.doc == a.doc => RowDiff::Consistent,
        (Some(_), Some(_)) => RowDiff::Diverged,
        (None, Some(_)) => RowDiff::MissingInSite,
        (Some(_), None) => RowDiff::MissingInAgent,
        (None, None) => RowDiff::Consistent,
    }
}

fn terminal_send_conflict(site_row: &Record, agent_row: &Record) -> bool {
    site_row.str_field("queue_status").as_deref() == Some(QueueStatus::Sent.as_str())
        && agent_row.str_field("queue_status").as_deref() == Some(QueueStatus::Sent.as_str())
        && site_row.field("sent_at") != agent_row.field("sent_at")
}

/// Whole-document patch: the winner's fields overwrite the loser's.
fn patch_from_doc(winner: &Record) -> DomainResult<Patch> {
    let obj = winner
        .doc
        .as_object()
        .ok_or_else(|| leadline_core::DomainError::store("record document is not an object"))?;
    let mut patch = Patch::new();
    for (field, value) in obj {
        patch = patch.set(field.clone(), value.clone());
    }
    Ok(patch)
}

async fn copy_row(dest: &dyn RecordStore, table: Table, row: &Record) -> DomainResult<bool> {
    match dest.insert(table, vec![row.clone()]).await {
        Ok(_) => Ok(true),
        // Someone wrote the row concurrently; the next pass diffs it.
        Err(StoreError::Constraint(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadline_core::{LeadId, PhoneNumber};
    use leadline_leads::Lead;
    use leadline_store::InMemoryStore;
    use serde_json::json;

    fn stores() -> (Arc<InMemoryStore>, Arc<InMemoryStore>, Reconciler) {
        let site = InMemoryStore::site();
        let agent = InMemoryStore::agent();
        let reconciler = Reconciler::new(site.clone(), agent.clone());
        (site, agent, reconciler)
    }

    fn lead_record(tenant: TenantId, name: &str, updated_at: &str) -> Record {
        let mut lead = Lead::new(tenant, name, PhoneNumber::parse("+14155550111").unwrap());
        lead.updated_at = updated_at.parse().unwrap();
        Record::from_entity(*lead.lead_id.as_uuid(), &lead).unwrap()
    }

    fn sending_entry(
        tenant: TenantId,
        lead_id: LeadId,
        processed_at: &str,
    ) -> Record {
        Record::new(
            Uuid::now_v7(),
            json!({
                "client_id": tenant.to_string(),
                "lead_id": lead_id.to_string(),
                "queue_status": "sending",
                "processed_at": processed_at,
                "updated_at": processed_at,
            }),
        )
    }

    #[tokio::test]
    async fn divergent_rows_converge_to_the_later_write() {
        let (site, agent, reconciler) = stores();
        let tenant = TenantId::new();

        let older = lead_record(tenant, "Ada", "2026-08-01T10:00:00Z");
        let mut newer = older.clone();
        newer.doc["name"] = json!("Ada Lovelace");
        newer.doc["updated_at"] = json!("2026-08-02T10:00:00Z");

        site.insert(Table::Leads, vec![older]).await.unwrap();
        agent.insert(Table::Leads, vec![newer.clone()]).await.unwrap();

        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report.lww_repaired, 1);
        assert_eq!(report.conflicts, 0);

        for store in [&site, &agent] {
            let rows = store
                .get(Table::Leads, &Filter::by_id(newer.id))
                .await
                .unwrap();
            assert_eq!(rows[0].str_field("name").as_deref(), Some("Ada Lovelace"));
            assert_eq!(
                rows[0].str_field("updated_at").as_deref(),
                Some("2026-08-02T10:00:00Z")
            );
        }

        // Second pass finds nothing to do.
        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report.lww_repaired, 0);
        assert_eq!(report.consistent, 1);
    }

    #[tokio::test]
    async fn missing_rows_are_copied_both_ways() {
        let (site, agent, reconciler) = stores();
        let tenant = TenantId::new();

        let only_site = lead_record(tenant, "Ada", "2026-08-01T10:00:00Z");
        let only_agent = lead_record(tenant, "Grace", "2026-08-01T11:00:00Z");
        site.insert(Table::Leads, vec![only_site.clone()]).await.unwrap();
        agent.insert(Table::Leads, vec![only_agent.clone()]).await.unwrap();

        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report.copied_to_agent, 1);
        assert_eq!(report.copied_to_site, 1);

        for store in [&site, &agent] {
            for record in [&only_site, &only_agent] {
                let rows = store
                    .get(Table::Leads, &Filter::by_id(record.id))
                    .await
                    .unwrap();
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].doc, record.doc);
            }
        }
    }

    #[tokio::test]
    async fn older_duplicate_sending_entry_is_cancelled_in_both_stores() {
        let (site, agent, reconciler) = stores();
        let tenant = TenantId::new();
        let lead_id = LeadId::new();

        let older = sending_entry(tenant, lead_id, "2026-08-01T10:00:00Z");
        let newer = sending_entry(tenant, lead_id, "2026-08-01T10:05:00Z");
        // Both stores carry both claims (already copied by an earlier pass).
        site.insert(Table::QueueEntries, vec![older.clone(), newer.clone()])
            .await
            .unwrap();
        agent
            .insert(Table::QueueEntries, vec![older.clone(), newer.clone()])
            .await
            .unwrap();

        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report.duplicate_sends_cancelled, 1);

        for store in [&site, &agent] {
            let rows = store
                .get(Table::QueueEntries, &Filter::by_id(older.id))
                .await
                .unwrap();
            assert_eq!(rows[0].str_field("queue_status").as_deref(), Some("cancelled"));
            assert_eq!(
                rows[0].str_field("last_error").as_deref(),
                Some("duplicate in-flight send")
            );
            let rows = store
                .get(Table::QueueEntries, &Filter::by_id(newer.id))
                .await
                .unwrap();
            assert_eq!(rows[0].str_field("queue_status").as_deref(), Some("sending"));
        }
    }

    #[tokio::test]
    async fn terminal_sent_at_disagreement_is_a_conflict_not_a_repair() {
        let (site, agent, reconciler) = stores();
        let tenant = TenantId::new();
        let id = Uuid::now_v7();

        let doc = |sent_at: &str| {
            json!({
                "client_id": tenant.to_string(),
                "lead_id": LeadId::new().to_string(),
                "queue_status": "sent",
                "sent_at": sent_at,
                "updated_at": sent_at,
            })
        };
        let site_doc = doc("2026-08-01T10:00:00Z");
        let agent_doc = doc("2026-08-01T10:07:00Z");
        site.insert(Table::QueueEntries, vec![Record::new(id, site_doc.clone())])
            .await
            .unwrap();
        agent
            .insert(Table::QueueEntries, vec![Record::new(id, agent_doc.clone())])
            .await
            .unwrap();

        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.lww_repaired, 0);

        // Neither side was patched.
        let site_rows = site
            .get(Table::QueueEntries, &Filter::by_id(id))
            .await
            .unwrap();
        assert_eq!(site_rows[0].doc, site_doc);
        let agent_rows = agent
            .get(Table::QueueEntries, &Filter::by_id(id))
            .await
            .unwrap();
        assert_eq!(agent_rows[0].doc, agent_doc);
    }

    #[tokio::test]
    async fn other_tenants_are_untouched() {
        let (site, agent, reconciler) = stores();
        let tenant = TenantId::new();
        let other = TenantId::new();

        let foreign = lead_record(other, "Elsewhere", "2026-08-01T10:00:00Z");
        site.insert(Table::Leads, vec![foreign.clone()]).await.unwrap();

        let report = reconciler.reconcile(tenant).await.unwrap();
        assert_eq!(report, ReconReport::default());
        assert!(agent
            .get(Table::Leads, &Filter::by_id(foreign.id))
            .await
            .unwrap()
            .is_empty());
    }
}
