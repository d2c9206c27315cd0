//! Flat export of queue entries joined with their leads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use leadline_core::{DomainResult, LeadId, TenantId};
use leadline_leads::Lead;
use leadline_store::{Filter, RecordStore, Table};

use crate::entry::{QueueEntry, QueueStatus};

/// What to include in an export.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<QueueStatus>,
}

/// One exported row, ready for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub entry_id: String,
    pub lead_name: String,
    pub phone: String,
    pub status: QueueStatus,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub message_content: String,
}

/// Export queue entries with lead details attached.
///
/// Entries whose lead has disappeared are skipped rather than failing the
/// whole export. An empty queue exports as an empty vec.
pub async fn export_queue(
    store: &dyn RecordStore,
    filter: &ExportFilter,
) -> DomainResult<Vec<ExportRow>> {
    let mut entry_filter = Filter::all();
    if let Some(tenant_id) = filter.tenant_id {
        entry_filter = entry_filter.eq("client_id", tenant_id.to_string());
    }
    if let Some(status) = filter.status {
        entry_filter = entry_filter.eq("queue_status", status.as_str());
    }

    let entries: Vec<QueueEntry> = store
        .get(Table::QueueEntries, &entry_filter)
        .await?
        .into_iter()
        .map(|r| r.to_entity::<QueueEntry>().map_err(Into::into))
        .collect::<DomainResult<_>>()?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let mut lead_filter = Filter::all();
    if let Some(tenant_id) = filter.tenant_id {
        lead_filter = lead_filter.eq("client_id", tenant_id.to_string());
    }
    let leads: HashMap<LeadId, Lead> = store
        .get(Table::Leads, &lead_filter)
        .await?
        .into_iter()
        .map(|r| r.to_entity::<Lead>().map_err(Into::into))
        .collect::<DomainResult<Vec<Lead>>>()?
        .into_iter()
        .map(|lead| (lead.lead_id, lead))
        .collect();

    let mut rows: Vec<ExportRow> = entries
        .into_iter()
        .filter_map(|entry| {
            let lead = leads.get(&entry.lead_id)?;
            Some(ExportRow {
                entry_id: entry.entry_id.to_string(),
                lead_name: lead.name.clone(),
                phone: lead.phone.to_string(),
                status: entry.queue_status,
                priority: entry.priority,
                scheduled_for: entry.scheduled_for,
                message_content: entry.message_content,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{EnqueueRequest, QueueRepository};
    use leadline_core::{PhoneNumber, UserId};
    use leadline_store::InMemoryStore;
    use std::sync::Arc;

    fn phone(last: &str) -> PhoneNumber {
        PhoneNumber::parse(&format!("+1415555{last}")).unwrap()
    }

    #[tokio::test]
    async fn empty_queue_exports_empty() {
        let store = InMemoryStore::site();
        let rows = export_queue(store.as_ref(), &ExportFilter::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn export_joins_lead_fields_and_honors_filters() {
        let store: Arc<InMemoryStore> = InMemoryStore::site();
        let repo = QueueRepository::new(store.clone());
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        for (tenant, name, last) in [(tenant_a, "Ada", "0001"), (tenant_b, "Grace", "0002")] {
            let lead = Lead::new(tenant, name, phone(last));
            let lead_id = lead.lead_id;
            repo.leads().insert(&lead).await.unwrap();
            repo.enqueue(EnqueueRequest {
                lead_id,
                client_id: tenant,
                user_id: UserId::system(),
                priority: 2,
                message_type: "followup".into(),
                message_template: "intro_v1".into(),
                message_content: format!("Hello {name}"),
                recipient_phone: phone(last),
                scheduled_for: None,
            })
            .await
            .unwrap();
        }

        let rows = export_queue(
            store.as_ref(),
            &ExportFilter {
                tenant_id: Some(tenant_a),
                status: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lead_name, "Ada");
        assert_eq!(rows[0].phone, "+14155550001");
        assert_eq!(rows[0].status, QueueStatus::Queued);
        assert_eq!(rows[0].message_content, "Hello Ada");

        // Status filter that matches nothing.
        let rows = export_queue(
            store.as_ref(),
            &ExportFilter {
                tenant_id: Some(tenant_a),
                status: Some(QueueStatus::Sent),
            },
        )
        .await
        .unwrap();
        assert!(rows.is_empty());
    }
}
