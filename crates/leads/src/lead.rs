//! Lead entity and processing-state lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadline_core::{LeadId, PhoneNumber, TenantId};

/// Automation lifecycle of a lead.
///
/// This governs eligibility for automated enqueue only; the business
/// qualification label lives in [`Lead::status`] and is not owned here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Created by lead intake, not yet in any queue.
    Pending,
    /// Has an automated queue entry waiting to be sent.
    Queued,
    /// Under human control (takeover) or mid-conversation.
    Active,
    /// Automation finished successfully.
    Completed,
    /// Automation exhausted retries; needs operator attention.
    Failed,
    /// Removed from active work, retained for audit.
    Archived,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Queued => "queued",
            ProcessingState::Active => "active",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
            ProcessingState::Archived => "archived",
        }
    }

    /// Whether an automated enqueue may pick this lead up.
    pub fn eligible_for_enqueue(&self) -> bool {
        matches!(self, ProcessingState::Pending)
    }

    /// Allowed-edges table for the lifecycle. Anything not listed here is
    /// rejected by the repositories.
    pub fn can_transition(self, next: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Active)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Active, Completed)
                | (Active, Failed)
                // Human takeover can claim a lead from any non-archived state.
                | (Pending, Active)
                | (Failed, Active)
                | (Completed, Active)
                // Takeover release / archive paths.
                | (Active, Pending)
                | (Failed, Pending)
                | (Completed, Archived)
                | (Failed, Archived)
                | (Active, Archived)
                | (Pending, Archived)
        )
    }
}

/// A lead as persisted in either store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub lead_id: LeadId,
    pub client_id: TenantId,
    pub name: String,
    pub phone: PhoneNumber,
    pub processing_state: ProcessingState,
    /// Business qualification label (free-form, owned by the CRM, not the queue).
    pub status: String,
    pub interaction_count: u32,
    pub last_interaction: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(client_id: TenantId, name: impl Into<String>, phone: PhoneNumber) -> Self {
        Self {
            lead_id: LeadId::new(),
            client_id,
            name: name.into(),
            phone,
            processing_state: ProcessingState::Pending,
            status: String::new(),
            interaction_count: 0,
            last_interaction: None,
            updated_at: Utc::now(),
        }
    }

    /// Record one send attempt against this lead.
    pub fn record_interaction(&mut self, at: DateTime<Utc>) {
        self.interaction_count += 1;
        self.last_interaction = Some(at);
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("+14155550123").unwrap()
    }

    #[test]
    fn new_lead_starts_pending_and_eligible() {
        let lead = Lead::new(TenantId::new(), "Ada", phone());
        assert_eq!(lead.processing_state, ProcessingState::Pending);
        assert!(lead.processing_state.eligible_for_enqueue());
        assert_eq!(lead.interaction_count, 0);
    }

    #[test]
    fn transition_table_is_closed() {
        use ProcessingState::*;
        assert!(Pending.can_transition(Queued));
        assert!(Queued.can_transition(Active));
        assert!(Failed.can_transition(Active));
        // No path back out of archived; no skipping intake.
        assert!(!Archived.can_transition(Pending));
        assert!(!Archived.can_transition(Active));
        assert!(!Completed.can_transition(Queued));
    }

    #[test]
    fn interaction_bookkeeping() {
        let mut lead = Lead::new(TenantId::new(), "Ada", phone());
        let at = Utc::now();
        lead.record_interaction(at);
        lead.record_interaction(at);
        assert_eq!(lead.interaction_count, 2);
        assert_eq!(lead.last_interaction, Some(at));
    }

    #[test]
    fn states_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProcessingState::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessingState::Archived).unwrap(),
            "\"archived\""
        );
    }
}
