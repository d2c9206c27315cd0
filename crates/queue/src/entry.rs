//! Queue entry and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadline_core::{EntryId, LeadId, PhoneNumber, TenantId, UserId};

/// Delivery lifecycle of a queue entry.
///
/// `queued → sending → {sent, failed}`; any non-terminal state can be
/// cancelled by human takeover; `failed` returns to `queued` while retries
/// remain. Workers never write a status blindly: every transition is guarded
/// by the expected current status at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Sending => "sending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// The allowed-edges table. Any transition not listed is rejected.
    pub fn can_transition(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Queued, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                // Failed attempt rescheduled for retry.
                | (Sending, Queued)
                | (Failed, Queued)
                | (Queued, Cancelled)
                | (Sending, Cancelled)
                | (Failed, Cancelled)
        )
    }

    /// Terminal states never move again. `failed` is only effectively
    /// terminal once retries are exhausted, so it stays non-terminal here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Cancelled)
    }

    /// States that count against the single-active-entry invariant.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Sending)
    }

    /// Everything a takeover cancellation applies to.
    pub const NON_TERMINAL: [QueueStatus; 3] =
        [QueueStatus::Queued, QueueStatus::Sending, QueueStatus::Failed];

    /// States counted by the single-active-entry check at enqueue time.
    pub const IN_FLIGHT: [QueueStatus; 2] = [QueueStatus::Queued, QueueStatus::Sending];
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled outbound message tied to one lead.
///
/// Entries are never deleted; terminal entries are retained for audit and
/// export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: EntryId,
    pub lead_id: LeadId,
    pub client_id: TenantId,
    /// Assigning actor; `UserId::system()` for automated enqueues.
    pub user_id: UserId,
    /// Tenant-scoped, monotonically assigned; stable tie-break within a priority.
    pub queue_position: u64,
    /// Higher sends first.
    pub priority: i32,
    pub queue_status: QueueStatus,
    /// Earliest eligible send time.
    pub scheduled_for: DateTime<Utc>,
    pub message_type: String,
    pub message_template: String,
    pub message_content: String,
    pub recipient_phone: PhoneNumber,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Provider-issued message id, recorded when a send is accepted.
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When a dispatcher claimed the entry (`queued → sending`).
    pub processed_at: Option<DateTime<Utc>>,
    /// When the provider accepted the message.
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_edges_only() {
        use QueueStatus::*;
        assert!(Queued.can_transition(Sending));
        assert!(Sending.can_transition(Sent));
        assert!(Sending.can_transition(Failed));
        assert!(Sending.can_transition(Queued));
        assert!(Failed.can_transition(Queued));
        for from in QueueStatus::NON_TERMINAL {
            assert!(from.can_transition(Cancelled));
        }

        // Terminal states never move.
        assert!(!Sent.can_transition(Queued));
        assert!(!Sent.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Queued));
        assert!(!Cancelled.can_transition(Sending));
        // No skipping the claim step.
        assert!(!Queued.can_transition(Sent));
        assert!(!Queued.can_transition(Failed));
    }

    #[test]
    fn in_flight_set_matches_invariant() {
        assert!(QueueStatus::Queued.is_in_flight());
        assert!(QueueStatus::Sending.is_in_flight());
        assert!(!QueueStatus::Failed.is_in_flight());
        assert!(!QueueStatus::Sent.is_in_flight());
        assert!(!QueueStatus::Cancelled.is_in_flight());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&QueueStatus::Sending).unwrap(),
            "\"sending\""
        );
        assert_eq!(QueueStatus::Cancelled.as_str(), "cancelled");
    }
}
