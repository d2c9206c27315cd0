//! Human takeover: a person assumes the conversation and automation backs off.

use tracing::info;

use leadline_core::{DomainError, DomainResult, LeadId, UserId};
use leadline_leads::ProcessingState;

use crate::repository::QueueRepository;

/// What a takeover did.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TakeoverResult {
    pub lead_id: LeadId,
    /// Queue entries cancelled as part of the takeover.
    pub cancelled_entries: u64,
    /// False when the lead was already under human control.
    pub state_changed: bool,
}

/// Moves a lead to `active` and cancels its pending automation.
pub struct TakeoverHandler {
    repo: QueueRepository,
}

impl TakeoverHandler {
    pub fn new(repo: QueueRepository) -> Self {
        Self { repo }
    }

    /// Take over a lead on behalf of `user_id`.
    ///
    /// Idempotent: repeating the call cancels nothing further and reports
    /// `state_changed: false`. A message already accepted by the provider is
    /// not retracted; the guarantee is that no further automated messages go
    /// out for this lead.
    pub async fn take_over(
        &self,
        lead_id: LeadId,
        user_id: UserId,
    ) -> DomainResult<TakeoverResult> {
        let Some(lead) = self.repo.leads().get(lead_id).await? else {
            return Err(DomainError::not_found());
        };
        if lead.processing_state == ProcessingState::Archived {
            return Err(DomainError::invariant(format!(
                "lead {lead_id} is archived and cannot be taken over"
            )));
        }

        let state_changed = self
            .repo
            .leads()
            .set_processing_state(
                lead_id,
                &[
                    ProcessingState::Pending,
                    ProcessingState::Queued,
                    ProcessingState::Completed,
                    ProcessingState::Failed,
                ],
                ProcessingState::Active,
            )
            .await?;

        // Cancellation is the authoritative half: once these conditional
        // updates land, no worker transition can overwrite them.
        let cancelled = self.repo.cancel(lead_id, "taken over by human").await?;

        info!(
            lead = %lead_id,
            user = %user_id,
            cancelled,
            state_changed,
            "lead taken over"
        );
        Ok(TakeoverResult {
            lead_id,
            cancelled_entries: cancelled,
            state_changed,
        })
    }
}
