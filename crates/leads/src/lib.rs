//! `leadline-leads` — the Lead model and its processing lifecycle.

pub mod lead;
pub mod migration;

pub use lead::{Lead, ProcessingState};
pub use migration::migrate_legacy_state;
