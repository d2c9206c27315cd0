//! `leadline-sync` — cross-store reconciliation.
//!
//! Tenant data is readable and writable from two independently-operated
//! stores (site and agent). The reconciler runs off the hot path, compares
//! both sides row by row and repairs divergence with read-then-conditional
//! writes, so it never blocks dispatchers or workers.

pub mod reconciler;

pub use reconciler::{ReconReport, Reconciler, RowDiff};
