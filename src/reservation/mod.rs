//! Reservation tracking and reconciliation with the external record.
//!
//! - [`context`]: Which workloads are reserved where, and their requests
//! - [`queue`]: Deduplicating, rate-limited reconcile queue
//! - [`record`]: The external per-node record and its store
//! - [`reconciler`]: Worker pool pushing reserved sets into records

pub mod context;
pub mod queue;
pub mod reconciler;
pub mod record;
