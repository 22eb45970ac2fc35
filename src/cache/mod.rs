//! Per-node bandwidth accounting.
//!
//! - [`bandwidth`]: Bandwidth triples and quantity parsing
//! - [`ledger`]: Device and NodeLedger built from reported device sets
//! - [`store`]: BandwidthCache, the node → ledger map with two-level locking
//! - [`handle`]: Admission, commit and release against a node's default device

pub mod bandwidth;
pub mod handle;
pub mod ledger;
pub mod store;
