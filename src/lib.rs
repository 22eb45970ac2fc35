//! diskio-aware: disk I/O bandwidth admission for cluster schedulers.
//!
//! Tracks per-node, per-device read/write/total bandwidth, admits workloads
//! only onto nodes with enough spare bandwidth on every dimension, scores
//! nodes by relative pressure, and mirrors reservations into an external
//! per-node record through an asynchronous, rate-limited reconcile queue.

pub mod cache;
pub mod config;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod normalizer;
pub mod reservation;
pub mod scorer;
pub mod server;
