//! HTTP server exposing the admission engine.
//!
//! - [`api`]: Request/response types and route handlers

pub mod api;
