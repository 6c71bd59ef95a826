//! HTTP server exposing cache statistics.
//!
//! - [`stats_api`]: Stats snapshot types and route handlers

pub mod stats_api;
