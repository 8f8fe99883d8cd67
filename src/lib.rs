//! netgauge runs multi-phase network measurement sessions.
//!
//! A session measures latency, download throughput and upload throughput
//! against a transport endpoint, aggregates the raw samples into
//! statistics, sanity-checks the metrics and persists a single result
//! record. See [`session::SessionOrchestrator`] for the entry point.

pub mod config;
pub mod errors;
pub mod measurements;
pub mod probes;
pub mod results;
pub mod server;
pub mod session;
pub mod stats;
pub mod validation;
