//! # Observability
//!
//! - `metrics`: Prometheus metrics
//! - `logging`: tracing subscriber setup

pub mod logging;
pub mod metrics;
