//! # Controller
//!
//! Core reconciliation modules.
//!
//! - `backoff`: Fibonacci backoff for snapshot fetch retries
//! - `validation`: Kubernetes name and duration validation
//! - `loader`: Snapshot documents to validated reconciliation units
//! - `scheduler`: Dependency graph and eligibility
//! - `compositor`: Overlay patch composition
//! - `reconciler`: One pass of one unit against the target
//! - `secrets`: Secret materialization pipeline
//! - `status`: Status aggregation and the ordering invariant
//! - `runtime`: The tick-driven dispatch loop
//! - `server`: HTTP server for metrics, probes and status

pub mod backoff;
pub mod compositor;
pub mod loader;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod secrets;
pub mod server;
pub mod status;
pub mod validation;
