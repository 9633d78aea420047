//! # Runtime
//!
//! Process bootstrap for the controller binary.
//!
//! - `initialization`: rustls, tracing, metrics, backends, HTTP server
//! - `run_loop`: snapshot polling, source secret watch, shutdown handling

pub mod initialization;
pub mod run_loop;
