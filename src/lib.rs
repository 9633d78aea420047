//! GitOps Reconciler Library
//!
//! Dependency-aware declarative reconciliation: units of desired state are
//! ordered by their declared dependencies, composed from base manifests and
//! overlay patches, applied to a target, pruned, health-gated, and reported
//! through a single status view.
//!
//! ## Quick Start
//!
//! ```rust
//! use gitops_reconciler::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod manifest;
pub mod observability;
pub mod prelude;
pub mod provider;
pub mod runtime;
pub mod source;
