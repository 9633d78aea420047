//! # Custom Resource Definitions
//!
//! Declarative input types for the reconciliation controller.
//!
//! Units and secret templates live in the manifest snapshot next to the
//! resources they describe, and are converted into scheduler-owned
//! `ReconciliationUnit`s at load time.
//!
//! ## Module Structure
//!
//! - `reference.rs` - Unit identities and references
//! - `unit.rs` - The `Unit` CRD (a bundle of manifests under a source path)
//! - `secret_template.rs` - The `SecretTemplate` CRD (a materialized secret)
//! - `patch.rs` - Overlay patch specifications
//! - `health.rs` - Health check specifications and condition predicates
//! - `status.rs` - Per-unit status tracked by the controller

mod health;
mod patch;
mod reference;
mod secret_template;
mod status;
mod unit;

pub use health::{ConditionSpec, HealthCheckSpec};
pub use patch::{PatchOp, PatchOperation, PatchSpec, TargetSelector, ValueFrom};
pub use reference::{UnitId, UnitReference};
pub use secret_template::{SecretSourceRef, SecretTemplate, SecretTemplateSpec};
pub use status::{UnitState, UnitStatus};
pub use unit::{default_false, Unit, UnitSpec};
