//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use gitops_reconciler::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

pub use crate::manifest::{ManifestDocument, ObservedResource, ResourceId};

// Capability interfaces and the in-process backends
pub use crate::provider::memory::{InMemoryTarget, StaticSecretSource};
pub use crate::provider::{SecretSourceError, SecretSourceProvider, TargetError, TargetProvider};

pub use crate::source::{DirectorySource, Snapshot, SnapshotSource};

// Core controller types
pub use crate::controller::compositor::{compose, PatchError};
pub use crate::controller::loader::{load_units, LoadError, ReconciliationUnit};
pub use crate::controller::reconciler::{PassReport, Reconciler, ReconcilerError};
pub use crate::controller::runtime::{Controller, ControllerError, ControllerSettings};
pub use crate::controller::scheduler::DependencyGraph;
pub use crate::controller::secrets::{MaterializeError, SecretPipeline};
pub use crate::controller::status::{StatusAggregator, StatusView};

pub use crate::config::{ControllerConfig, ServerConfig};
