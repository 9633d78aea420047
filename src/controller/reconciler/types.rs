//! # Reconciler Types
//!
//! Pass-level errors and the report a successful pass hands back.

use crate::controller::compositor::PatchError;
use crate::controller::secrets::MaterializeError;
use crate::manifest::ResourceId;
use crate::provider::TargetError;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a reconciliation pass
///
/// Resource-scoped problems (malformed or unsupported documents) are not
/// errors here; they are collected in `PassReport::resource_errors`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcilerError {
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
    #[error("reading {id} failed: {source}")]
    Observe { id: ResourceId, source: TargetError },
    #[error("apply of {id} failed: {source}")]
    Apply { id: ResourceId, source: TargetError },
    #[error("listing owned resources failed: {0}")]
    List(TargetError),
    #[error("prune of {id} failed: {source}")]
    Delete { id: ResourceId, source: TargetError },
    #[error("health check '{check}' did not pass within {timeout:?}: {last_observation}")]
    HealthCheckTimeout {
        check: String,
        timeout: Duration,
        last_observation: String,
    },
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error("no valid resources: {0}")]
    NoValidResources(String),
    #[error("pass exceeded its timeout of {0:?}")]
    Timeout(Duration),
    #[error("pass cancelled")]
    Cancelled,
}

impl ReconcilerError {
    /// A cancelled pass leaves status as it was before the pass started
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ReconcilerError::Cancelled | ReconcilerError::Materialize(MaterializeError::Cancelled)
        )
    }
}

/// What a successful pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Resources this unit now owns on the target
    pub inventory: Vec<ResourceId>,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
    /// Per-resource failures that did not end the pass, keyed by resource
    pub resource_errors: BTreeMap<String, String>,
    /// A secret unit committed new rendered content
    pub outputs_changed: bool,
}

impl PassReport {
    /// Number of resources written this pass
    #[must_use]
    pub fn applied(&self) -> usize {
        self.created + self.updated
    }
}
