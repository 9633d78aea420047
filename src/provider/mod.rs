//! # Provider Modules
//!
//! Capability interfaces the core calls into, and their backends.
//!
//! - `TargetProvider`: get/apply/delete against the orchestration layer
//! - `SecretSourceProvider`: reads restricted source secrets
//!
//! Backends:
//! - `memory`: in-process target and static secret source
//! - `kubernetes`: server-side apply against a live cluster, `Secret` sources

use crate::crd::{SecretSourceRef, UnitId};
use crate::manifest::{ManifestDocument, ObservedResource, ResourceId};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod common;
pub mod kubernetes;
pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("kind {kind} is not supported by the target")]
    Unsupported { kind: String },
    #[error("apply of {id} rejected: {reason}")]
    Rejected { id: ResourceId, reason: String },
    #[error("delete of {id} failed: {reason}")]
    DeleteFailed { id: ResourceId, reason: String },
    #[error("target transport error: {0}")]
    Transport(String),
    #[error("target call timed out after {0:?}")]
    Timeout(Duration),
}

/// The orchestration layer the reconciler drives
///
/// `apply` must be idempotent; `delete` of an absent resource succeeds.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    /// Fetch the current state of a resource, `None` when it does not exist
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, TargetError>;

    /// Create or update a resource and return its resulting state
    async fn apply(&self, document: &ManifestDocument) -> Result<ObservedResource, TargetError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), TargetError>;

    /// Resources carrying `owner`'s labels
    ///
    /// `kinds` is a hint for backends that must query per kind.
    async fn list_owned(
        &self,
        owner: &UnitId,
        kinds: &BTreeSet<String>,
    ) -> Result<Vec<ObservedResource>, TargetError>;
}

/// A source secret at one generation. Values are wiped on drop.
pub struct SourceSecret {
    pub generation: u64,
    pub fields: BTreeMap<String, Zeroizing<String>>,
}

impl std::fmt::Debug for SourceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSecret")
            .field("generation", &self.generation)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretSourceError {
    #[error("source secret {0} not found")]
    NotFound(String),
    #[error("source secret {secret} is unreadable: {reason}")]
    Unreadable { secret: String, reason: String },
    #[error("secret source transport error: {0}")]
    Transport(String),
}

/// Read access to restricted source secrets
#[async_trait]
pub trait SecretSourceProvider: Send + Sync {
    async fn read(&self, source: &SecretSourceRef) -> Result<SourceSecret, SecretSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_secret_debug_hides_values() {
        let secret = SourceSecret {
            generation: 3,
            fields: BTreeMap::from([(
                "password".to_string(),
                Zeroizing::new("hunter2".to_string()),
            )]),
        };
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
    }
}
