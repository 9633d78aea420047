//! # In-Memory Backends
//!
//! An in-process target system and a static secret source. Used for dry runs
//! (`TARGET_MODE=memory`), the offline CLI, and end-to-end tests.
//!
//! The target behaves like a server-side-apply API server in the ways the
//! reconciler can observe: `apply` replaces the declared fields but keeps the
//! live `status`, every write bumps `metadata.resourceVersion`, and deleting
//! an absent resource succeeds.

use crate::crd::{SecretSourceRef, UnitId};
use crate::manifest::{owner_of, ManifestDocument, ObservedResource, ResourceId};
use crate::provider::{
    SecretSourceError, SecretSourceProvider, SourceSecret, TargetError, TargetProvider,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use zeroize::Zeroizing;

/// A mutating call recorded by the in-memory target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOperation {
    Apply(ResourceId),
    Delete(ResourceId),
}

#[derive(Debug, Default)]
struct TargetState {
    resources: BTreeMap<ResourceId, Value>,
    unsupported_kinds: BTreeSet<String>,
    rejections: BTreeMap<ResourceId, String>,
    operations: Vec<TargetOperation>,
    latency: Duration,
    resource_version: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryTarget {
    state: Mutex<TargetState>,
}

impl InMemoryTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TargetState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Seed a resource directly, bypassing apply (e.g. a foreign resource)
    pub fn insert(&self, id: ResourceId, body: Value) {
        self.with_state(|s| {
            s.resources.insert(id, body);
        });
    }

    /// Overwrite a resource's `status`, as a workload controller would
    pub fn set_status(&self, id: &ResourceId, status: Value) {
        self.with_state(|s| {
            if let Some(Value::Object(body)) = s.resources.get_mut(id) {
                body.insert("status".to_string(), status);
            }
        });
    }

    /// Replace a field of a live resource, simulating out-of-band drift
    pub fn mutate(&self, id: &ResourceId, pointer: &str, value: Value) {
        self.with_state(|s| {
            if let Some(slot) = s.resources.get_mut(id).and_then(|b| b.pointer_mut(pointer)) {
                *slot = value;
            }
        });
    }

    pub fn remove(&self, id: &ResourceId) {
        self.with_state(|s| {
            s.resources.remove(id);
        });
    }

    pub fn mark_unsupported(&self, kind: impl Into<String>) {
        self.with_state(|s| {
            s.unsupported_kinds.insert(kind.into());
        });
    }

    /// Reject every apply of `id` with `reason` until cleared
    pub fn reject(&self, id: ResourceId, reason: impl Into<String>) {
        self.with_state(|s| {
            s.rejections.insert(id, reason.into());
        });
    }

    pub fn clear_rejection(&self, id: &ResourceId) {
        self.with_state(|s| {
            s.rejections.remove(id);
        });
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    #[must_use]
    pub fn resource(&self, id: &ResourceId) -> Option<Value> {
        self.with_state(|s| s.resources.get(id).cloned())
    }

    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.with_state(|s| s.resources.keys().cloned().collect())
    }

    #[must_use]
    pub fn operations(&self) -> Vec<TargetOperation> {
        self.with_state(|s| s.operations.clone())
    }

    pub fn clear_operations(&self) {
        self.with_state(|s| s.operations.clear());
    }

    async fn simulate_latency(&self) {
        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TargetProvider for InMemoryTarget {
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, TargetError> {
        self.simulate_latency().await;
        Ok(self.with_state(|s| {
            s.resources.get(id).map(|body| ObservedResource {
                id: id.clone(),
                body: body.clone(),
            })
        }))
    }

    async fn apply(&self, document: &ManifestDocument) -> Result<ObservedResource, TargetError> {
        self.simulate_latency().await;
        let id = document.id().clone();
        self.with_state(|s| {
            if s.unsupported_kinds.contains(&id.kind) {
                return Err(TargetError::Unsupported {
                    kind: id.kind.clone(),
                });
            }
            if let Some(reason) = s.rejections.get(&id) {
                return Err(TargetError::Rejected {
                    id: id.clone(),
                    reason: reason.clone(),
                });
            }

            let mut body = document.body().clone();
            let live_status = s.resources.get(&id).and_then(|b| b.get("status")).cloned();
            s.resource_version += 1;
            if let Value::Object(obj) = &mut body {
                if let (Some(status), false) = (live_status, obj.contains_key("status")) {
                    obj.insert("status".to_string(), status);
                }
                if let Some(Value::Object(metadata)) = obj.get_mut("metadata") {
                    metadata.insert(
                        "resourceVersion".to_string(),
                        Value::String(s.resource_version.to_string()),
                    );
                }
            }
            s.resources.insert(id.clone(), body.clone());
            s.operations.push(TargetOperation::Apply(id.clone()));
            Ok(ObservedResource { id, body })
        })
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), TargetError> {
        self.simulate_latency().await;
        self.with_state(|s| {
            s.resources.remove(id);
            s.operations.push(TargetOperation::Delete(id.clone()));
        });
        Ok(())
    }

    async fn list_owned(
        &self,
        owner: &UnitId,
        _kinds: &BTreeSet<String>,
    ) -> Result<Vec<ObservedResource>, TargetError> {
        self.simulate_latency().await;
        Ok(self.with_state(|s| {
            s.resources
                .iter()
                .filter(|(_, body)| owner_of(body).as_ref() == Some(owner))
                .map(|(id, body)| ObservedResource {
                    id: id.clone(),
                    body: body.clone(),
                })
                .collect()
        }))
    }
}

#[derive(Debug, Default)]
struct StaticEntry {
    generation: u64,
    fields: BTreeMap<String, String>,
}

/// Secret source backed by an in-process map
///
/// Sources are keyed by their resolved `namespace/name`.
#[derive(Debug, Default)]
pub struct StaticSecretSource {
    secrets: Mutex<BTreeMap<String, StaticEntry>>,
    latency: Mutex<Duration>,
}

impl StaticSecretSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a source secret's fields at `generation`
    pub fn set<I, K, V>(&self, source: &SecretSourceRef, generation: u64, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entry = StaticEntry {
            generation,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(source.to_string(), entry);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = latency;
    }
}

#[async_trait]
impl SecretSourceProvider for StaticSecretSource {
    async fn read(&self, source: &SecretSourceRef) -> Result<SourceSecret, SecretSourceError> {
        let key = source.to_string();
        // Snapshot before sleeping: a slow read returns what was current when it started
        let snapshot = {
            let secrets = self
                .secrets
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            secrets.get(&key).map(|entry| SourceSecret {
                generation: entry.generation,
                fields: entry
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Zeroizing::new(v.clone())))
                    .collect(),
            })
        };
        let latency = *self
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        snapshot.ok_or(SecretSourceError::NotFound(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(replicas: u64) -> ManifestDocument {
        ManifestDocument::from_value(
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "apps"},
                "spec": {"replicas": replicas}
            }),
            "apps",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_preserves_live_status() {
        let target = InMemoryTarget::new();
        let doc = deployment(2);
        target.apply(&doc).await.unwrap();
        target.set_status(doc.id(), json!({"readyReplicas": 2}));

        let observed = target.apply(&deployment(3)).await.unwrap();
        assert_eq!(observed.body["spec"]["replicas"], json!(3));
        assert_eq!(observed.body["status"]["readyReplicas"], json!(2));
        assert_eq!(observed.body["metadata"]["resourceVersion"], json!("2"));
    }

    #[tokio::test]
    async fn test_unsupported_and_rejected_applies() {
        let target = InMemoryTarget::new();
        target.mark_unsupported("Deployment");
        assert!(matches!(
            target.apply(&deployment(1)).await,
            Err(TargetError::Unsupported { .. })
        ));

        let target = InMemoryTarget::new();
        target.reject(deployment(1).id().clone(), "quota exceeded");
        assert!(matches!(
            target.apply(&deployment(1)).await,
            Err(TargetError::Rejected { .. })
        ));
        assert!(target.operations().is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let target = InMemoryTarget::new();
        let id = ResourceId::new("ConfigMap", "apps", "missing");
        assert!(target.delete(&id).await.is_ok());
        assert!(target.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_secret_source() {
        let source = StaticSecretSource::new();
        let reference = SecretSourceRef {
            name: "root".to_string(),
            namespace: Some("vault".to_string()),
        };
        assert!(matches!(
            source.read(&reference).await,
            Err(SecretSourceError::NotFound(_))
        ));

        source.set(&reference, 2, [("password", "s3cret")]);
        let secret = source.read(&reference).await.unwrap();
        assert_eq!(secret.generation, 2);
        assert_eq!(secret.fields["password"].as_str(), "s3cret");
    }
}
