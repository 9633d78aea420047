//! # Kubernetes Target
//!
//! Applies manifest documents with server-side apply. Kinds are resolved via
//! API discovery; the discovery result is cached and refreshed once on a miss
//! so that kinds introduced by a freshly applied CRD become usable.

use super::api_error_code;
use crate::constants::{OWNER_NAME_LABEL, OWNER_SCOPE_LABEL};
use crate::crd::UnitId;
use crate::manifest::{ManifestDocument, ObservedResource, ResourceId};
use crate::provider::{TargetError, TargetProvider};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::{ApiCapabilities, Discovery, Scope};
use kube::Client;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct KubeTarget {
    client: Client,
    field_manager: String,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl std::fmt::Debug for KubeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeTarget")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubeTarget {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            discovery: RwLock::new(None),
        }
    }

    async fn refresh_discovery(&self) -> Result<Arc<Discovery>, TargetError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| TargetError::Transport(format!("API discovery failed: {e}")))?;
        let discovery = Arc::new(discovery);
        *self.discovery.write().await = Some(Arc::clone(&discovery));
        info!("Refreshed API discovery");
        Ok(discovery)
    }

    fn find_kind(
        discovery: &Discovery,
        kind: &str,
        api_version: Option<&str>,
    ) -> Option<(ApiResource, ApiCapabilities)> {
        discovery.groups().find_map(|group| {
            group
                .recommended_resources()
                .into_iter()
                .chain(group.resources_by_stability())
                .find(|(ar, _)| {
                    ar.kind == kind && api_version.map_or(true, |v| ar.api_version == v)
                })
        })
    }

    /// Resolve a kind, optionally pinned to an apiVersion
    async fn resolve(
        &self,
        kind: &str,
        api_version: Option<&str>,
    ) -> Result<(ApiResource, ApiCapabilities), TargetError> {
        let cached = self.discovery.read().await.clone();
        if let Some(discovery) = cached {
            if let Some(found) = Self::find_kind(&discovery, kind, api_version) {
                return Ok(found);
            }
        }
        let discovery = self.refresh_discovery().await?;
        Self::find_kind(&discovery, kind, api_version).ok_or_else(|| TargetError::Unsupported {
            kind: kind.to_string(),
        })
    }

    fn api_for(&self, ar: &ApiResource, caps: &ApiCapabilities, scope: &str) -> Api<DynamicObject> {
        match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), ar),
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), scope, ar),
        }
    }

    fn observed(object: &DynamicObject, default_scope: &str) -> Result<ObservedResource, TargetError> {
        let body = serde_json::to_value(object)
            .map_err(|e| TargetError::Transport(format!("unreadable object: {e}")))?;
        let id = ResourceId::of(&body, default_scope)
            .ok_or_else(|| TargetError::Transport("object without kind or name".to_string()))?;
        Ok(ObservedResource { id, body })
    }
}

#[async_trait]
impl TargetProvider for KubeTarget {
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, TargetError> {
        let (ar, caps) = self.resolve(&id.kind, None).await?;
        let api = self.api_for(&ar, &caps, &id.scope);
        let object = api
            .get_opt(&id.name)
            .await
            .map_err(|e| TargetError::Transport(format!("get {id}: {e}")))?;
        object
            .map(|mut o| {
                o.types.get_or_insert_with(|| kube::core::TypeMeta {
                    api_version: ar.api_version.clone(),
                    kind: ar.kind.clone(),
                });
                // Cluster-scoped objects carry no namespace; keep the identity we asked for
                Self::observed(&o, &id.scope).map(|mut r| {
                    r.id = id.clone();
                    r
                })
            })
            .transpose()
    }

    async fn apply(&self, document: &ManifestDocument) -> Result<ObservedResource, TargetError> {
        let id = document.id();
        let (ar, caps) = self.resolve(&id.kind, document.api_version()).await?;
        let api = self.api_for(&ar, &caps, &id.scope);

        let mut body = document.body().clone();
        if let Some(obj) = body.as_object_mut() {
            obj.entry("apiVersion")
                .or_insert_with(|| serde_json::Value::String(ar.api_version.clone()));
        }

        let params = PatchParams::apply(&self.field_manager).force();
        let applied = api
            .patch(&id.name, &params, &Patch::Apply(&body))
            .await
            .map_err(|e| match api_error_code(&e) {
                Some(code) if (400..500).contains(&code) => TargetError::Rejected {
                    id: id.clone(),
                    reason: e.to_string(),
                },
                _ => TargetError::Transport(format!("apply {id}: {e}")),
            })?;
        debug!(resource = %id, "Applied resource");

        Self::observed(&applied, &id.scope).map(|mut r| {
            r.id = id.clone();
            r
        })
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), TargetError> {
        let (ar, caps) = self.resolve(&id.kind, None).await?;
        let api = self.api_for(&ar, &caps, &id.scope);
        match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if api_error_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(TargetError::DeleteFailed {
                id: id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn list_owned(
        &self,
        owner: &UnitId,
        kinds: &BTreeSet<String>,
    ) -> Result<Vec<ObservedResource>, TargetError> {
        let selector = format!(
            "{OWNER_NAME_LABEL}={},{OWNER_SCOPE_LABEL}={}",
            owner.name, owner.scope
        );
        let params = ListParams::default().labels(&selector);

        let mut owned = Vec::new();
        for kind in kinds {
            let (ar, caps) = match self.resolve(kind, None).await {
                Ok(found) => found,
                Err(TargetError::Unsupported { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !caps.supports_operation(kube::discovery::verbs::LIST) {
                continue;
            }
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            let list = api
                .list(&params)
                .await
                .map_err(|e| TargetError::Transport(format!("list {kind}: {e}")))?;
            for mut object in list.items {
                object.types.get_or_insert_with(|| kube::core::TypeMeta {
                    api_version: ar.api_version.clone(),
                    kind: ar.kind.clone(),
                });
                owned.push(Self::observed(&object, &owner.scope)?);
            }
        }
        Ok(owned)
    }
}
