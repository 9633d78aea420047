//! # SecretTemplate Spec
//!
//! A secret unit: reads a restricted source secret and materializes a
//! derived secret from a template.

use crate::crd::UnitReference;
use serde::{Deserialize, Serialize};

/// SecretTemplate Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: reconcile.gitops.io/v1
/// kind: SecretTemplate
/// metadata:
///   name: db-credentials
///   namespace: apps
/// spec:
///   sourceRef:
///     name: postgres-root
///     namespace: vault-sync
///   interval: 10m
///   template:
///     apiVersion: v1
///     kind: Secret
///     metadata:
///       name: db-credentials
///       namespace: apps
///     stringData:
///       url: "postgres://{{ .username }}:{{ .password }}@db:5432/app"
/// ```
#[derive(kube::CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "SecretTemplate",
    group = "reconcile.gitops.io",
    version = "v1",
    namespaced,
    status = "crate::crd::UnitStatus",
    shortname = "rst",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}, {"name":"Generation", "type":"integer", "jsonPath":".status.observedGeneration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplateSpec {
    /// The restricted secret whose fields feed the template
    pub source_ref: SecretSourceRef,
    /// Target document with `{{ .field }}` placeholders in string values
    #[schemars(with = "std::collections::BTreeMap<String, serde_json::Value>")]
    pub template: serde_json::Value,
    /// Pull refresh period, Kubernetes duration format
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<UnitReference>,
    #[serde(default = "crate::crd::default_false")]
    pub suspend: bool,
}

/// Reference to a source secret
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSourceRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl SecretSourceRef {
    /// Fill in the namespace from the owning unit's scope
    #[must_use]
    pub fn resolve(&self, default_scope: &str) -> SecretSourceRef {
        SecretSourceRef {
            name: self.name.clone(),
            namespace: Some(
                self.namespace
                    .clone()
                    .unwrap_or_else(|| default_scope.to_string()),
            ),
        }
    }
}

impl std::fmt::Display for SecretSourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
