//! # Patch Spec
//!
//! Overlay patches: a target selector plus an ordered list of operations
//! addressed by JSON pointer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single overlay patch
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    /// Selects exactly one document by kind and name
    pub target: TargetSelector,
    /// Applied strictly in order
    pub operations: Vec<PatchOperation>,
}

/// Selects resources by kind and name, optionally narrowed by namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a value; overwrites an existing object member
    Add,
    /// Overwrite an existing value; the path must exist
    Replace,
    /// Delete an existing value; the path must exist
    Remove,
}

impl PatchOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
        }
    }
}

/// One operation of a patch
///
/// `add` and `replace` carry exactly one of `value` or `valueFrom`;
/// `remove` carries neither.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub op: PatchOp,
    /// JSON pointer (RFC 6901), e.g. `/spec/template/spec/containers/0/image`
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub value_from: Option<ValueFrom>,
}

/// Pulls a patch value from the rendered output of a secret unit
///
/// The referenced unit must be listed in the patching unit's `dependsOn`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    /// Secret unit name, or `namespace/name`
    pub unit: String,
    /// JSON pointer into the rendered document, e.g. `/stringData/password`
    pub pointer: String,
}
