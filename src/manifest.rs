//! # Manifest Documents
//!
//! Kind-tagged resource documents, their identities, and the ownership
//! labels that tie an applied resource back to the unit that declared it.

use crate::constants::{OWNER_NAME_LABEL, OWNER_SCOPE_LABEL};
use crate::crd::UnitId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Identity of a resource on the target system: (kind, scope, name)
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
pub struct ResourceId {
    pub kind: String,
    pub scope: String,
    pub name: String,
}

impl ResourceId {
    #[must_use]
    pub fn new(kind: impl Into<String>, scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Read the identity of a raw document, filling in a missing scope
    #[must_use]
    pub fn of(body: &Value, default_scope: &str) -> Option<Self> {
        let kind = body.get("kind")?.as_str()?;
        let metadata = body.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        let scope = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(default_scope);
        Some(Self::new(kind, scope, name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.scope, self.name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("document is not a mapping")]
    NotAnObject,
    #[error("document has no kind")]
    MissingKind,
    #[error("document of kind {kind} has no metadata.name")]
    MissingName { kind: String },
}

/// A structured resource document with a resolved identity
///
/// Documents are never mutated once composed; every pass builds a fresh set.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDocument {
    id: ResourceId,
    body: Value,
}

impl ManifestDocument {
    pub fn from_value(body: Value, default_scope: &str) -> Result<Self, ManifestError> {
        if !body.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or(ManifestError::MissingKind)?;
        let id = ResourceId::of(&body, default_scope).ok_or_else(|| ManifestError::MissingName {
            kind: kind.to_string(),
        })?;
        Ok(Self { id, body })
    }

    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Value {
        self.body
    }

    #[must_use]
    pub fn api_version(&self) -> Option<&str> {
        self.body.get("apiVersion").and_then(Value::as_str)
    }

    /// Stable serialization: object keys are sorted at every level
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_canonical(&self.body, &mut out);
        out
    }

    /// Return a copy stamped with the owning unit's labels
    #[must_use]
    pub fn with_owner(&self, owner: &UnitId) -> Self {
        let mut body = self.body.clone();
        if let Some(obj) = body.as_object_mut() {
            let metadata = obj
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(metadata) = metadata.as_object_mut() {
                let labels = metadata
                    .entry("labels")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !labels.is_object() {
                    *labels = Value::Object(Map::new());
                }
                if let Some(labels) = labels.as_object_mut() {
                    labels.insert(OWNER_NAME_LABEL.to_string(), Value::String(owner.name.clone()));
                    labels.insert(OWNER_SCOPE_LABEL.to_string(), Value::String(owner.scope.clone()));
                }
            }
        }
        Self {
            id: self.id.clone(),
            body,
        }
    }
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Read the owning unit from a resource's labels
#[must_use]
pub fn owner_of(body: &Value) -> Option<UnitId> {
    let labels = body.pointer("/metadata/labels")?;
    let name = labels.get(OWNER_NAME_LABEL)?.as_str()?;
    let scope = labels.get(OWNER_SCOPE_LABEL)?.as_str()?;
    Some(UnitId::new(scope, name))
}

/// The target system's current state for one identity, valid for a single pass
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResource {
    pub id: ResourceId,
    pub body: Value,
}

impl ObservedResource {
    #[must_use]
    pub fn owner(&self) -> Option<UnitId> {
        owner_of(&self.body)
    }

    #[must_use]
    pub fn is_owned_by(&self, unit: &UnitId) -> bool {
        self.owner().as_ref() == Some(unit)
    }
}
