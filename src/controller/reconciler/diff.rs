//! # Structural Diff
//!
//! A resource needs an update when some field the desired document declares
//! differs from the observed state. Fields only the target carries
//! (`status`, `resourceVersion`, defaults filled in by the server) are ignored.

use crate::manifest::{ManifestDocument, ObservedResource};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    Create,
    Update,
    NoOp,
}

impl ResourceAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::Create => "create",
            ResourceAction::Update => "update",
            ResourceAction::NoOp => "noop",
        }
    }
}

#[must_use]
pub fn plan(desired: &ManifestDocument, observed: Option<&ObservedResource>) -> ResourceAction {
    match observed {
        None => ResourceAction::Create,
        Some(observed) if declared_fields_match(desired.body(), &observed.body) => {
            ResourceAction::NoOp
        }
        Some(_) => ResourceAction::Update,
    }
}

/// Compare every declared top-level field except `status`
#[must_use]
pub fn declared_fields_match(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(desired), Value::Object(observed)) => desired
            .iter()
            .filter(|(key, _)| key.as_str() != "status")
            .all(|(key, value)| observed.get(key).is_some_and(|o| is_subset(value, o))),
        _ => desired == observed,
    }
}

/// True when `observed` carries every field of `desired` with an equal value
///
/// Arrays must have the same length; their elements are compared pairwise.
#[must_use]
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(desired), Value::Object(observed)) => desired
            .iter()
            .all(|(key, value)| observed.get(key).is_some_and(|o| is_subset(value, o))),
        (Value::Array(desired), Value::Array(observed)) => {
            desired.len() == observed.len()
                && desired.iter().zip(observed).all(|(d, o)| is_subset(d, o))
        }
        (Value::Number(d), Value::Number(o)) => d == o || d.as_f64() == o.as_f64(),
        _ => desired == observed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceId;
    use serde_json::json;

    fn desired(replicas: u64) -> ManifestDocument {
        ManifestDocument::from_value(
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "apps", "labels": {"app": "web"}},
                "spec": {"replicas": replicas, "ports": [{"port": 80}]}
            }),
            "apps",
        )
        .unwrap()
    }

    fn observed(body: Value) -> ObservedResource {
        ObservedResource {
            id: ResourceId::new("Deployment", "apps", "web"),
            body,
        }
    }

    #[test]
    fn test_absent_is_create() {
        assert_eq!(plan(&desired(1), None), ResourceAction::Create);
    }

    #[test]
    fn test_server_fields_and_status_are_ignored() {
        let live = observed(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "apps",
                "labels": {"app": "web"},
                "resourceVersion": "42",
                "uid": "abc"
            },
            "spec": {"replicas": 1, "ports": [{"port": 80, "protocol": "TCP"}]},
            "status": {"readyReplicas": 0}
        }));
        assert_eq!(plan(&desired(1), Some(&live)), ResourceAction::NoOp);
    }

    #[test]
    fn test_changed_field_is_update() {
        let live = observed(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "apps", "labels": {"app": "web"}},
            "spec": {"replicas": 1, "ports": [{"port": 80}]}
        }));
        assert_eq!(plan(&desired(2), Some(&live)), ResourceAction::Update);
    }

    #[test]
    fn test_array_length_matters() {
        assert!(!is_subset(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(is_subset(&json!([{"a": 1}]), &json!([{"a": 1, "b": 2}])));
        assert!(is_subset(&json!(1), &json!(1.0)));
    }
}
