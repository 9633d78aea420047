//! # Health Check Spec
//!
//! Predicates over a resource's live state that gate a unit's transition to Ready.

use crate::crd::TargetSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A health check evaluated by polling the target until it holds or times out
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Identifies the check in status and errors; defaults to the target
    #[serde(default)]
    pub name: Option<String>,
    pub target: TargetSelector,
    pub condition: ConditionSpec,
    /// Kubernetes duration format; defaults to DEFAULT_HEALTH_CHECK_TIMEOUT
    #[serde(default)]
    pub timeout: Option<String>,
}

impl HealthCheckSpec {
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.target.to_string())
    }
}

/// Expected condition on a resource, addressed by JSON pointer
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConditionSpec {
    /// Field at `path` equals `value`
    FieldEquals {
        path: String,
        value: serde_json::Value,
    },
    /// Numeric field at `path` is at least the number at `minPath`, or `min`
    #[serde(rename_all = "camelCase")]
    AtLeast {
        path: String,
        #[serde(default)]
        min_path: Option<String>,
        #[serde(default)]
        min: Option<f64>,
    },
    /// Field at `path` exists and is not null
    Present { path: String },
}

impl ConditionSpec {
    /// Evaluate against a resource's observed body
    #[must_use]
    pub fn holds(&self, body: &serde_json::Value) -> bool {
        match self {
            ConditionSpec::FieldEquals { path, value } => body.pointer(path) == Some(value),
            ConditionSpec::AtLeast {
                path,
                min_path,
                min,
            } => {
                let Some(actual) = body.pointer(path).and_then(serde_json::Value::as_f64) else {
                    return false;
                };
                let threshold = match (min_path, min) {
                    (Some(p), _) => body.pointer(p).and_then(serde_json::Value::as_f64),
                    (None, Some(m)) => Some(*m),
                    (None, None) => None,
                };
                threshold.is_some_and(|t| actual >= t)
            }
            ConditionSpec::Present { path } => body.pointer(path).is_some_and(|v| !v.is_null()),
        }
    }
}

impl std::fmt::Display for ConditionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionSpec::FieldEquals { path, value } => write!(f, "{path} == {value}"),
            ConditionSpec::AtLeast {
                path,
                min_path: Some(p),
                ..
            } => write!(f, "{path} >= {p}"),
            ConditionSpec::AtLeast { path, min, .. } => {
                write!(f, "{path} >= {}", min.unwrap_or_default())
            }
            ConditionSpec::Present { path } => write!(f, "{path} present"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_equals() {
        let condition = ConditionSpec::FieldEquals {
            path: "/status/phase".to_string(),
            value: json!("Bound"),
        };
        assert!(condition.holds(&json!({"status": {"phase": "Bound"}})));
        assert!(!condition.holds(&json!({"status": {"phase": "Pending"}})));
        assert!(!condition.holds(&json!({})));
    }

    #[test]
    fn test_at_least_replicas() {
        let condition = ConditionSpec::AtLeast {
            path: "/status/readyReplicas".to_string(),
            min_path: Some("/spec/replicas".to_string()),
            min: None,
        };
        assert!(condition.holds(&json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}})));
        assert!(!condition.holds(&json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 1}})));
        assert!(!condition.holds(&json!({"spec": {"replicas": 3}})));
    }

    #[test]
    fn test_at_least_literal_and_present() {
        let at_least = ConditionSpec::AtLeast {
            path: "/status/available".to_string(),
            min_path: None,
            min: Some(2.0),
        };
        assert!(at_least.holds(&json!({"status": {"available": 2}})));

        let present = ConditionSpec::Present {
            path: "/status/loadBalancer/ingress".to_string(),
        };
        assert!(present.holds(&json!({"status": {"loadBalancer": {"ingress": []}}})));
        assert!(!present.holds(&json!({"status": {"loadBalancer": {"ingress": null}}})));
    }

    #[test]
    fn test_condition_deserialization() {
        let yaml = r"
target:
  kind: Deployment
  name: web
condition:
  type: atLeast
  path: /status/readyReplicas
  minPath: /spec/replicas
timeout: 30s
";
        let check: HealthCheckSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(check.display_name(), "Deployment/web");
        assert!(matches!(
            check.condition,
            ConditionSpec::AtLeast { min_path: Some(_), .. }
        ));
    }
}
