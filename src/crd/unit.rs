//! # Unit Spec
//!
//! The `Unit` CRD: a named, ordered bundle of manifests reconciled as one.

use crate::crd::{HealthCheckSpec, PatchSpec, UnitReference};
use serde::{Deserialize, Serialize};

/// Unit Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: reconcile.gitops.io/v1
/// kind: Unit
/// metadata:
///   name: ingress
///   namespace: infra
/// spec:
///   sourcePath: infra/ingress
///   interval: 5m
///   prune: true
///   dependsOn:
///     - name: cert-manager
///   patches:
///     - target:
///         kind: Deployment
///         name: ingress-nginx
///       operations:
///         - op: replace
///           path: /spec/replicas
///           value: 3
///   healthChecks:
///     - target:
///         kind: Deployment
///         name: ingress-nginx
///       condition:
///         type: atLeast
///         path: /status/readyReplicas
///         minPath: /spec/replicas
///       timeout: 2m
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Unit",
    group = "reconcile.gitops.io",
    version = "v1",
    namespaced,
    status = "crate::crd::UnitStatus",
    shortname = "ru",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}, {"name":"Revision", "type":"string", "jsonPath":".status.lastAppliedRevision"}, {"name":"Error", "type":"string", "jsonPath":".status.lastError"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Directory within the manifest snapshot holding this unit's base documents
    pub source_path: String,
    /// Minimum re-check period, Kubernetes duration format ("30s", "5m", "1h")
    /// Also the retry backoff after a failed pass
    /// Defaults to the controller's DEFAULT_UNIT_INTERVAL
    #[serde(default)]
    pub interval: Option<String>,
    /// Units that must be Ready before this unit is reconciled
    #[serde(default)]
    pub depends_on: Vec<UnitReference>,
    /// Delete resources previously applied by this unit that are no longer declared
    #[serde(default = "default_false")]
    pub prune: bool,
    /// Overlay patches, applied in declaration order
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
    /// Health checks gating the transition to Ready, evaluated in order
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    /// Upper bound for a whole pass, Kubernetes duration format
    #[serde(default)]
    pub timeout: Option<String>,
    /// Stop scheduling this unit without removing it
    #[serde(default = "default_false")]
    pub suspend: bool,
}

#[must_use]
pub fn default_false() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_deserializes_with_defaults() {
        let yaml = r"
apiVersion: reconcile.gitops.io/v1
kind: Unit
metadata:
  name: web
  namespace: apps
spec:
  sourcePath: apps/web
";
        let unit: Unit = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(unit.metadata.name.as_deref(), Some("web"));
        assert_eq!(unit.spec.source_path, "apps/web");
        assert!(!unit.spec.prune);
        assert!(!unit.spec.suspend);
        assert!(unit.spec.depends_on.is_empty());
        assert!(unit.spec.interval.is_none());
    }

    #[test]
    fn test_unit_deserializes_dependencies_and_patches() {
        let yaml = r"
apiVersion: reconcile.gitops.io/v1
kind: Unit
metadata:
  name: web
spec:
  sourcePath: apps/web
  interval: 1m
  prune: true
  dependsOn:
    - name: db
    - name: certs
      namespace: infra
  patches:
    - target:
        kind: Deployment
        name: web
      operations:
        - op: add
          path: /metadata/labels/tier
          value: frontend
";
        let unit: Unit = serde_yaml::from_str(yaml).unwrap();
        assert!(unit.spec.prune);
        assert_eq!(unit.spec.depends_on.len(), 2);
        assert_eq!(unit.spec.depends_on[1].namespace.as_deref(), Some("infra"));
        assert_eq!(unit.spec.patches[0].operations.len(), 1);
    }
}
