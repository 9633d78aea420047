//! # Reconciliation Integration Tests
//!
//! Pruning scope, resource-scoped failures, patch failures and
//! deterministic composition.

mod common;

use chrono::Utc;
use common::{config_map, harness, id, snapshot};
use gitops_reconciler::constants::{OWNER_NAME_LABEL, OWNER_SCOPE_LABEL};
use gitops_reconciler::controller::loader::{load_units, UnitWorkload};
use gitops_reconciler::controller::reconciler::apply::build_desired_set;
use gitops_reconciler::controller::secrets::MaterializedOutputs;
use gitops_reconciler::crd::UnitState;
use gitops_reconciler::manifest::ResourceId;
use gitops_reconciler::provider::memory::TargetOperation;
use serde_json::json;
use std::time::Duration;

const WEB_UNIT: &str = "apiVersion: reconcile.gitops.io/v1\nkind: Unit\nmetadata:\n  name: web\nspec:\n  sourcePath: web\n  prune: true\n";

fn cm(name: &str) -> ResourceId {
    ResourceId::new("ConfigMap", "default", name)
}

#[tokio::test]
async fn test_prune_only_touches_owned_resources() {
    let h = harness();
    h.target.insert(
        cm("foreign"),
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "foreign",
                "namespace": "default",
                "labels": {OWNER_NAME_LABEL: "other", OWNER_SCOPE_LABEL: "default"}
            }
        }),
    );
    h.target.insert(
        cm("manual"),
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "manual", "namespace": "default"}}),
    );

    let a = config_map("a", "  k: v\n");
    let b = config_map("b", "  k: v\n");
    let both = format!("{a}---\n{b}");
    h.controller
        .load_snapshot(snapshot(&[("units.yaml", WEB_UNIT), ("web/cms.yaml", &both)]))
        .unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;
    assert_eq!(
        h.controller.status().get(&id("web")).unwrap().inventory,
        vec![cm("a"), cm("b")]
    );

    h.target.clear_operations();
    h.controller
        .load_snapshot(snapshot(&[("units.yaml", WEB_UNIT), ("web/cms.yaml", &a)]))
        .unwrap();
    assert_eq!(h.controller.tick(Utc::now()), vec![id("web")]);
    h.controller.wait_idle().await;

    assert_eq!(h.target.resource_ids(), vec![cm("a"), cm("foreign"), cm("manual")]);
    assert_eq!(h.target.operations(), vec![TargetOperation::Delete(cm("b"))]);
    assert_eq!(
        h.controller.status().get(&id("web")).unwrap().inventory,
        vec![cm("a")]
    );
}

#[tokio::test]
async fn test_sole_malformed_document_fails_the_unit() {
    let h = harness();
    h.controller
        .load_snapshot(snapshot(&[
            ("units.yaml", WEB_UNIT),
            ("web/broken.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  labels: {}\n"),
        ]))
        .unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;

    let status = h.controller.status().get(&id("web")).unwrap();
    assert_eq!(status.state, UnitState::Failed);
    assert!(status.last_error.unwrap().contains("no valid resources"));
    assert!(h.target.operations().is_empty());
}

#[tokio::test]
async fn test_malformed_document_next_to_valid_ones_is_resource_scoped() {
    let h = harness();
    let valid = config_map("a", "  k: v\n");
    h.controller
        .load_snapshot(snapshot(&[
            ("units.yaml", WEB_UNIT),
            ("web/a.yaml", &valid),
            ("web/broken.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n"),
        ]))
        .unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;

    let status = h.controller.status().get(&id("web")).unwrap();
    assert_eq!(status.state, UnitState::Ready);
    assert_eq!(status.resource_errors.len(), 1);
    assert!(h.target.resource(&cm("a")).is_some());
}

#[tokio::test]
async fn test_replace_on_missing_path_fails_without_writing() {
    let h = harness();
    let unit = r"
apiVersion: reconcile.gitops.io/v1
kind: Unit
metadata:
  name: web
spec:
  sourcePath: web
  patches:
    - target:
        kind: ConfigMap
        name: a
      operations:
        - op: replace
          path: /data/missing
          value: x
";
    let a = config_map("a", "  k: v\n");
    h.controller
        .load_snapshot(snapshot(&[("units.yaml", unit), ("web/a.yaml", &a)]))
        .unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;

    let status = h.controller.status().get(&id("web")).unwrap();
    assert_eq!(status.state, UnitState::Failed);
    let error = status.last_error.unwrap();
    assert!(error.contains("/data/missing"), "{error}");
    assert!(h.target.operations().is_empty());
}

const PATCHED_UNIT: &str = r"
apiVersion: reconcile.gitops.io/v1
kind: Unit
metadata:
  name: web
spec:
  sourcePath: web
  patches:
    - target:
        kind: Deployment
        name: web
      operations:
        - op: replace
          path: /spec/replicas
          value: 3
        - op: add
          path: /metadata/labels/tier
          value: frontend
    - target:
        kind: Deployment
        name: web
      operations:
        - op: add
          path: /spec/template/spec/containers/-
          value:
            name: sidecar
            image: proxy:1.2
";

const DEPLOYMENT: &str = r"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  labels:
    app: web
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: web
          image: web:1.0
";

#[test]
fn test_composition_is_byte_identical_across_builds() {
    let build = || {
        let snap = snapshot(&[("units.yaml", PATCHED_UNIT), ("web/deploy.yaml", DEPLOYMENT)]);
        let units = load_units(&snap, Duration::from_secs(300)).unwrap();
        let UnitWorkload::Manifests {
            source_path,
            patches,
            ..
        } = &units[0].workload
        else {
            panic!("expected a manifest unit");
        };
        build_desired_set(&units[0].id, &snap, source_path, patches, &MaterializedOutputs::new())
            .unwrap()
            .documents
            .iter()
            .map(|d| d.canonical_bytes())
            .collect::<Vec<_>>()
    };

    let first = build();
    assert_eq!(first, build());

    let body: serde_json::Value = serde_json::from_slice(&first[0]).unwrap();
    assert_eq!(body["spec"]["replicas"], 3);
    assert_eq!(body["metadata"]["labels"]["tier"], "frontend");
    assert_eq!(body["spec"]["template"]["spec"]["containers"][1]["name"], "sidecar");
    assert_eq!(body["metadata"]["labels"][OWNER_NAME_LABEL], "web");
}

#[tokio::test]
async fn test_second_pass_over_unchanged_state_writes_nothing() {
    let h = harness();
    h.controller
        .load_snapshot(snapshot(&[("units.yaml", PATCHED_UNIT), ("web/deploy.yaml", DEPLOYMENT)]))
        .unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;
    assert_eq!(h.target.operations().len(), 1);

    h.target.clear_operations();
    h.controller.request_reconcile(&id("web")).unwrap();
    h.controller.tick(Utc::now());
    h.controller.wait_idle().await;
    assert!(h.target.operations().is_empty());
    assert!(h.controller.status().get(&id("web")).unwrap().is_completed());
}

#[tokio::test]
async fn test_drift_is_corrected_after_the_interval() {
    let h = harness();
    h.controller
        .load_snapshot(snapshot(&[("units.yaml", PATCHED_UNIT), ("web/deploy.yaml", DEPLOYMENT)]))
        .unwrap();
    let now = Utc::now();
    h.controller.tick(now);
    h.controller.wait_idle().await;

    let deployment = ResourceId::new("Deployment", "default", "web");
    h.target.mutate(&deployment, "/spec/replicas", json!(10));
    assert!(h.controller.tick(now).is_empty());

    assert_eq!(
        h.controller.tick(now + chrono::Duration::seconds(301)),
        vec![id("web")]
    );
    h.controller.wait_idle().await;
    assert_eq!(h.target.resource(&deployment).unwrap()["spec"]["replicas"], 3);
}
