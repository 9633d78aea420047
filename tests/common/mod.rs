//! Shared fixtures for integration tests

#![allow(dead_code, reason = "Not every test binary uses every fixture")]

use gitops_reconciler::controller::reconciler::Reconciler;
use gitops_reconciler::controller::runtime::{Controller, ControllerSettings};
use gitops_reconciler::controller::secrets::SecretPipeline;
use gitops_reconciler::crd::UnitId;
use gitops_reconciler::provider::memory::{InMemoryTarget, StaticSecretSource};
use gitops_reconciler::provider::{SecretSourceProvider, TargetProvider};
use gitops_reconciler::source::Snapshot;
use std::sync::Arc;
use std::time::Duration;

/// A controller wired to in-process backends
pub struct Harness {
    pub target: Arc<InMemoryTarget>,
    pub secret_source: Arc<StaticSecretSource>,
    pub controller: Arc<Controller>,
}

pub fn harness() -> Harness {
    harness_with(4)
}

pub fn harness_with(max_concurrent_reconciliations: usize) -> Harness {
    let target = Arc::new(InMemoryTarget::new());
    let secret_source = Arc::new(StaticSecretSource::new());
    let target_dyn = Arc::clone(&target) as Arc<dyn TargetProvider>;
    let secrets = Arc::new(SecretPipeline::new(
        Arc::clone(&secret_source) as Arc<dyn SecretSourceProvider>,
        Arc::clone(&target_dyn),
        Duration::from_secs(5),
    ));
    let reconciler = Arc::new(Reconciler::new(
        target_dyn,
        secrets,
        Duration::from_secs(5),
        Duration::from_millis(200),
    ));
    let controller = Arc::new(Controller::new(
        reconciler,
        ControllerSettings {
            tick_interval: Duration::from_secs(1),
            max_concurrent_reconciliations,
            stall_factor: 3,
            default_unit_interval: Duration::from_secs(300),
        },
    ));
    Harness {
        target,
        secret_source,
        controller,
    }
}

pub fn snapshot(files: &[(&str, &str)]) -> Arc<Snapshot> {
    Arc::new(Snapshot::from_files(files.iter().map(|(p, c)| (*p, *c))).expect("snapshot parses"))
}

pub fn id(name: &str) -> UnitId {
    UnitId::new("default", name)
}

pub fn config_map(name: &str, data: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n{data}")
}
