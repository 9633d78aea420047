//! # Reconciler
//!
//! Drives one unit's observed state toward its desired state.
//!
//! ## Pass Flow
//!
//! 1. Build the desired set: documents under `sourcePath`, patched and
//!    stamped with ownership labels (secret units render their template instead)
//! 2. Read each resource fresh from the target and diff it
//! 3. Apply creates and updates
//! 4. Prune owned resources no longer declared (when `prune` is set)
//! 5. Run health checks in order
//!
//! Passes of the same unit never overlap: each holds the unit's async mutex
//! for its whole duration. Cancellation is checked before every mutating step.

pub mod apply;
pub mod diff;
pub mod health;
pub mod types;

pub use health::HealthPolling;
pub use types::{PassReport, ReconcilerError};

use crate::controller::loader::{ReconciliationUnit, UnitWorkload};
use crate::controller::secrets::{MaterializeOutcome, SecretPipeline};
use crate::crd::{PatchSpec, SecretTemplateSpec, UnitId};
use crate::manifest::ResourceId;
use crate::provider::TargetProvider;
use crate::source::Snapshot;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use uuid::Uuid;

pub struct Reconciler {
    target: Arc<dyn TargetProvider>,
    secrets: Arc<SecretPipeline>,
    operation_timeout: Duration,
    health_poll_interval: Duration,
    unit_locks: Mutex<BTreeMap<UnitId, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("operation_timeout", &self.operation_timeout)
            .field("health_poll_interval", &self.health_poll_interval)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        target: Arc<dyn TargetProvider>,
        secrets: Arc<SecretPipeline>,
        operation_timeout: Duration,
        health_poll_interval: Duration,
    ) -> Self {
        Self {
            target,
            secrets,
            operation_timeout,
            health_poll_interval,
            unit_locks: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn secrets(&self) -> &Arc<SecretPipeline> {
        &self.secrets
    }

    fn unit_lock(&self, unit: &UnitId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.unit_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(unit.clone()).or_default())
    }

    /// Run one pass for `unit` against `snapshot`
    ///
    /// `previous_inventory` is what the unit's last successful pass applied;
    /// its kinds widen the prune listing.
    pub async fn reconcile(
        &self,
        unit: &ReconciliationUnit,
        snapshot: &Snapshot,
        previous_inventory: &[ResourceId],
        cancel: &CancellationToken,
    ) -> Result<PassReport, ReconcilerError> {
        let span = tracing::info_span!(
            "reconcile.pass",
            pass_id = %Uuid::new_v4(),
            unit = %unit.id,
            kind = unit.kind(),
            revision = snapshot.revision(),
        );
        async {
            let lock = self.unit_lock(&unit.id);
            let _pass_guard = lock.lock().await;
            let start = Instant::now();

            let pass = self.run_pass(unit, snapshot, previous_inventory, cancel);
            let result = match unit.timeout {
                Some(limit) => tokio::time::timeout(limit, pass)
                    .await
                    .unwrap_or(Err(ReconcilerError::Timeout(limit))),
                None => pass.await,
            };

            if let Ok(report) = &result {
                info!(
                    created = report.created,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    pruned = report.pruned,
                    resource_errors = report.resource_errors.len(),
                    elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Pass complete"
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_pass(
        &self,
        unit: &ReconciliationUnit,
        snapshot: &Snapshot,
        previous_inventory: &[ResourceId],
        cancel: &CancellationToken,
    ) -> Result<PassReport, ReconcilerError> {
        if cancel.is_cancelled() {
            return Err(ReconcilerError::Cancelled);
        }
        let mut report = match &unit.workload {
            UnitWorkload::Manifests {
                source_path,
                prune,
                patches,
            } => {
                self.reconcile_manifests(
                    &unit.id,
                    snapshot,
                    source_path,
                    *prune,
                    patches,
                    previous_inventory,
                    cancel,
                )
                .await?
            }
            UnitWorkload::Secret(spec) => self.reconcile_secret(unit, spec, cancel).await?,
        };

        health::run_health_checks(
            self.target.as_ref(),
            &unit.id,
            &unit.health_checks,
            HealthPolling {
                poll_interval: self.health_poll_interval,
                operation_timeout: self.operation_timeout,
            },
            cancel,
        )
        .await?;

        report.inventory.sort();
        report.inventory.dedup();
        Ok(report)
    }

    #[allow(clippy::too_many_arguments, reason = "Pass inputs are distinct borrows")]
    async fn reconcile_manifests(
        &self,
        unit: &UnitId,
        snapshot: &Snapshot,
        source_path: &str,
        prune: bool,
        patches: &[PatchSpec],
        previous_inventory: &[ResourceId],
        cancel: &CancellationToken,
    ) -> Result<PassReport, ReconcilerError> {
        let outputs = self.secrets.outputs();
        let desired = apply::build_desired_set(unit, snapshot, source_path, patches, &outputs)?;
        let mut report = PassReport {
            resource_errors: desired.resource_errors.clone(),
            ..PassReport::default()
        };

        apply::apply_desired(
            self.target.as_ref(),
            unit,
            &desired,
            self.operation_timeout,
            cancel,
            &mut report,
        )
        .await?;

        if prune {
            let kinds: BTreeSet<String> = desired
                .documents
                .iter()
                .map(|d| d.id().kind.clone())
                .chain(previous_inventory.iter().map(|id| id.kind.clone()))
                .collect();
            apply::prune(
                self.target.as_ref(),
                unit,
                &desired,
                &kinds,
                self.operation_timeout,
                cancel,
                &mut report,
            )
            .await?;
        }
        Ok(report)
    }

    async fn reconcile_secret(
        &self,
        unit: &ReconciliationUnit,
        spec: &SecretTemplateSpec,
        cancel: &CancellationToken,
    ) -> Result<PassReport, ReconcilerError> {
        let materialized = self.secrets.materialize(unit, spec, cancel).await?;
        let mut report = PassReport {
            inventory: vec![materialized.record.target],
            ..PassReport::default()
        };
        match materialized.outcome {
            MaterializeOutcome::Rendered => {
                report.created += 1;
                report.outputs_changed = true;
            }
            MaterializeOutcome::Repaired => report.updated += 1,
            _ => report.unchanged += 1,
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::loader::HealthCheck;
    use crate::crd::{ConditionSpec, HealthCheckSpec, TargetSelector};
    use crate::provider::memory::{InMemoryTarget, StaticSecretSource};
    use crate::provider::SecretSourceProvider;
    use serde_json::json;

    fn reconciler(target: &Arc<InMemoryTarget>) -> Reconciler {
        let target = Arc::clone(target) as Arc<dyn TargetProvider>;
        let secrets = Arc::new(SecretPipeline::new(
            Arc::new(StaticSecretSource::new()) as Arc<dyn SecretSourceProvider>,
            Arc::clone(&target),
            Duration::from_secs(5),
        ));
        Reconciler::new(target, secrets, Duration::from_secs(5), Duration::from_secs(1))
    }

    fn unit(prune: bool, health_checks: Vec<HealthCheck>) -> ReconciliationUnit {
        ReconciliationUnit {
            id: UnitId::new("apps", "web"),
            interval: Duration::from_secs(60),
            timeout: None,
            depends_on: BTreeSet::new(),
            health_checks,
            suspend: false,
            workload: UnitWorkload::Manifests {
                source_path: "apps/web".to_string(),
                prune,
                patches: Vec::new(),
            },
        }
    }

    fn snapshot(names: &[&str]) -> Snapshot {
        let yaml: Vec<String> = names
            .iter()
            .map(|n| format!("kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: {n}\ndata:\n  k: v\n"))
            .collect();
        Snapshot::from_files([("apps/web/resources.yaml", yaml.join("---\n"))]).unwrap()
    }

    #[tokio::test]
    async fn test_pass_prunes_removed_resources() {
        let target = Arc::new(InMemoryTarget::new());
        let reconciler = reconciler(&target);
        let cancel = CancellationToken::new();

        let first = reconciler
            .reconcile(&unit(true, Vec::new()), &snapshot(&["a", "b"]), &[], &cancel)
            .await
            .unwrap();
        assert_eq!(first.inventory.len(), 2);

        let second = reconciler
            .reconcile(
                &unit(true, Vec::new()),
                &snapshot(&["a"]),
                &first.inventory,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(second.pruned, 1);
        assert_eq!(
            target.resource_ids(),
            vec![ResourceId::new("ConfigMap", "apps", "a")]
        );
    }

    #[tokio::test]
    async fn test_without_prune_strays_survive() {
        let target = Arc::new(InMemoryTarget::new());
        let reconciler = reconciler(&target);
        let cancel = CancellationToken::new();
        reconciler
            .reconcile(&unit(false, Vec::new()), &snapshot(&["a", "b"]), &[], &cancel)
            .await
            .unwrap();
        let report = reconciler
            .reconcile(&unit(false, Vec::new()), &snapshot(&["a"]), &[], &cancel)
            .await
            .unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(target.resource_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_gate_fails_pass() {
        let target = Arc::new(InMemoryTarget::new());
        let reconciler = reconciler(&target);
        let check = HealthCheck {
            spec: HealthCheckSpec {
                name: None,
                target: TargetSelector {
                    kind: "ConfigMap".to_string(),
                    name: "a".to_string(),
                    namespace: None,
                },
                condition: ConditionSpec::FieldEquals {
                    path: "/data/k".to_string(),
                    value: json!("other"),
                },
                timeout: None,
            },
            timeout: Duration::from_secs(5),
        };
        let err = reconciler
            .reconcile(
                &unit(false, vec![check]),
                &snapshot(&["a"]),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, ReconcilerError::HealthCheckTimeout { ref check, .. } if check == "ConfigMap/a")
        );
    }

    #[tokio::test]
    async fn test_cancelled_pass_does_not_write() {
        let target = Arc::new(InMemoryTarget::new());
        let reconciler = reconciler(&target);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = reconciler
            .reconcile(&unit(false, Vec::new()), &snapshot(&["a"]), &[], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(target.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_timeout() {
        let target = Arc::new(InMemoryTarget::new());
        target.set_latency(Duration::from_secs(10));
        let reconciler = reconciler(&target);
        let mut slow = unit(false, Vec::new());
        slow.timeout = Some(Duration::from_secs(3));
        let err = reconciler
            .reconcile(&slow, &snapshot(&["a"]), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ReconcilerError::Timeout(Duration::from_secs(3)));
    }
}
