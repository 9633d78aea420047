//! # Controller Runtime
//!
//! Ties the scheduler, reconciler, secret pipeline and status aggregator
//! together into a tick-driven dispatch loop.
//!
//! ## Tick
//!
//! 1. Mark passes running longer than `stall_factor x interval` as Stalled
//! 2. Take one read-consistent status snapshot
//! 3. Ask the graph for eligible units (all dependencies completed, not in flight)
//! 4. Dispatch the eligible units that are due, as long as worker permits remain
//! 5. Evaluate the ordering invariant
//!
//! A unit is never dispatched while one of its dependents is in flight, and
//! a dependent is never dispatched in the same tick as one of its
//! dependencies.
//!
//! When a secret unit commits new content, the dependents reading it through
//! `valueFrom` are bumped and forced.

use crate::config::ControllerConfig;
use crate::controller::loader::{load_units, LoadError, ReconciliationUnit, UnitWorkload};
use crate::controller::reconciler::{PassReport, Reconciler, ReconcilerError};
use crate::controller::scheduler::DependencyGraph;
use crate::controller::status::StatusAggregator;
use crate::crd::{SecretSourceRef, UnitId, UnitState, UnitStatus};
use crate::observability::metrics;
use crate::source::Snapshot;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),
    #[error("no snapshot has been loaded")]
    NotLoaded,
}

/// Runtime knobs, taken from `ControllerConfig`
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub tick_interval: Duration,
    pub max_concurrent_reconciliations: usize,
    pub stall_factor: u32,
    pub default_unit_interval: Duration,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_concurrent_reconciliations: config.max_concurrent_reconciliations,
            stall_factor: config.stall_factor,
            default_unit_interval: config.default_unit_interval,
        }
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    graph: Option<Arc<DependencyGraph>>,
    snapshot: Option<Arc<Snapshot>>,
    in_flight: BTreeMap<UnitId, CancellationToken>,
    /// Units to dispatch on the next opportunity regardless of interval
    forced: BTreeSet<UnitId>,
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    status: Arc<StatusAggregator>,
    settings: ControllerSettings,
    permits: Arc<Semaphore>,
    permit_count: u32,
    state: Mutex<RuntimeState>,
    wake: Notify,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Controller {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>, settings: ControllerSettings) -> Self {
        let permit_count = u32::try_from(settings.max_concurrent_reconciliations.max(1))
            .unwrap_or(u32::MAX)
            .min(u32::try_from(Semaphore::MAX_PERMITS).unwrap_or(u32::MAX));
        Self {
            reconciler,
            status: Arc::new(StatusAggregator::new()),
            settings,
            permits: Arc::new(Semaphore::new(permit_count as usize)),
            permit_count,
            state: Mutex::new(RuntimeState::default()),
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> &Arc<StatusAggregator> {
        &self.status
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The currently loaded graph, if the latest snapshot loaded cleanly
    #[must_use]
    pub fn graph(&self) -> Option<Arc<DependencyGraph>> {
        self.lock_state().graph.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the units of a new snapshot
    ///
    /// A load error clears the graph: nothing is dispatched until a later
    /// snapshot loads. Passes of units that were removed or whose declaration
    /// changed are cancelled; they are retried against the new snapshot.
    pub fn load_snapshot(&self, snapshot: Arc<Snapshot>) -> Result<(), LoadError> {
        let revision = snapshot.revision().to_string();
        let loaded = load_units(&snapshot, self.settings.default_unit_interval)
            .and_then(DependencyGraph::build);

        let mut state = self.lock_state();
        let graph = match loaded {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                metrics::increment_load_errors();
                error!(revision = %revision, error = %e, "Snapshot rejected, reconciliation blocked");
                self.status.record_load_error(e.to_string());
                state.graph = None;
                return Err(e);
            }
        };

        let previous = state.graph.take();
        for (id, token) in &state.in_flight {
            let unchanged = previous
                .as_ref()
                .and_then(|old| old.get(id))
                .zip(graph.get(id))
                .is_some_and(|(old, new)| old == new);
            if !unchanged {
                info!(unit = %id, "Unit declaration changed, cancelling running pass");
                token.cancel();
            }
        }
        state.forced.retain(|id| graph.contains(id));
        self.reconciler.secrets().retain_units(|id| {
            graph
                .get(id)
                .is_some_and(|unit| matches!(unit.workload, UnitWorkload::Secret(_)))
        });

        self.status.sync_units(&graph, &revision);
        info!(
            revision = %revision,
            units = graph.len(),
            order = ?graph.topological_order().iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Snapshot loaded"
        );
        state.graph = Some(graph);
        state.snapshot = Some(snapshot);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Run one scheduling tick, returning the units dispatched
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<UnitId> {
        let mut state = self.lock_state();
        let (Some(graph), Some(snapshot)) = (state.graph.clone(), state.snapshot.clone()) else {
            return Vec::new();
        };

        self.mark_stalled(&graph, now);

        let statuses = self.status.snapshot();
        let completed: BTreeSet<UnitId> = statuses
            .iter()
            .filter(|(_, s)| s.is_completed())
            .map(|(id, _)| id.clone())
            .collect();
        let mut in_flight: BTreeSet<UnitId> = statuses
            .iter()
            .filter(|(_, s)| s.state.is_in_flight())
            .map(|(id, _)| id.clone())
            .chain(state.in_flight.keys().cloned())
            .collect();

        let mut dispatched = Vec::new();
        for id in graph.next_eligible(&completed, &in_flight) {
            let (Some(unit), Some(status)) = (graph.get(&id), statuses.get(&id)) else {
                continue;
            };
            if unit.suspend {
                continue;
            }
            if unit.depends_on.iter().any(|d| in_flight.contains(d))
                || graph.dependents_of(&id).iter().any(|d| in_flight.contains(d))
            {
                continue;
            }
            let forced = state.forced.contains(&id);
            if !forced && !is_due(status, unit.interval, now) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!(unit = %id, "Worker pool exhausted, deferring to next tick");
                break;
            };

            let token = CancellationToken::new();
            let Some(generation) = self.status.update(&id, |s| {
                s.begin(now);
                s.generation
            }) else {
                continue;
            };
            state.in_flight.insert(id.clone(), token.clone());
            state.forced.remove(&id);
            in_flight.insert(id.clone());

            debug!(unit = %id, generation, forced, "Dispatching pass");
            self.spawn_pass(
                Arc::clone(unit),
                Arc::clone(&snapshot),
                status.clone(),
                generation,
                token,
                permit,
            );
            dispatched.push(id);
        }
        drop(state);

        self.status.check_invariants(&graph);
        self.status.publish_metrics();
        dispatched
    }

    fn mark_stalled(&self, graph: &DependencyGraph, now: DateTime<Utc>) {
        for unit in graph.units() {
            let threshold = unit.interval.saturating_mul(self.settings.stall_factor);
            let stalled = self.status.update(&unit.id, |s| {
                let over = s.state == UnitState::Progressing
                    && s.progressing_since
                        .is_some_and(|since| elapsed(since, now) > threshold);
                if over {
                    s.stall();
                }
                over
            });
            if stalled == Some(true) {
                warn!(unit = %unit.id, threshold = ?threshold, "Pass stalled");
            }
        }
    }

    fn spawn_pass(
        self: &Arc<Self>,
        unit: Arc<ReconciliationUnit>,
        snapshot: Arc<Snapshot>,
        previous: UnitStatus,
        generation: u64,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let this = Arc::clone(self);
        let span = tracing::info_span!("controller.dispatch", unit = %unit.id, generation);
        tokio::spawn(
            async move {
                let _permit = permit;
                let start = Instant::now();
                let result = this
                    .reconciler
                    .reconcile(&unit, &snapshot, &previous.inventory, &token)
                    .await;
                this.finish_pass(&unit.id, generation, previous, snapshot.revision(), result, start);
            }
            .instrument(span),
        );
    }

    fn finish_pass(
        &self,
        id: &UnitId,
        generation: u64,
        previous: UnitStatus,
        revision: &str,
        result: Result<PassReport, ReconcilerError>,
        start: Instant,
    ) {
        let outcome = match result {
            Ok(report) => {
                let changed = report.applied() > 0 || report.pruned > 0;
                let outputs_changed = report.outputs_changed;
                self.status.update(id, |s| {
                    s.succeed(Utc::now(), generation, revision, report.inventory, changed);
                    s.resource_errors = report.resource_errors;
                });
                if outputs_changed {
                    self.refresh_value_readers(id);
                }
                "success"
            }
            Err(e) if e.is_cancelled() => {
                self.status.restore(id, previous);
                self.lock_state().forced.insert(id.clone());
                info!(unit = %id, "Pass cancelled, status restored");
                "cancelled"
            }
            Err(e) => {
                warn!(unit = %id, error = %e, "Pass failed");
                self.status.update(id, |s| s.fail(generation, e.to_string()));
                "failure"
            }
        };
        metrics::increment_passes(outcome);
        metrics::observe_pass_duration(start.elapsed().as_secs_f64());

        self.lock_state().in_flight.remove(id);
        self.status.publish_metrics();
        self.wake.notify_one();
    }

    /// Bump and force every dependent whose patches read `secret`'s output
    ///
    /// Their desired sets changed even though their declarations did not.
    fn refresh_value_readers(&self, secret: &UnitId) {
        let mut state = self.lock_state();
        let Some(graph) = state.graph.clone() else {
            return;
        };
        let readers = graph
            .dependents_of(secret)
            .into_iter()
            .filter(|dependent| {
                graph
                    .get(dependent)
                    .is_some_and(|unit| unit.value_sources().contains(secret))
            });
        for reader in readers {
            if let Some(generation) = self.status.bump_generation(&reader) {
                debug!(unit = %reader, source_unit = %secret, generation, "Rendered value changed");
                state.forced.insert(reader);
            }
        }
    }

    /// Force a unit's next pass: bumps its generation and marks it due
    pub fn request_reconcile(&self, id: &UnitId) -> Result<u64, ControllerError> {
        let mut state = self.lock_state();
        let graph = state.graph.as_ref().ok_or(ControllerError::NotLoaded)?;
        if !graph.contains(id) {
            return Err(ControllerError::UnknownUnit(id.clone()));
        }
        let generation = self
            .status
            .bump_generation(id)
            .ok_or_else(|| ControllerError::UnknownUnit(id.clone()))?;
        state.forced.insert(id.clone());
        drop(state);

        info!(unit = %id, generation, "Reconciliation requested");
        self.wake.notify_one();
        Ok(generation)
    }

    /// Force every secret unit that reads from `source`
    pub fn on_source_secret_changed(&self, source: &SecretSourceRef) -> Vec<UnitId> {
        let Some(graph) = self.graph() else {
            return Vec::new();
        };
        let affected: Vec<UnitId> = graph
            .units()
            .filter(|unit| match &unit.workload {
                UnitWorkload::Secret(spec) => spec.source_ref.resolve(&unit.id.scope) == *source,
                UnitWorkload::Manifests { .. } => false,
            })
            .map(|unit| unit.id.clone())
            .collect();
        for id in &affected {
            if let Err(e) = self.request_reconcile(id) {
                warn!(unit = %id, error = %e, "Could not request reconciliation");
            }
        }
        affected
    }

    /// Wait until no pass is running
    pub async fn wait_idle(&self) {
        if let Ok(permits) = self.permits.acquire_many(self.permit_count).await {
            drop(permits);
        }
    }

    /// Drive the controller until `shutdown` fires
    ///
    /// Ticks on the configured interval, on every new snapshot, and whenever
    /// a pass finishes or a reconciliation is requested. On shutdown every
    /// running pass is cancelled and awaited.
    pub async fn run(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
        shutdown: CancellationToken,
    ) {
        let initial = snapshots.borrow_and_update().clone();
        if let Some(snapshot) = initial {
            if let Err(e) = self.load_snapshot(snapshot) {
                warn!(error = %e, "Initial snapshot did not load, waiting for a new revision");
            }
        }

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snapshots_open = true;

        info!(tick_interval = ?self.settings.tick_interval, "Controller loop started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                changed = snapshots.changed(), if snapshots_open => {
                    if changed.is_err() {
                        snapshots_open = false;
                        continue;
                    }
                    let latest = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = latest {
                        if let Err(e) = self.load_snapshot(snapshot) {
                            warn!(error = %e, "Snapshot did not load, keeping dispatch blocked");
                        }
                    }
                }
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }
            self.tick(Utc::now());
        }

        info!("Shutting down, cancelling running passes");
        for token in self.lock_state().in_flight.values() {
            token.cancel();
        }
        self.wait_idle().await;
        info!("Controller loop stopped");
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or_default()
}

/// Whether a unit that is otherwise eligible should run now
fn is_due(status: &UnitStatus, interval: Duration, now: DateTime<Utc>) -> bool {
    let interval_elapsed = status
        .last_attempt
        .map_or(true, |at| elapsed(at, now) >= interval);
    match status.state {
        UnitState::Pending => true,
        UnitState::Ready => !status.is_completed() || interval_elapsed,
        UnitState::Failed => status.observed_generation != Some(status.generation) || interval_elapsed,
        UnitState::Progressing | UnitState::Stalled => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::secrets::SecretPipeline;
    use crate::provider::memory::{InMemoryTarget, StaticSecretSource};
    use crate::provider::{SecretSourceProvider, TargetProvider};

    fn controller(target: &Arc<InMemoryTarget>) -> Arc<Controller> {
        let target = Arc::clone(target) as Arc<dyn TargetProvider>;
        let secrets = Arc::new(SecretPipeline::new(
            Arc::new(StaticSecretSource::new()) as Arc<dyn SecretSourceProvider>,
            Arc::clone(&target),
            Duration::from_secs(5),
        ));
        let reconciler = Arc::new(Reconciler::new(
            target,
            secrets,
            Duration::from_secs(5),
            Duration::from_millis(100),
        ));
        Arc::new(Controller::new(
            reconciler,
            ControllerSettings {
                tick_interval: Duration::from_secs(1),
                max_concurrent_reconciliations: 4,
                stall_factor: 3,
                default_unit_interval: Duration::from_secs(300),
            },
        ))
    }

    fn snapshot(extra_unit: &str) -> Arc<Snapshot> {
        let units = format!(
            "apiVersion: reconcile.gitops.io/v1\nkind: Unit\nmetadata:\n  name: base\nspec:\n  sourcePath: base\n{extra_unit}"
        );
        Arc::new(
            Snapshot::from_files([
                ("units.yaml", units),
                (
                    "base/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: base\n".to_string(),
                ),
                (
                    "app/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n".to_string(),
                ),
            ])
            .unwrap(),
        )
    }

    const APP_UNIT: &str = "---\napiVersion: reconcile.gitops.io/v1\nkind: Unit\nmetadata:\n  name: app\nspec:\n  sourcePath: app\n  dependsOn:\n    - name: base\n";

    fn id(name: &str) -> UnitId {
        UnitId::new("default", name)
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let interval = Duration::from_secs(60);
        let mut status = UnitStatus {
            generation: 1,
            ..Default::default()
        };
        assert!(is_due(&status, interval, now));

        status.begin(now);
        assert!(!is_due(&status, interval, now));

        status.succeed(now, 1, "rev", vec![], true);
        assert!(!is_due(&status, interval, now));
        assert!(is_due(&status, interval, now + chrono::Duration::seconds(61)));
        status.generation = 2;
        assert!(is_due(&status, interval, now));

        status.fail(2, "boom");
        assert!(!is_due(&status, interval, now));
        assert!(is_due(&status, interval, now + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency() {
        let target = Arc::new(InMemoryTarget::new());
        let controller = controller(&target);
        controller.load_snapshot(snapshot(APP_UNIT)).unwrap();

        assert_eq!(controller.tick(Utc::now()), vec![id("base")]);
        controller.wait_idle().await;
        assert!(controller.status().get(&id("base")).unwrap().is_completed());

        assert_eq!(controller.tick(Utc::now()), vec![id("app")]);
        controller.wait_idle().await;
        assert_eq!(controller.status().get(&id("app")).unwrap().state, UnitState::Ready);
        assert!(controller.tick(Utc::now()).is_empty());
        assert!(controller.status().view().violations.is_empty());
    }

    #[tokio::test]
    async fn test_load_error_blocks_dispatch() {
        let target = Arc::new(InMemoryTarget::new());
        let controller = controller(&target);
        let cyclic = "  dependsOn:\n    - name: base\n";
        let err = controller.load_snapshot(snapshot(cyclic)).unwrap_err();
        assert!(matches!(err, LoadError::Cycle { .. }));
        assert!(controller.tick(Utc::now()).is_empty());
        assert!(controller.status().view().load_error.is_some());
        assert!(target.operations().is_empty());
    }

    #[tokio::test]
    async fn test_request_reconcile_forces_a_pass() {
        let target = Arc::new(InMemoryTarget::new());
        let controller = controller(&target);
        controller.load_snapshot(snapshot("")).unwrap();
        controller.tick(Utc::now());
        controller.wait_idle().await;
        assert!(controller.tick(Utc::now()).is_empty());

        let generation = controller.request_reconcile(&id("base")).unwrap();
        assert_eq!(generation, 2);
        assert_eq!(controller.tick(Utc::now()), vec![id("base")]);
        controller.wait_idle().await;
        let status = controller.status().get(&id("base")).unwrap();
        assert!(status.is_completed());
        assert_eq!(status.observed_generation, Some(2));

        assert_eq!(
            controller.request_reconcile(&id("missing")),
            Err(ControllerError::UnknownUnit(id("missing")))
        );
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_dispatch() {
        let target = Arc::new(InMemoryTarget::new());
        target.set_latency(Duration::from_millis(50));
        let target_dyn = Arc::clone(&target) as Arc<dyn TargetProvider>;
        let secrets = Arc::new(SecretPipeline::new(
            Arc::new(StaticSecretSource::new()) as Arc<dyn SecretSourceProvider>,
            Arc::clone(&target_dyn),
            Duration::from_secs(5),
        ));
        let reconciler = Arc::new(Reconciler::new(
            target_dyn,
            secrets,
            Duration::from_secs(5),
            Duration::from_millis(100),
        ));
        let controller = Arc::new(Controller::new(
            reconciler,
            ControllerSettings {
                tick_interval: Duration::from_secs(1),
                max_concurrent_reconciliations: 1,
                stall_factor: 3,
                default_unit_interval: Duration::from_secs(300),
            },
        ));
        let second = "---\napiVersion: reconcile.gitops.io/v1\nkind: Unit\nmetadata:\n  name: app\nspec:\n  sourcePath: app\n";
        controller.load_snapshot(snapshot(second)).unwrap();

        assert_eq!(controller.tick(Utc::now()), vec![id("app")]);
        controller.wait_idle().await;
        assert_eq!(controller.tick(Utc::now()), vec![id("base")]);
        controller.wait_idle().await;
    }
}
