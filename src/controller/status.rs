//! # Status Aggregator
//!
//! Owns every unit's `UnitStatus` behind a single lock, so the scheduler
//! always reads a consistent snapshot of all units at once.
//!
//! Also evaluates the ordering invariant: no unit may be in flight while one
//! of its dependencies is not Ready. A violation means the scheduler let
//! something through it should not have; it is logged, counted and exposed
//! in the status view but never acted on.

use crate::controller::scheduler::DependencyGraph;
use crate::crd::{UnitId, UnitState, UnitStatus};
use crate::observability::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::error;

/// A unit in flight while a dependency is not Ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    pub unit: String,
    pub dependency: String,
    pub dependency_state: UnitState,
}

/// Per-unit status as exposed on the query surface
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub id: String,
    pub kind: String,
    pub depends_on: Vec<String>,
    pub suspended: bool,
    #[serde(flatten)]
    pub status: UnitStatus,
}

/// The merged, read-only projection of all units
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// Revision of the last snapshot that loaded
    pub revision: Option<String>,
    /// Set while the latest snapshot fails to load; nothing is dispatched
    pub load_error: Option<String>,
    pub units: Vec<UnitView>,
    pub violations: Vec<InvariantViolation>,
}

#[derive(Debug, Default)]
struct UnitMeta {
    kind: String,
    depends_on: Vec<String>,
    suspended: bool,
}

#[derive(Debug, Default)]
struct AggregatorState {
    revision: Option<String>,
    load_error: Option<String>,
    statuses: BTreeMap<UnitId, UnitStatus>,
    meta: BTreeMap<UnitId, UnitMeta>,
    violations: Vec<InvariantViolation>,
}

#[derive(Debug, Default)]
pub struct StatusAggregator {
    state: RwLock<AggregatorState>,
}

impl StatusAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&AggregatorState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut AggregatorState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Read-consistent copy of every unit's status
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<UnitId, UnitStatus> {
        self.read(|s| s.statuses.clone())
    }

    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<UnitStatus> {
        self.read(|s| s.statuses.get(id).cloned())
    }

    /// Align tracked units with a freshly loaded graph
    ///
    /// New units start Pending, removed units are dropped, and when the
    /// revision changed every unit's generation is bumped.
    pub fn sync_units(&self, graph: &DependencyGraph, revision: &str) {
        self.write(|s| {
            let revision_changed = s.revision.as_deref() != Some(revision);
            s.statuses.retain(|id, _| graph.contains(id));
            s.meta.clear();
            for unit in graph.units() {
                match s.statuses.get_mut(&unit.id) {
                    Some(status) if revision_changed => status.generation += 1,
                    Some(_) => {}
                    None => {
                        s.statuses.insert(
                            unit.id.clone(),
                            UnitStatus {
                                generation: 1,
                                ..UnitStatus::default()
                            },
                        );
                    }
                }
                s.meta.insert(
                    unit.id.clone(),
                    UnitMeta {
                        kind: unit.kind().to_string(),
                        depends_on: unit.depends_on.iter().map(ToString::to_string).collect(),
                        suspended: unit.suspend,
                    },
                );
            }
            s.revision = Some(revision.to_string());
            s.load_error = None;
        });
    }

    pub fn record_load_error(&self, error: impl Into<String>) {
        self.write(|s| s.load_error = Some(error.into()));
    }

    #[must_use]
    pub fn load_error(&self) -> Option<String> {
        self.read(|s| s.load_error.clone())
    }

    /// Bump a unit's generation, returning the new value
    pub fn bump_generation(&self, id: &UnitId) -> Option<u64> {
        self.write(|s| {
            s.statuses.get_mut(id).map(|status| {
                status.generation += 1;
                status.generation
            })
        })
    }

    /// Mutate one unit's status under the lock
    pub fn update<T>(&self, id: &UnitId, f: impl FnOnce(&mut UnitStatus) -> T) -> Option<T> {
        self.write(|s| s.statuses.get_mut(id).map(f))
    }

    /// Put back a status captured before a pass, keeping any newer generation
    pub fn restore(&self, id: &UnitId, previous: UnitStatus) {
        self.write(|s| {
            if let Some(current) = s.statuses.get_mut(id) {
                let generation = current.generation.max(previous.generation);
                *current = previous;
                current.generation = generation;
            }
        });
    }

    /// Flag every in-flight unit whose dependency is not Ready
    pub fn check_invariants(&self, graph: &DependencyGraph) -> Vec<InvariantViolation> {
        self.write(|s| {
            let mut violations = Vec::new();
            for unit in graph.units() {
                let in_flight = s
                    .statuses
                    .get(&unit.id)
                    .is_some_and(|status| status.state.is_in_flight());
                if !in_flight {
                    continue;
                }
                for dependency in &unit.depends_on {
                    let state = s
                        .statuses
                        .get(dependency)
                        .map_or(UnitState::Pending, |status| status.state);
                    if state != UnitState::Ready {
                        error!(
                            unit = %unit.id,
                            dependency = %dependency,
                            dependency_state = %state,
                            "Ordering invariant violated: unit in flight with a dependency that is not Ready"
                        );
                        metrics::increment_invariant_violations();
                        violations.push(InvariantViolation {
                            unit: unit.id.to_string(),
                            dependency: dependency.to_string(),
                            dependency_state: state,
                        });
                    }
                }
            }
            s.violations.clone_from(&violations);
            violations
        })
    }

    /// Refresh the per-state unit gauges
    pub fn publish_metrics(&self) {
        let counts = self.read(|s| {
            let mut counts: BTreeMap<&'static str, i64> =
                UnitState::ALL.iter().map(|state| (state.as_str(), 0)).collect();
            for status in s.statuses.values() {
                *counts.entry(status.state.as_str()).or_default() += 1;
            }
            counts
        });
        for (state, count) in counts {
            metrics::set_units_in_state(state, count);
        }
    }

    #[must_use]
    pub fn unit_view(&self, id: &UnitId) -> Option<UnitView> {
        self.read(|s| view_of(s, id))
    }

    #[must_use]
    pub fn view(&self) -> StatusView {
        self.read(|s| StatusView {
            revision: s.revision.clone(),
            load_error: s.load_error.clone(),
            units: s.statuses.keys().filter_map(|id| view_of(s, id)).collect(),
            violations: s.violations.clone(),
        })
    }
}

fn view_of(state: &AggregatorState, id: &UnitId) -> Option<UnitView> {
    let status = state.statuses.get(id)?;
    let meta = state.meta.get(id);
    Some(UnitView {
        id: id.to_string(),
        kind: meta.map(|m| m.kind.clone()).unwrap_or_default(),
        depends_on: meta.map(|m| m.depends_on.clone()).unwrap_or_default(),
        suspended: meta.is_some_and(|m| m.suspended),
        status: status.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::loader::{ReconciliationUnit, UnitWorkload};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn unit(name: &str, deps: &[&str]) -> ReconciliationUnit {
        ReconciliationUnit {
            id: UnitId::new("default", name),
            interval: Duration::from_secs(60),
            timeout: None,
            depends_on: deps.iter().map(|d| UnitId::new("default", *d)).collect::<BTreeSet<_>>(),
            health_checks: Vec::new(),
            suspend: false,
            workload: UnitWorkload::Manifests {
                source_path: name.to_string(),
                prune: false,
                patches: Vec::new(),
            },
        }
    }

    fn graph() -> DependencyGraph {
        DependencyGraph::build(vec![unit("a", &[]), unit("b", &["a"])]).unwrap()
    }

    fn id(name: &str) -> UnitId {
        UnitId::new("default", name)
    }

    #[test]
    fn test_sync_starts_pending_and_bumps_on_new_revision() {
        let aggregator = StatusAggregator::new();
        let graph = graph();
        aggregator.sync_units(&graph, "rev-1");
        let status = aggregator.get(&id("a")).unwrap();
        assert_eq!(status.state, UnitState::Pending);
        assert_eq!(status.generation, 1);

        aggregator.update(&id("a"), |s| s.succeed(Utc::now(), 1, "rev-1", vec![], true));
        assert!(aggregator.get(&id("a")).unwrap().is_completed());

        aggregator.sync_units(&graph, "rev-1");
        assert!(aggregator.get(&id("a")).unwrap().is_completed());

        aggregator.sync_units(&graph, "rev-2");
        let status = aggregator.get(&id("a")).unwrap();
        assert_eq!(status.generation, 2);
        assert!(!status.is_completed());
        assert_eq!(status.state, UnitState::Ready);
    }

    #[test]
    fn test_restore_keeps_newer_generation() {
        let aggregator = StatusAggregator::new();
        aggregator.sync_units(&graph(), "rev-1");
        let before = aggregator.get(&id("a")).unwrap();
        aggregator.update(&id("a"), |s| s.begin(Utc::now()));
        aggregator.bump_generation(&id("a"));

        aggregator.restore(&id("a"), before);
        let status = aggregator.get(&id("a")).unwrap();
        assert_eq!(status.state, UnitState::Pending);
        assert_eq!(status.generation, 2);
        assert!(status.last_attempt.is_none());
    }

    #[test]
    fn test_invariant_violation_is_flagged() {
        let aggregator = StatusAggregator::new();
        let graph = graph();
        aggregator.sync_units(&graph, "rev-1");
        assert!(aggregator.check_invariants(&graph).is_empty());

        aggregator.update(&id("b"), |s| s.begin(Utc::now()));
        let violations = aggregator.check_invariants(&graph);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].unit, "default/b");
        assert_eq!(violations[0].dependency_state, UnitState::Pending);
        assert_eq!(aggregator.view().violations, violations);
    }

    #[test]
    fn test_view_serializes_units() {
        let aggregator = StatusAggregator::new();
        aggregator.sync_units(&graph(), "rev-1");
        aggregator.record_load_error("dependency cycle detected");
        let view = aggregator.view();
        assert_eq!(view.units.len(), 2);
        assert_eq!(view.units[1].depends_on, vec!["default/a".to_string()]);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["revision"], "rev-1");
        assert_eq!(json["loadError"], "dependency cycle detected");
        assert_eq!(json["units"][0]["state"], "Pending");
        assert_eq!(json["units"][0]["kind"], "Unit");
    }
}
