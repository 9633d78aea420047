//! # Dependency Graph Scheduler
//!
//! Orders reconciliation units into a DAG by their declared `dependsOn`
//! edges. An edge `A -> B` means "B depends on A".
//!
//! The graph is validated once per snapshot load: duplicate identities,
//! dependencies on unknown units, and cycles (self-dependencies included)
//! reject the whole load. Eligibility is recomputed on every scheduling tick
//! from a read-consistent status snapshot.

use crate::controller::loader::{LoadError, ReconciliationUnit};
use crate::crd::UnitId;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<UnitId, ()>,
    indices: BTreeMap<UnitId, NodeIndex>,
    units: BTreeMap<UnitId, Arc<ReconciliationUnit>>,
}

impl DependencyGraph {
    /// Build and validate the graph for a complete unit set
    pub fn build(units: Vec<ReconciliationUnit>) -> Result<Self, LoadError> {
        let mut graph = DiGraph::new();
        let mut indices = BTreeMap::new();
        let mut by_id = BTreeMap::new();

        for unit in units {
            if by_id.contains_key(&unit.id) {
                return Err(LoadError::DuplicateUnit(unit.id));
            }
            indices.insert(unit.id.clone(), graph.add_node(unit.id.clone()));
            by_id.insert(unit.id.clone(), Arc::new(unit));
        }

        for unit in by_id.values() {
            let dependent = indices[&unit.id];
            for dependency in &unit.depends_on {
                let Some(&source) = indices.get(dependency) else {
                    return Err(LoadError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(source, dependent, ());
            }
        }

        let mut cycles: Vec<Vec<UnitId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&n| graph.contains_edge(n, n))
            })
            .map(|component| {
                let mut members: Vec<UnitId> =
                    component.into_iter().map(|n| graph[n].clone()).collect();
                members.sort();
                members
            })
            .collect();
        if !cycles.is_empty() {
            cycles.sort();
            return Err(LoadError::Cycle { cycles });
        }

        Ok(Self {
            graph,
            indices,
            units: by_id,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<&Arc<ReconciliationUnit>> {
        self.units.get(id)
    }

    /// Units in identity order
    pub fn units(&self) -> impl Iterator<Item = &Arc<ReconciliationUnit>> {
        self.units.values()
    }

    #[must_use]
    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    /// Direct dependents of `id`, in identity order
    #[must_use]
    pub fn dependents_of(&self, id: &UnitId) -> Vec<UnitId> {
        let Some(&index) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<UnitId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// Units whose dependencies are all in `completed` and which are not in flight
    ///
    /// Units without dependencies are always eligible. The result is ordered
    /// by identity string.
    #[must_use]
    pub fn next_eligible(
        &self,
        completed: &BTreeSet<UnitId>,
        in_flight: &BTreeSet<UnitId>,
    ) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|unit| !in_flight.contains(&unit.id))
            .filter(|unit| unit.depends_on.is_subset(completed))
            .map(|unit| unit.id.clone())
            .collect()
    }

    /// Dependencies first; ties broken by identity order
    #[must_use]
    pub fn topological_order(&self) -> Vec<UnitId> {
        let mut remaining: BTreeMap<&UnitId, usize> = self
            .units
            .values()
            .map(|u| (&u.id, u.depends_on.len()))
            .collect();
        let mut ready: BTreeSet<UnitId> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id.clone())
            .collect();
        let mut order = Vec::with_capacity(self.units.len());

        while let Some(next) = ready.pop_first() {
            for dependent in self.dependents_of(&next) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
            order.push(next);
        }
        order
    }
}
