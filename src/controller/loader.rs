//! # Unit Loader
//!
//! Turns the `Unit` and `SecretTemplate` documents of a snapshot into
//! validated `ReconciliationUnit`s.

use crate::constants::{
    API_GROUP, DEFAULT_HEALTH_CHECK_TIMEOUT, DEFAULT_SCOPE, MIN_UNIT_INTERVAL_SECS,
};
use crate::controller::validation::{
    parse_kubernetes_duration, validate_duration_interval, validate_kubernetes_name,
    validate_kubernetes_namespace,
};
use crate::crd::{
    HealthCheckSpec, PatchOp, PatchSpec, SecretTemplate, SecretTemplateSpec, Unit, UnitId,
    UnitReference,
};
use crate::source::{Snapshot, SnapshotDocument};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;

/// Whole-load failures. Any of these blocks all reconciliation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("malformed unit document {path}#{index}: {reason}")]
    Malformed {
        path: String,
        index: usize,
        reason: String,
    },
    #[error("unit {unit}: {reason}")]
    Invalid { unit: String, reason: String },
    #[error("unit {0} is declared more than once")]
    DuplicateUnit(UnitId),
    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: UnitId, dependency: UnitId },
    #[error("dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<UnitId>> },
    #[error("unit {unit} takes a patch value from {source_unit}, which is not in its dependsOn")]
    UndeclaredValueSource { unit: UnitId, source_unit: UnitId },
    #[error("unit {unit} takes a patch value from {source_unit}, which is not a SecretTemplate")]
    InvalidValueSource { unit: UnitId, source_unit: UnitId },
}

fn format_cycles(cycles: &[Vec<UnitId>]) -> String {
    let mut out = String::new();
    for (i, cycle) in cycles.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push('[');
        for (j, id) in cycle.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{id}");
        }
        out.push(']');
    }
    out
}

/// A health check with its timeout resolved
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub spec: HealthCheckSpec,
    pub timeout: Duration,
}

/// What a unit reconciles
#[derive(Debug, Clone, PartialEq)]
pub enum UnitWorkload {
    /// Documents under `source_path`, overlaid with `patches`
    Manifests {
        source_path: String,
        prune: bool,
        patches: Vec<PatchSpec>,
    },
    /// A secret materialized from a restricted source
    Secret(SecretTemplateSpec),
}

/// The smallest independently scheduled piece of desired state
///
/// Immutable until the next snapshot load.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationUnit {
    pub id: UnitId,
    pub interval: Duration,
    /// Pass timeout, when declared
    pub timeout: Option<Duration>,
    pub depends_on: BTreeSet<UnitId>,
    pub health_checks: Vec<HealthCheck>,
    pub suspend: bool,
    pub workload: UnitWorkload,
}

impl ReconciliationUnit {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.workload {
            UnitWorkload::Manifests { .. } => "Unit",
            UnitWorkload::Secret(_) => "SecretTemplate",
        }
    }

    /// Secret units whose rendered output this unit's patches read
    #[must_use]
    pub fn value_sources(&self) -> BTreeSet<UnitId> {
        let UnitWorkload::Manifests { patches, .. } = &self.workload else {
            return BTreeSet::new();
        };
        patches
            .iter()
            .flat_map(|p| &p.operations)
            .filter_map(|op| op.value_from.as_ref())
            .map(|value_from| UnitId::parse(&value_from.unit, &self.id.scope))
            .collect()
    }
}

/// True for `Unit` / `SecretTemplate` documents of this controller's API group
#[must_use]
pub fn is_unit_document(body: &Value) -> bool {
    let group_matches = body
        .get("apiVersion")
        .and_then(Value::as_str)
        .and_then(|v| v.split_once('/'))
        .is_some_and(|(group, _)| group == API_GROUP);
    let kind = body.get("kind").and_then(Value::as_str);
    group_matches && matches!(kind, Some("Unit" | "SecretTemplate"))
}

/// Parse and validate every unit declared in a snapshot
///
/// Dependency references are resolved but not checked for existence or
/// cycles; that happens when the dependency graph is built.
pub fn load_units(
    snapshot: &Snapshot,
    default_interval: Duration,
) -> Result<Vec<ReconciliationUnit>, LoadError> {
    let mut units = Vec::new();
    for document in snapshot.documents() {
        if !is_unit_document(&document.body) {
            continue;
        }
        units.push(parse_unit(document, default_interval)?);
    }
    validate_value_sources(&units)?;
    Ok(units)
}

fn malformed(document: &SnapshotDocument, reason: impl Into<String>) -> LoadError {
    LoadError::Malformed {
        path: document.path.clone(),
        index: document.index,
        reason: reason.into(),
    }
}

fn parse_unit(
    document: &SnapshotDocument,
    default_interval: Duration,
) -> Result<ReconciliationUnit, LoadError> {
    let kind = document.body.get("kind").and_then(Value::as_str);
    let (metadata, interval, timeout, depends_on, health_checks, suspend, workload) = match kind {
        Some("Unit") => {
            let unit: Unit = serde_json::from_value(document.body.clone())
                .map_err(|e| malformed(document, e.to_string()))?;
            let spec = unit.spec;
            (
                unit.metadata,
                spec.interval,
                spec.timeout,
                spec.depends_on,
                spec.health_checks,
                spec.suspend,
                UnitWorkload::Manifests {
                    source_path: spec.source_path,
                    prune: spec.prune,
                    patches: spec.patches,
                },
            )
        }
        _ => {
            let template: SecretTemplate = serde_json::from_value(document.body.clone())
                .map_err(|e| malformed(document, e.to_string()))?;
            let spec = template.spec;
            (
                template.metadata,
                spec.interval.clone(),
                None,
                spec.depends_on.clone(),
                Vec::new(),
                spec.suspend,
                UnitWorkload::Secret(spec),
            )
        }
    };

    let name = metadata
        .name
        .ok_or_else(|| malformed(document, "metadata.name is required"))?;
    let scope = metadata
        .namespace
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
    let id = UnitId::new(scope, name);
    let invalid = |reason: String| LoadError::Invalid {
        unit: id.to_string(),
        reason,
    };

    validate_kubernetes_name(&id.name, "metadata.name").map_err(|e| invalid(e.to_string()))?;
    validate_kubernetes_namespace(&id.scope, "metadata.namespace")
        .map_err(|e| invalid(e.to_string()))?;

    let interval = match interval {
        Some(raw) => validate_duration_interval(&raw, "spec.interval", MIN_UNIT_INTERVAL_SECS)
            .map_err(|e| invalid(e.to_string()))?,
        None => default_interval,
    };
    let timeout = timeout
        .map(|raw| parse_kubernetes_duration(&raw).map_err(|e| invalid(format!("spec.timeout: {e}"))))
        .transpose()?;

    let depends_on = resolve_references(&depends_on, &id.scope);
    let health_checks = health_checks
        .into_iter()
        .map(|spec| {
            let raw = spec.timeout.as_deref().unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT);
            parse_kubernetes_duration(raw)
                .map(|timeout| HealthCheck { spec, timeout })
                .map_err(|e| invalid(format!("healthChecks timeout: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match &workload {
        UnitWorkload::Manifests { patches, .. } => {
            validate_patches(patches).map_err(invalid)?;
        }
        UnitWorkload::Secret(spec) => {
            if !spec.template.is_object() {
                return Err(invalid("spec.template must be a mapping".to_string()));
            }
        }
    }

    Ok(ReconciliationUnit {
        id,
        interval,
        timeout,
        depends_on,
        health_checks,
        suspend,
        workload,
    })
}

fn resolve_references(references: &[UnitReference], scope: &str) -> BTreeSet<UnitId> {
    references.iter().map(|r| r.resolve(scope)).collect()
}

fn validate_patches(patches: &[PatchSpec]) -> Result<(), String> {
    for (i, patch) in patches.iter().enumerate() {
        for operation in &patch.operations {
            if !operation.path.is_empty() && !operation.path.starts_with('/') {
                return Err(format!(
                    "patch {i}: path '{}' is not a JSON pointer",
                    operation.path
                ));
            }
            let carries_value = operation.value.is_some() || operation.value_from.is_some();
            match operation.op {
                PatchOp::Remove if carries_value => {
                    return Err(format!(
                        "patch {i}: remove at '{}' must not carry a value",
                        operation.path
                    ));
                }
                PatchOp::Add | PatchOp::Replace
                    if operation.value.is_some() == operation.value_from.is_some() =>
                {
                    return Err(format!(
                        "patch {i}: {} at '{}' needs exactly one of value or valueFrom",
                        operation.op.as_str(),
                        operation.path
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Every `valueFrom` must name a declared dependency that is a secret unit
fn validate_value_sources(units: &[ReconciliationUnit]) -> Result<(), LoadError> {
    let secret_units: BTreeMap<&UnitId, bool> = units
        .iter()
        .map(|u| (&u.id, matches!(u.workload, UnitWorkload::Secret(_))))
        .collect();

    for unit in units {
        for source in unit.value_sources() {
            if !unit.depends_on.contains(&source) {
                return Err(LoadError::UndeclaredValueSource {
                    unit: unit.id.clone(),
                    source_unit: source,
                });
            }
            if secret_units.get(&source) == Some(&false) {
                return Err(LoadError::InvalidValueSource {
                    unit: unit.id.clone(),
                    source_unit: source,
                });
            }
        }
    }
    Ok(())
}
