//! # Desired State, Apply and Prune
//!
//! Builds a unit's desired document set from the snapshot, drives each
//! resource to it, and prunes owned resources the set no longer declares.
//!
//! Apply and prune are not transactional: a failure part way through leaves
//! earlier resources written. The next pass starts again from observed state.

use super::diff::{plan, ResourceAction};
use super::types::{PassReport, ReconcilerError};
use crate::controller::compositor::compose;
use crate::controller::loader::is_unit_document;
use crate::controller::secrets::MaterializedOutputs;
use crate::crd::{PatchSpec, UnitId};
use crate::manifest::{ManifestDocument, ResourceId};
use crate::observability::metrics;
use crate::provider::common::bounded;
use crate::provider::{TargetError, TargetProvider};
use crate::source::Snapshot;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A unit's desired set plus the documents that could not join it
#[derive(Debug, Clone, Default)]
pub struct DesiredSet {
    pub documents: Vec<ManifestDocument>,
    pub resource_errors: BTreeMap<String, String>,
}

/// Parse, patch and label the documents under `source_path`
///
/// Documents that are not resources (no kind, no name, not a mapping) are
/// resource-scoped errors. When no valid document remains and at least one
/// was rejected, the whole pass fails.
pub fn build_desired_set(
    unit: &UnitId,
    snapshot: &Snapshot,
    source_path: &str,
    patches: &[PatchSpec],
    outputs: &MaterializedOutputs,
) -> Result<DesiredSet, ReconcilerError> {
    let mut base = Vec::new();
    let mut seen = BTreeSet::new();
    let mut resource_errors = BTreeMap::new();

    for document in snapshot.documents_under(source_path) {
        if is_unit_document(&document.body) {
            continue;
        }
        let key = format!("{}#{}", document.path, document.index);
        match ManifestDocument::from_value(document.body.clone(), &unit.scope) {
            Ok(parsed) if !seen.insert(parsed.id().clone()) => {
                resource_errors.insert(
                    key,
                    format!("{} is declared more than once", parsed.id()),
                );
            }
            Ok(parsed) => base.push(parsed),
            Err(e) => {
                resource_errors.insert(key, e.to_string());
            }
        }
    }

    if base.is_empty() && !resource_errors.is_empty() {
        let reasons: Vec<String> = resource_errors
            .iter()
            .map(|(key, reason)| format!("{key}: {reason}"))
            .collect();
        return Err(ReconcilerError::NoValidResources(reasons.join("; ")));
    }

    let documents = compose(&base, patches, outputs, &unit.scope)?
        .iter()
        .map(|doc| doc.with_owner(unit))
        .collect();
    Ok(DesiredSet {
        documents,
        resource_errors,
    })
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), ReconcilerError> {
    if cancel.is_cancelled() {
        return Err(ReconcilerError::Cancelled);
    }
    Ok(())
}

/// Fetch, diff and apply every desired document
///
/// Observed state is read fresh for each resource. `Unsupported` is recorded
/// against the resource; any other target error ends the pass.
pub async fn apply_desired(
    target: &dyn TargetProvider,
    unit: &UnitId,
    desired: &DesiredSet,
    operation_timeout: Duration,
    cancel: &CancellationToken,
    report: &mut PassReport,
) -> Result<(), ReconcilerError> {
    for document in &desired.documents {
        ensure_active(cancel)?;
        let id = document.id();
        let observed = bounded("get", operation_timeout, target.get(id))
            .await
            .map_err(|source| ReconcilerError::Observe {
                id: id.clone(),
                source,
            })?;

        if let Some(owner) = observed.as_ref().and_then(|o| o.owner()) {
            if owner != *unit {
                metrics::increment_resource_errors();
                report
                    .resource_errors
                    .insert(id.to_string(), format!("owned by unit {owner}"));
                continue;
            }
        }

        let action = plan(document, observed.as_ref());
        if action == ResourceAction::NoOp {
            report.unchanged += 1;
            report.inventory.push(id.clone());
            continue;
        }

        ensure_active(cancel)?;
        match bounded("apply", operation_timeout, target.apply(document)).await {
            Ok(_) => {
                metrics::increment_resources_applied(action.as_str());
                debug!(resource = %id, action = action.as_str(), "Applied resource");
                if action == ResourceAction::Create {
                    report.created += 1;
                } else {
                    report.updated += 1;
                }
                report.inventory.push(id.clone());
            }
            Err(TargetError::Unsupported { kind }) => {
                metrics::increment_resource_errors();
                warn!(resource = %id, kind = %kind, "Target does not support kind, skipping");
                report
                    .resource_errors
                    .insert(id.to_string(), format!("kind {kind} is not supported"));
                if desired.documents.len() == 1 {
                    return Err(ReconcilerError::NoValidResources(format!(
                        "{id}: kind {kind} is not supported"
                    )));
                }
            }
            Err(source) => {
                return Err(ReconcilerError::Apply {
                    id: id.clone(),
                    source,
                })
            }
        }
    }
    Ok(())
}

/// Delete owned resources absent from the desired set
///
/// `kinds` is the backend's listing hint. Ownership is re-read from the
/// target immediately before each delete.
pub async fn prune(
    target: &dyn TargetProvider,
    unit: &UnitId,
    desired: &DesiredSet,
    kinds: &BTreeSet<String>,
    operation_timeout: Duration,
    cancel: &CancellationToken,
    report: &mut PassReport,
) -> Result<(), ReconcilerError> {
    let keep: BTreeSet<&ResourceId> = desired.documents.iter().map(ManifestDocument::id).collect();
    let owned = bounded("list", operation_timeout, target.list_owned(unit, kinds))
        .await
        .map_err(ReconcilerError::List)?;

    for candidate in owned {
        if keep.contains(&candidate.id) || !candidate.is_owned_by(unit) {
            continue;
        }
        let current = bounded("get", operation_timeout, target.get(&candidate.id))
            .await
            .map_err(|source| ReconcilerError::Observe {
                id: candidate.id.clone(),
                source,
            })?;
        if !current.is_some_and(|c| c.is_owned_by(unit)) {
            debug!(resource = %candidate.id, "Ownership changed before prune, skipping");
            continue;
        }

        ensure_active(cancel)?;
        bounded("delete", operation_timeout, target.delete(&candidate.id))
            .await
            .map_err(|source| ReconcilerError::Delete {
                id: candidate.id.clone(),
                source,
            })?;
        metrics::increment_resources_pruned();
        info!(resource = %candidate.id, "Pruned resource");
        report.pruned += 1;
    }
    Ok(())
}
