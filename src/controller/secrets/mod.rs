//! # Secret Materialization Pipeline
//!
//! Reads a restricted source secret, renders a `SecretTemplate` against its
//! fields and writes the derived secret to the target.
//!
//! Writes are serialized per source identity: the source is read while the
//! source's write lock is held, so two triggers for the same source can never
//! interleave a stale read with a newer write. Each secret unit keeps a
//! `SecretMaterializationRecord` of the generation it last committed:
//!
//! - same source generation, same content, target intact: nothing is written
//! - same source generation, target drifted or missing: content is rewritten
//! - newer source generation (or changed template): render, write, commit
//! - older source generation: the read is stale and ignored
//!
//! Generations are only compared against a record of the same source; after
//! a `sourceRef` change the first read always renders.
//!
//! Pull refresh (the unit interval) and forced refresh (manual trigger or a
//! source secret watch event) both arrive here through the reconciler.

mod template;

pub use template::{normalize_secret, render, RenderError};

use crate::constants::{RENDERED_GENERATION_ANNOTATION, SOURCE_GENERATION_ANNOTATION};
use crate::controller::loader::ReconciliationUnit;
use crate::controller::reconciler::diff::declared_fields_match;
use crate::crd::{SecretSourceRef, SecretTemplateSpec, UnitId};
use crate::manifest::{ManifestDocument, ManifestError, ResourceId};
use crate::observability::metrics;
use crate::provider::common::bounded;
use crate::provider::{SecretSourceError, SecretSourceProvider, TargetError, TargetProvider};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Rendered secret documents by unit, as patch value sources
pub type MaterializedOutputs = BTreeMap<UnitId, Value>;

/// The generation a secret unit last committed to the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMaterializationRecord {
    pub source: SecretSourceRef,
    pub source_generation: u64,
    pub target: ResourceId,
    pub rendered_generation: u64,
    /// SHA-256 of the rendered content, generation annotations excluded
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// A new rendered generation was written
    Rendered,
    /// The committed content was rewritten over drift
    Repaired,
    Unchanged,
    /// The source read was older than the committed generation
    Stale,
}

impl MaterializeOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializeOutcome::Rendered => "rendered",
            MaterializeOutcome::Repaired => "repaired",
            MaterializeOutcome::Unchanged => "unchanged",
            MaterializeOutcome::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub outcome: MaterializeOutcome,
    pub record: SecretMaterializationRecord,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    #[error(transparent)]
    Source(#[from] SecretSourceError),
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("rendered secret is not a valid manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("materialization cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct PipelineState {
    records: BTreeMap<UnitId, SecretMaterializationRecord>,
    outputs: MaterializedOutputs,
}

pub struct SecretPipeline {
    source: Arc<dyn SecretSourceProvider>,
    target: Arc<dyn TargetProvider>,
    operation_timeout: Duration,
    locks: Mutex<BTreeMap<SecretSourceRef, Arc<tokio::sync::Mutex<()>>>>,
    state: RwLock<PipelineState>,
}

impl std::fmt::Debug for SecretPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPipeline")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl SecretPipeline {
    #[must_use]
    pub fn new(
        source: Arc<dyn SecretSourceProvider>,
        target: Arc<dyn TargetProvider>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            source,
            target,
            operation_timeout,
            locks: Mutex::new(BTreeMap::new()),
            state: RwLock::new(PipelineState::default()),
        }
    }

    /// Rendered documents of every secret unit that has committed one
    #[must_use]
    pub fn outputs(&self) -> MaterializedOutputs {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .outputs
            .clone()
    }

    #[must_use]
    pub fn record(&self, unit: &UnitId) -> Option<SecretMaterializationRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(unit)
            .cloned()
    }

    /// Drop records and outputs of units for which `keep` is false
    pub fn retain_units(&self, keep: impl Fn(&UnitId) -> bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.records.retain(|unit, _| keep(unit));
        state.outputs.retain(|unit, _| keep(unit));
    }

    fn source_lock(&self, source: &SecretSourceRef) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(source.clone()).or_default())
    }

    /// Bring a secret unit's target in line with its source's current generation
    pub async fn materialize(
        &self,
        unit: &ReconciliationUnit,
        spec: &SecretTemplateSpec,
        cancel: &CancellationToken,
    ) -> Result<Materialized, MaterializeError> {
        let source = spec.source_ref.resolve(&unit.id.scope);
        let span = tracing::info_span!(
            "secrets.materialize",
            unit = %unit.id,
            source = %source,
        );
        let result = self
            .materialize_locked(unit, spec, &source, cancel)
            .instrument(span)
            .await;
        match &result {
            Ok(materialized) => metrics::increment_secret_renders(materialized.outcome.as_str()),
            Err(MaterializeError::Cancelled) => {}
            Err(_) => metrics::increment_secret_renders("error"),
        }
        result
    }

    async fn materialize_locked(
        &self,
        unit: &ReconciliationUnit,
        spec: &SecretTemplateSpec,
        source: &SecretSourceRef,
        cancel: &CancellationToken,
    ) -> Result<Materialized, MaterializeError> {
        let lock = self.source_lock(source);
        let _write_guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(MaterializeError::Cancelled);
        }

        let secret = tokio::time::timeout(self.operation_timeout, self.source.read(source))
            .await
            .map_err(|e| {
                SecretSourceError::Transport(format!(
                    "read of {source} timed out after {:?}: {e}",
                    self.operation_timeout
                ))
            })??;
        // A record for another source says nothing about this one's generations
        let previous = self.record(&unit.id);
        let committed = previous.as_ref().filter(|r| r.source == *source);

        if let Some(record) = committed.filter(|r| secret.generation < r.source_generation) {
            warn!(
                read_generation = secret.generation,
                committed_generation = record.source_generation,
                "Ignoring stale source read"
            );
            return Ok(Materialized {
                outcome: MaterializeOutcome::Stale,
                record: record.clone(),
            });
        }

        let source_generation = secret.generation;
        let rendered = render(&spec.template, &secret.fields)?;
        drop(secret);
        let content = content_document(unit, &rendered)?;
        let digest = format!("{:x}", Sha256::digest(content.canonical_bytes()));

        let current = committed.filter(|r| {
            r.source_generation == source_generation
                && r.digest == digest
                && r.target == *content.id()
        });
        let (outcome, rendered_generation) = if let Some(record) = current {
            let desired =
                stamp_generations(&content, record.source_generation, record.rendered_generation)?;
            let observed = bounded(
                "get",
                self.operation_timeout,
                self.target.get(&record.target),
            )
            .await?;
            if observed.is_some_and(|o| declared_fields_match(desired.body(), &o.body)) {
                debug!(generation = source_generation, "Rendered secret is current");
                self.commit(&unit.id, record.clone(), rendered);
                return Ok(Materialized {
                    outcome: MaterializeOutcome::Unchanged,
                    record: record.clone(),
                });
            }
            (MaterializeOutcome::Repaired, record.rendered_generation)
        } else {
            let next = previous.as_ref().map_or(1, |r| r.rendered_generation + 1);
            (MaterializeOutcome::Rendered, next)
        };

        let desired = stamp_generations(&content, source_generation, rendered_generation)?;
        if cancel.is_cancelled() {
            return Err(MaterializeError::Cancelled);
        }
        bounded("apply", self.operation_timeout, self.target.apply(&desired)).await?;

        let record = SecretMaterializationRecord {
            source: source.clone(),
            source_generation,
            target: desired.id().clone(),
            rendered_generation,
            digest,
        };
        self.commit(&unit.id, record.clone(), rendered);
        info!(
            target = %record.target,
            source_generation,
            rendered_generation,
            outcome = outcome.as_str(),
            "Materialized secret"
        );
        Ok(Materialized { outcome, record })
    }

    fn commit(&self, unit: &UnitId, record: SecretMaterializationRecord, rendered: Value) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.records.insert(unit.clone(), record);
        state.outputs.insert(unit.clone(), rendered);
    }
}

/// The rendered secret with defaults, normalization and ownership applied
fn content_document(
    unit: &ReconciliationUnit,
    rendered: &Value,
) -> Result<ManifestDocument, ManifestError> {
    let mut body = normalize_secret(rendered.clone());
    if let Some(obj) = body.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String("v1".to_string()));
        obj.entry("kind")
            .or_insert_with(|| Value::String("Secret".to_string()));
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata
                .entry("name")
                .or_insert_with(|| Value::String(unit.id.name.clone()));
            metadata
                .entry("namespace")
                .or_insert_with(|| Value::String(unit.id.scope.clone()));
        }
    }
    Ok(ManifestDocument::from_value(body, &unit.id.scope)?.with_owner(&unit.id))
}

/// Annotate a content document with the generations it was rendered at
fn stamp_generations(
    content: &ManifestDocument,
    source_generation: u64,
    rendered_generation: u64,
) -> Result<ManifestDocument, ManifestError> {
    let mut body = content.body().clone();
    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                SOURCE_GENERATION_ANNOTATION.to_string(),
                Value::String(source_generation.to_string()),
            );
            annotations.insert(
                RENDERED_GENERATION_ANNOTATION.to_string(),
                Value::String(rendered_generation.to_string()),
            );
        }
    }
    ManifestDocument::from_value(body, &content.id().scope)
}
