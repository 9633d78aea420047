//! # Unit Status
//!
//! Per-unit reconciliation state and the transitions the reconciler drives.

use crate::manifest::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a reconciliation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub enum UnitState {
    /// Loaded but never reconciled at the current generation
    #[default]
    Pending,
    /// A pass is running
    Progressing,
    /// Last pass applied everything and all health checks passed
    Ready,
    /// Last pass failed; retried after the unit's interval
    Failed,
    /// A pass has been running longer than the stall threshold
    Stalled,
}

impl UnitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "Pending",
            UnitState::Progressing => "Progressing",
            UnitState::Ready => "Ready",
            UnitState::Failed => "Failed",
            UnitState::Stalled => "Stalled",
        }
    }

    /// A pass is running for this unit (Stalled passes are still running)
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, UnitState::Progressing | UnitState::Stalled)
    }

    pub const ALL: [UnitState; 5] = [
        UnitState::Pending,
        UnitState::Progressing,
        UnitState::Ready,
        UnitState::Failed,
        UnitState::Stalled,
    ];
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a reconciliation unit
///
/// `generation` is bumped by the controller whenever the unit's desired state
/// may have changed (new snapshot revision, forced refresh). A unit counts as
/// completed for its dependents only while it is Ready at its current generation.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub state: UnitState,
    /// Desired-state generation
    #[serde(default)]
    pub generation: u64,
    /// Generation the last finished pass ran against
    #[serde(default)]
    pub observed_generation: Option<u64>,
    /// Generation of the last pass that reached Ready
    #[serde(default)]
    pub last_successful_generation: Option<u64>,
    /// Start of the last pass
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Completion of the last pass that applied changes
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_apply: Option<DateTime<Utc>>,
    /// Start of the currently running pass
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub progressing_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Snapshot revision of the last successful pass
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// Resources applied by the last successful pass
    #[serde(default)]
    pub inventory: Vec<ResourceId>,
    /// Resource-scoped failures from the last pass, keyed by resource
    #[serde(default)]
    pub resource_errors: BTreeMap<String, String>,
}

impl UnitStatus {
    /// Ready at the current generation: dependents may proceed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == UnitState::Ready && self.observed_generation == Some(self.generation)
    }

    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.state = UnitState::Progressing;
        self.last_attempt = Some(now);
        self.progressing_since = Some(now);
    }

    pub fn succeed(
        &mut self,
        now: DateTime<Utc>,
        generation: u64,
        revision: &str,
        inventory: Vec<ResourceId>,
        applied: bool,
    ) {
        self.state = UnitState::Ready;
        self.observed_generation = Some(generation);
        self.last_successful_generation = Some(generation);
        self.progressing_since = None;
        self.last_error = None;
        self.last_applied_revision = Some(revision.to_string());
        self.inventory = inventory;
        if applied || self.last_apply.is_none() {
            self.last_apply = Some(now);
        }
    }

    pub fn fail(&mut self, generation: u64, error: impl Into<String>) {
        self.state = UnitState::Failed;
        self.observed_generation = Some(generation);
        self.progressing_since = None;
        self.last_error = Some(error.into());
    }

    pub fn stall(&mut self) {
        if self.state == UnitState::Progressing {
            self.state = UnitState::Stalled;
        }
    }
}
