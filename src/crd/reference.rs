//! # Unit References
//!
//! Identity of a reconciliation unit and references between units.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of a reconciliation unit: a name within a namespace-like scope
///
/// Ordering follows the `scope/name` string form, which is also the
/// deterministic tie-break used by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct UnitId {
    pub scope: String,
    pub name: String,
}

impl UnitId {
    #[must_use]
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    fn string_form(&self) -> impl Iterator<Item = u8> + '_ {
        self.scope
            .bytes()
            .chain(std::iter::once(b'/'))
            .chain(self.name.bytes())
    }

    /// Parse `scope/name`, or a bare `name` resolved against `default_scope`
    #[must_use]
    pub fn parse(value: &str, default_scope: &str) -> Self {
        match value.split_once('/') {
            Some((scope, name)) => Self::new(scope, name),
            None => Self::new(default_scope, value),
        }
    }
}

impl Ord for UnitId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.string_form()
            .cmp(other.string_form())
            .then_with(|| (&self.scope, &self.name).cmp(&(&other.scope, &other.name)))
    }
}

impl PartialOrd for UnitId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// Reference from one unit to another (`dependsOn` entries)
///
/// When `namespace` is omitted the referencing unit's own scope is used.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl UnitReference {
    /// Resolve the reference relative to the referencing unit's scope
    #[must_use]
    pub fn resolve(&self, default_scope: &str) -> UnitId {
        UnitId::new(
            self.namespace.as_deref().unwrap_or(default_scope),
            self.name.clone(),
        )
    }
}
