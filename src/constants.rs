//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group for the controller's custom resources
pub const API_GROUP: &str = "reconcile.gitops.io";

/// Label carrying the owning unit's name on every applied resource
pub const OWNER_NAME_LABEL: &str = "reconcile.gitops.io/name";

/// Label carrying the owning unit's scope on every applied resource
pub const OWNER_SCOPE_LABEL: &str = "reconcile.gitops.io/namespace";

/// Annotation recording the source secret generation a rendered secret came from
pub const SOURCE_GENERATION_ANNOTATION: &str = "reconcile.gitops.io/source-generation";

/// Annotation recording the rendered generation of a materialized secret
pub const RENDERED_GENERATION_ANNOTATION: &str = "reconcile.gitops.io/rendered-generation";

/// Annotation an operator bumps on a source secret to force a re-render
pub const FORCE_REFRESH_ANNOTATION: &str = "reconcile.gitops.io/requested-at";

/// Annotation used as the source generation when `metadata.generation` is absent
pub const GENERATION_ANNOTATION: &str = "reconcile.gitops.io/generation";

/// Scope used for documents that do not declare one
pub const DEFAULT_SCOPE: &str = "default";

/// Default HTTP server port for metrics, health probes and the status surface
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default scheduling tick (milliseconds)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default snapshot poll interval (seconds)
pub const DEFAULT_SOURCE_POLL_INTERVAL_SECS: u64 = 30;

/// Default re-check period for units that do not declare an interval
pub const DEFAULT_UNIT_INTERVAL: &str = "5m";

/// A pass running longer than this multiple of its unit's interval is Stalled
pub const DEFAULT_STALL_FACTOR: u32 = 3;

/// Default timeout for a single get/apply/delete call against the target
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Default delay between health check polls (milliseconds)
pub const DEFAULT_HEALTH_POLL_INTERVAL_MS: u64 = 2000;

/// Default timeout for a health check that does not declare one
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: &str = "5m";

/// Default worker pool size
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 4;

/// Default field manager for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "gitops-reconciler";

/// Minimum unit interval (seconds)
pub const MIN_UNIT_INTERVAL_SECS: u64 = 1;
