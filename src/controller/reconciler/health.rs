//! # Health Gating
//!
//! Polls a resource with `get` until its condition holds or the check's
//! timeout elapses. Checks run in declaration order; the first that does not
//! pass ends the pass.

use super::types::ReconcilerError;
use crate::controller::loader::HealthCheck;
use crate::crd::UnitId;
use crate::manifest::ResourceId;
use crate::observability::metrics;
use crate::provider::common::bounded;
use crate::provider::TargetProvider;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing for health polling
#[derive(Debug, Clone, Copy)]
pub struct HealthPolling {
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
}

pub(crate) fn check_target(check: &HealthCheck, unit: &UnitId) -> ResourceId {
    let target = &check.spec.target;
    ResourceId::new(
        target.kind.clone(),
        target.namespace.clone().unwrap_or_else(|| unit.scope.clone()),
        target.name.clone(),
    )
}

/// Run every check in order
pub async fn run_health_checks(
    target: &dyn TargetProvider,
    unit: &UnitId,
    checks: &[HealthCheck],
    polling: HealthPolling,
    cancel: &CancellationToken,
) -> Result<(), ReconcilerError> {
    for check in checks {
        wait_for(target, unit, check, polling, cancel).await?;
    }
    Ok(())
}

async fn wait_for(
    target: &dyn TargetProvider,
    unit: &UnitId,
    check: &HealthCheck,
    polling: HealthPolling,
    cancel: &CancellationToken,
) -> Result<(), ReconcilerError> {
    let id = check_target(check, unit);
    let name = check.spec.display_name();
    let mut last_observation = "not yet observed".to_string();

    let poll = async {
        loop {
            match bounded("get", polling.operation_timeout, target.get(&id)).await {
                Ok(Some(observed)) if check.spec.condition.holds(&observed.body) => {
                    debug!(check = %name, "Health check passed");
                    return;
                }
                Ok(Some(_)) => {
                    last_observation = format!("{} does not yet hold", check.spec.condition);
                }
                Ok(None) => last_observation = format!("{id} does not exist"),
                Err(e) => {
                    warn!(check = %name, error = %e, "Health check read failed, retrying");
                    last_observation = e.to_string();
                }
            }
            tokio::time::sleep(polling.poll_interval).await;
        }
    };

    tokio::select! {
        () = cancel.cancelled() => Err(ReconcilerError::Cancelled),
        result = tokio::time::timeout(check.timeout, poll) => match result {
            Ok(()) => Ok(()),
            Err(_elapsed) => {
                metrics::increment_health_check_failures();
                Err(ReconcilerError::HealthCheckTimeout {
                    check: name.clone(),
                    timeout: check.timeout,
                    last_observation: last_observation.clone(),
                })
            }
        },
    }
}
