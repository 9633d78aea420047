//! # Common Provider Utilities
//!
//! Timing and timeouts shared by every call the reconciler makes against a target.

use crate::observability::metrics;
use crate::provider::TargetError;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Run a target call bounded by `timeout`, recording its latency
///
/// # Arguments
///
/// * `operation` - Metric label (`get`, `apply`, `delete`, `list`)
/// * `timeout` - Upper bound for the call
/// * `call` - The target call
pub async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, TargetError>
where
    F: Future<Output = Result<T, TargetError>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(TargetError::Timeout(timeout)));
    let elapsed = start.elapsed().as_secs_f64();
    metrics::observe_target_operation_duration(operation, elapsed);
    debug!(operation, elapsed, ok = result.is_ok(), "Target call finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), TargetError> = bounded("get", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TargetError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn test_bounded_passes_through_errors() {
        let result: Result<(), TargetError> = bounded("apply", Duration::from_secs(1), async {
            Err(TargetError::Transport("connection reset".to_string()))
        })
        .await;
        assert!(matches!(result, Err(TargetError::Transport(_))));
    }
}
