//! # Snapshot Poller
//!
//! Polls a `SnapshotSource` and publishes a snapshot on a watch channel only
//! when its revision changes. Fetch errors back off with a Fibonacci sequence
//! capped at the poll interval.

use super::{Snapshot, SnapshotSource};
use crate::controller::backoff::FibonacciBackoff;
use crate::observability::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct SnapshotPoller {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
}

impl std::fmt::Debug for SnapshotPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPoller")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl SnapshotPoller {
    #[must_use]
    pub fn new(source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Start polling in a background task
    ///
    /// The receiver holds `None` until the first successful fetch.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> watch::Receiver<Option<Arc<Snapshot>>> {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move { self.run(tx, shutdown).await });
        rx
    }

    async fn run(self, tx: watch::Sender<Option<Arc<Snapshot>>>, shutdown: CancellationToken) {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), self.interval);
        let mut current_revision: Option<String> = None;

        loop {
            let delay = match self.source.current().await {
                Ok(snapshot) => {
                    backoff.reset();
                    if current_revision.as_deref() != Some(snapshot.revision()) {
                        info!(
                            revision = %snapshot.revision(),
                            documents = snapshot.documents().len(),
                            "New snapshot revision"
                        );
                        current_revision = Some(snapshot.revision().to_string());
                        if tx.send(Some(Arc::new(snapshot))).is_err() {
                            return;
                        }
                    }
                    self.interval
                }
                Err(e) => {
                    metrics::increment_snapshot_fetch_errors();
                    let delay = backoff.next_backoff();
                    warn!(error = %e, retry_in = ?delay, "Snapshot fetch failed");
                    delay
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
