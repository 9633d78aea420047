//! # Run Loop
//!
//! Wires the snapshot poller and the source secret watch into the controller
//! and drives it until SIGINT/SIGTERM.

use super::initialization::InitializationResult;
use crate::provider::kubernetes::start_source_secret_watch;
use crate::source::{DirectorySource, SnapshotPoller, SnapshotSource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

/// Run the controller until a shutdown signal arrives
pub async fn run_controller(init: InitializationResult) -> Result<(), anyhow::Error> {
    let InitializationResult {
        config,
        controller,
        server_state,
        client,
    } = init;
    let shutdown = CancellationToken::new();

    // Mark not ready on SIGTERM/SIGINT, then let running passes wind down
    let signal_shutdown = shutdown.clone();
    let signal_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        signal_state.is_ready.store(false, Ordering::Relaxed);
        signal_shutdown.cancel();
    });

    let source = Arc::new(DirectorySource::new(config.source_path.clone())) as Arc<dyn SnapshotSource>;
    let snapshots = SnapshotPoller::new(source, config.source_poll_interval()).spawn(shutdown.clone());

    if let Some(client) = client {
        let (tx, mut rx) = mpsc::unbounded_channel();
        start_source_secret_watch(client, tx);
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    changed = rx.recv() => {
                        let Some(source) = changed else { break };
                        let units = controller.on_source_secret_changed(&source);
                        if !units.is_empty() {
                            info!(source = %source, units = units.len(), "Source secret changed, refreshing secret units");
                        }
                    }
                }
            }
        });
    }

    let span = tracing::info_span!("controller.run", source_path = %config.source_path.display());
    controller.run(snapshots, shutdown).instrument(span).await;

    info!("Controller stopped");
    Ok(())
}
