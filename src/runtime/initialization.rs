//! # Initialization
//!
//! Controller initialization: rustls setup, tracing, metrics, target and
//! secret source backends, and HTTP server startup.

use crate::config::{ControllerConfig, ServerConfig, TargetMode};
use crate::controller::reconciler::Reconciler;
use crate::controller::runtime::{Controller, ControllerSettings};
use crate::controller::secrets::SecretPipeline;
use crate::controller::server::{start_server, ServerState};
use crate::observability;
use crate::provider::kubernetes::{KubeSecretSource, KubeTarget};
use crate::provider::memory::{InMemoryTarget, StaticSecretSource};
use crate::provider::{SecretSourceProvider, TargetProvider};
use anyhow::{Context, Result};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything the run loop needs
pub struct InitializationResult {
    pub config: ControllerConfig,
    pub controller: Arc<Controller>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// Present in Kubernetes target mode
    pub client: Option<Client>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("config", &self.config)
            .field(
                "server_ready",
                &self.server_state.is_ready.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before any client is built
    let rustls_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    let config = ControllerConfig::from_env();
    let server_config = ServerConfig::from_env();
    observability::logging::init_tracing(&config)?;
    if !rustls_installed {
        warn!("A rustls crypto provider was already installed, keeping it");
    }

    info!("Starting GitOps reconciliation controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let (target, secret_source, client): (
        Arc<dyn TargetProvider>,
        Arc<dyn SecretSourceProvider>,
        Option<Client>,
    ) = match config.target_mode {
        TargetMode::Kubernetes => {
            let client = Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?;
            (
                Arc::new(KubeTarget::new(client.clone(), config.field_manager.clone())),
                Arc::new(KubeSecretSource::new(client.clone())),
                Some(client),
            )
        }
        TargetMode::Memory => {
            warn!("TARGET_MODE=memory: desired state is applied to an in-process target only");
            (
                Arc::new(InMemoryTarget::new()),
                Arc::new(StaticSecretSource::new()),
                None,
            )
        }
    };

    let secrets = Arc::new(SecretPipeline::new(
        secret_source,
        Arc::clone(&target),
        config.operation_timeout(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        target,
        secrets,
        config.operation_timeout(),
        config.health_poll_interval(),
    ));
    let controller = Arc::new(Controller::new(reconciler, ControllerSettings::from(&config)));

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
        controller: Arc::clone(&controller),
    });

    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Readiness probes should pass before the first pass is dispatched
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    info!(
        source_path = %config.source_path.display(),
        target_mode = ?config.target_mode,
        max_concurrent = config.max_concurrent_reconciliations,
        "Controller initialized, starting run loop..."
    );

    Ok(InitializationResult {
        config,
        controller,
        server_state,
        client,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = server_config.startup_timeout();
    let poll_interval = server_config.poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}
