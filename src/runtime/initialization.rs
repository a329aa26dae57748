//! # Initialization
//!
//! Process startup shared by both binaries: rustls, tracing, metrics, the
//! probe server, the Kubernetes client and the driver connection.

use crate::config::{CommonArgs, ControllerConfig};
use crate::controller::server::{start_server, ServerState};
use crate::driver::{DriverClient, SocketDriver};
use crate::observability;
use anyhow::{Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Components every sidecar needs once started
pub struct InitializationResult {
    pub client: Client,
    /// Readiness of the probe server
    pub server_state: Arc<ServerState>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Tracing subscriber with `RUST_LOG` filtering, `csi_sidecar=info` by default
pub fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "csi_sidecar=info".into()),
        )
        .try_init()
    {
        warn!("Tracing subscriber already initialized: {}", e);
    }
}

/// Start the runtime of sidecar `component`
///
/// Installs the rustls crypto provider, sets up tracing, registers metrics,
/// starts the probe server (unless disabled) and connects to the API server.
pub async fn initialize(component: &str) -> Result<InitializationResult> {
    // Must happen before any TLS connection is made
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    init_tracing();
    info!("Starting {} v{}", component, env!("CARGO_PKG_VERSION"));
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let config = ControllerConfig::from_env();
    let server_state = Arc::new(ServerState::default());

    if config.enable_metrics {
        observability::metrics::register_metrics()?;

        let port = config.metrics_port;
        let state = Arc::clone(&server_state);
        let server_handle = tokio::spawn(async move {
            if let Err(e) = start_server(port, state).await {
                error!("HTTP server error: {}", e);
            }
        });
        wait_for_server_ready(&server_state, &server_handle, &config).await?;
    } else {
        info!("Metrics and probe server disabled");
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    Ok(InitializationResult {
        client,
        server_state,
        config,
    })
}

/// Wait for the probe server to bind its listener
async fn wait_for_server_ready(
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = config.server_startup_timeout();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_serving.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(config.server_poll_interval()).await;
    }
}

/// Connect to the driver socket, wait for it to answer probes and learn its name
pub async fn connect_driver(args: &CommonArgs) -> Result<(DriverClient, String)> {
    let driver = SocketDriver::new(&args.csi_address);
    info!(address = %driver.path().display(), "Connecting to CSI driver");
    let client = DriverClient::new(Arc::new(driver), args.timeout);
    client
        .wait_for_driver_ready(args.connection_timeout)
        .await
        .context("CSI driver did not become ready")?;
    let name = client
        .driver_name()
        .await
        .context("Failed to get CSI driver name")?;
    Ok((client, name))
}
