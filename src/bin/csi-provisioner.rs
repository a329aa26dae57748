//! # CSI Provisioner
//!
//! Provisions volumes through the connected CSI driver for claims whose storage
//! class names the driver, and deletes released volumes it provisioned.

use anyhow::{Context, Result};
use clap::Parser;
use csi_sidecar::config::ProvisionerCli;
use csi_sidecar::controller::backoff::BackoffRegistry;
use csi_sidecar::controller::leader::{lock_name, LeaderLock, LeaseLock, PROVISIONER_LOCK_PREFIX};
use csi_sidecar::controller::provisioner::reconcile::ProvisionerContext;
use csi_sidecar::controller::provisioner::{
    generate_identity, validate_volume_naming, Provisioner, ProvisionerSettings,
};
use csi_sidecar::controller::store::{KubeObjectStore, ObjectStore};
use csi_sidecar::runtime::initialization::{connect_driver, initialize};
use csi_sidecar::runtime::watch_loop::{run_provisioner, LoopOptions};
use std::sync::Arc;
use tracing::info;

const COMPONENT: &str = "csi-provisioner";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ProvisionerCli::parse();
    // Reject bad naming settings before touching the cluster
    validate_volume_naming(&cli.volume_name_prefix, cli.uuid_length())
        .context("Invalid --volume-name-prefix or --volume-name-uuid-length")?;

    let init = initialize(COMPONENT).await?;
    let (driver, discovered_name) = connect_driver(&cli.common).await?;
    let driver_name = cli
        .provisioner
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or(discovered_name);
    let identity = generate_identity(&driver_name);
    info!(driver = %driver_name, identity = %identity, "Connected to CSI driver");

    let leadership = if cli.common.leader_election {
        let leader_identity = cli.common.identity().unwrap_or_else(|| identity.clone());
        let lock = LeaseLock::new(init.client.clone(), cli.common.leader_election_namespace.clone());
        Some(
            lock.acquire(&lock_name(PROVISIONER_LOCK_PREFIX, &driver_name), &leader_identity)
                .await?,
        )
    } else {
        None
    };

    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(init.client.clone(), COMPONENT));
    let mut settings = ProvisionerSettings::new(driver_name, identity);
    settings.volume_name_prefix.clone_from(&cli.volume_name_prefix);
    settings.volume_name_uuid_length = cli.uuid_length();

    let ctx = Arc::new(ProvisionerContext {
        provisioner: Provisioner::new(Arc::clone(&store), driver, settings),
        store,
        backoff: BackoffRegistry::new(
            init.config.backoff_start_duration(),
            init.config.backoff_max_duration(),
        ),
    });

    run_provisioner(
        init.client,
        ctx,
        LoopOptions {
            workers: cli.common.worker_threads,
            server_state: init.server_state,
            leadership,
        },
    )
    .await
}
