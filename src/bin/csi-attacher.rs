//! # CSI Attacher
//!
//! Attaches volumes to nodes for `VolumeAttachment` objects whose attacher is the
//! connected CSI driver. With `--dummy` no driver is used and every `csi/dummy`
//! attachment is marked attached immediately.

use anyhow::Result;
use clap::Parser;
use csi_sidecar::config::AttacherCli;
use csi_sidecar::constants::DUMMY_ATTACHER_NAME;
use csi_sidecar::controller::attacher::{AttacherContext, CsiHandler, Handler, TrivialHandler};
use csi_sidecar::controller::backoff::BackoffRegistry;
use csi_sidecar::controller::leader::{lock_name, LeaderLock, LeaseLock, ATTACHER_LOCK_PREFIX};
use csi_sidecar::controller::store::{KubeObjectStore, ObjectStore};
use csi_sidecar::runtime::initialization::{connect_driver, initialize};
use csi_sidecar::runtime::watch_loop::{run_attacher, LoopOptions};
use std::sync::Arc;
use tracing::info;

const COMPONENT: &str = "csi-attacher";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AttacherCli::parse();
    let init = initialize(COMPONENT).await?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(init.client.clone(), COMPONENT));

    let (driver_name, handler): (String, Arc<dyn Handler>) = if cli.dummy {
        info!("Running in dummy mode, no CSI driver is used");
        (DUMMY_ATTACHER_NAME.to_string(), Arc::new(TrivialHandler))
    } else {
        let (driver, name) = connect_driver(&cli.common).await?;
        info!(driver = %name, "Connected to CSI driver");
        let handler = CsiHandler::new(driver, Arc::clone(&store), name.clone());
        (name, Arc::new(handler))
    };

    let leadership = if cli.common.leader_election {
        let identity = cli
            .common
            .identity()
            .unwrap_or_else(|| format!("{COMPONENT}-{}", uuid::Uuid::new_v4()));
        let lock = LeaseLock::new(init.client.clone(), cli.common.leader_election_namespace.clone());
        Some(
            lock.acquire(&lock_name(ATTACHER_LOCK_PREFIX, &driver_name), &identity)
                .await?,
        )
    } else {
        None
    };

    let ctx = Arc::new(AttacherContext {
        driver_name,
        handler,
        store,
        resync: cli.common.resync,
        backoff: BackoffRegistry::new(
            init.config.backoff_start_duration(),
            init.config.backoff_max_duration(),
        ),
    });

    run_attacher(
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
