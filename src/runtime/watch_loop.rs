//! # Watch Loop
//!
//! Runs the controller loops of each sidecar until shutdown.
//!
//! A loop stops gracefully on SIGTERM/SIGINT, or when the leader lease is lost.
//! Losing the lease is an error so the process exits and restarts as a follower.

use crate::controller::attacher::reconcile::{error_policy, reconcile_attachment, AttacherContext};
use crate::controller::leader::Leadership;
use crate::controller::provisioner::reconcile::{
    claim_error_policy, reconcile_claim, reconcile_volume, volume_error_policy, ProvisionerContext,
};
use crate::controller::server::ServerState;
use crate::error::Error;
use futures::{future, Stream, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::Api;
use kube_runtime::reflector::ObjectRef;
use kube::{Client, Resource};
use kube_runtime::controller::{self, Action};
use kube_runtime::{watcher, Controller};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Controller settings shared by the loops of one process
#[derive(Debug)]
pub struct LoopOptions {
    /// Objects reconciled in parallel
    pub workers: u16,
    pub server_state: Arc<ServerState>,
    /// Held leader lease, when leader election is enabled
    pub leadership: Option<Leadership>,
}

/// Run the attachment loop until shutdown
pub async fn run_attacher(
    client: Client,
    ctx: Arc<AttacherContext>,
    options: LoopOptions,
) -> Result<(), anyhow::Error> {
    let attachments: Api<VolumeAttachment> = Api::all(client);
    let lease_lost = Arc::new(AtomicBool::new(false));
    spawn_signal_watch(Arc::clone(&options.server_state));

    info!(driver = %ctx.driver_name, "Starting attacher watch loop");
    options.server_state.set_ready(true);
    let stream = Controller::new(attachments, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(options.workers))
        .graceful_shutdown_on(shutdown_on_lease_loss(options.leadership.as_ref(), &lease_lost))
        .shutdown_on_signal()
        .run(reconcile_attachment, error_policy, ctx);
    drain("attacher", stream).await;

    finish(&options, &lease_lost)
}

/// Run the claim and volume loops until shutdown
pub async fn run_provisioner(
    client: Client,
    ctx: Arc<ProvisionerContext>,
    options: LoopOptions,
) -> Result<(), anyhow::Error> {
    let claims: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let volumes: Api<PersistentVolume> = Api::all(client);
    let lease_lost = Arc::new(AtomicBool::new(false));
    spawn_signal_watch(Arc::clone(&options.server_state));

    info!(
        driver = %ctx.provisioner.settings().driver_name,
        "Starting provisioner watch loops"
    );
    options.server_state.set_ready(true);
    let claim_stream = Controller::new(claims, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(options.workers))
        .graceful_shutdown_on(shutdown_on_lease_loss(options.leadership.as_ref(), &lease_lost))
        .shutdown_on_signal()
        .run(reconcile_claim, claim_error_policy, Arc::clone(&ctx));
    let volume_stream = Controller::new(volumes, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(options.workers))
        .graceful_shutdown_on(shutdown_on_lease_loss(options.leadership.as_ref(), &lease_lost))
        .shutdown_on_signal()
        .run(reconcile_volume, volume_error_policy, ctx);
    tokio::join!(
        drain("provisioner-claims", claim_stream),
        drain("provisioner-volumes", volume_stream)
    );

    finish(&options, &lease_lost)
}

/// Mark the server not ready as soon as a shutdown signal arrives
fn spawn_signal_watch(server_state: Arc<ServerState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, waiting for in-flight reconciliations to complete...");
            server_state.set_ready(false);
        }
    });
}

/// Resolves when the lease is lost; never resolves without leader election
fn shutdown_on_lease_loss(
    leadership: Option<&Leadership>,
    lease_lost: &Arc<AtomicBool>,
) -> impl Future<Output = ()> + Send + Sync + 'static {
    let lost = leadership.map(Leadership::lost_signal);
    let lease_lost = Arc::clone(lease_lost);
    async move {
        match lost {
            Some(lost) => {
                lost.await;
                error!("Leader lease lost, stopping controller");
                lease_lost.store(true, Ordering::Relaxed);
            }
            None => future::pending::<()>().await,
        }
    }
}

async fn drain<K, S>(controller: &'static str, stream: S)
where
    K: Resource,
    S: Stream<Item = Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>>,
{
    stream
        .for_each(|result| {
            match result {
                Ok((object, action)) => {
                    debug!(controller, %object, ?action, "watch.event.reconciled");
                }
                Err(controller::Error::ReconcilerFailed(e, object)) => {
                    debug!(controller, %object, error = %e, "watch.event.reconciliation_failed");
                }
                Err(e) => warn!(controller, "Controller stream error: {}", e),
            }
            future::ready(())
        })
        .await;
}

fn finish(options: &LoopOptions, lease_lost: &AtomicBool) -> Result<(), anyhow::Error> {
    options.server_state.set_ready(false);
    if lease_lost.load(Ordering::Relaxed) {
        return Err(anyhow::anyhow!("leader lease lost"));
    }
    info!("Controller stopped gracefully");
    Ok(())
}
