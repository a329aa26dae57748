//! # Provisioner Reconcilers
//!
//! Two watch loops feed the provisioning engine:
//!
//! - claims: an unbound claim whose storage class names this driver gets a volume
//! - volumes: a released volume with reclaim policy `Delete` that this driver
//!   provisioned is deleted from the driver, then from the cluster

use crate::constants::PROVISIONED_BY_ANNOTATION;
use crate::controller::backoff::BackoffRegistry;
use crate::controller::store::ObjectStore;
use crate::error::{Error, Result};
use crate::observability::metrics;
use crate::runtime::error_policy::{handle_reconciliation_error, resource_key};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube_runtime::events::EventType;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument};

use super::{ProvisionOptions, Provisioner};

const CLAIM_CONTROLLER: &str = "provisioner-claims";
const VOLUME_CONTROLLER: &str = "provisioner-volumes";
const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// Shared state of the claim and volume loops
pub struct ProvisionerContext {
    pub provisioner: Provisioner,
    pub store: Arc<dyn ObjectStore>,
    pub backoff: BackoffRegistry,
}

impl std::fmt::Debug for ProvisionerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerContext")
            .field("provisioner", &self.provisioner)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ProvisionerContext {
    fn driver_name(&self) -> &str {
        &self.provisioner.settings().driver_name
    }
}

/// Provision a volume for an unbound claim of one of our storage classes
pub async fn reconcile_claim(
    claim: Arc<PersistentVolumeClaim>,
    ctx: Arc<ProvisionerContext>,
) -> Result<Action> {
    let started = Instant::now();
    let span = tracing::info_span!(
        "controller.provisioner.reconcile_claim",
        resource.name = %claim.name_any(),
        resource.namespace = %claim.namespace().unwrap_or_default()
    );
    metrics::increment_reconciliations(CLAIM_CONTROLLER);

    let result = provision_claim(&claim, &ctx).instrument(span).await;
    metrics::observe_reconciliation_duration(CLAIM_CONTROLLER, started.elapsed().as_secs_f64());
    if result.is_ok() {
        ctx.backoff.reset(&resource_key(claim.as_ref()));
    }
    result
}

async fn provision_claim(claim: &PersistentVolumeClaim, ctx: &ProvisionerContext) -> Result<Action> {
    if claim.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let spec = claim.spec.as_ref();
    if spec
        .and_then(|s| s.volume_name.as_deref())
        .is_some_and(|name| !name.is_empty())
    {
        debug!("Claim is already bound");
        return Ok(Action::await_change());
    }
    let Some(class_name) = spec
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|name| !name.is_empty())
    else {
        return Ok(Action::await_change());
    };
    let Some(class) = ctx.store.get_storage_class(class_name).await? else {
        debug!(storage_class = class_name, "StorageClass not found, ignoring claim");
        return Ok(Action::await_change());
    };
    if class.provisioner != ctx.driver_name() {
        return Ok(Action::await_change());
    }

    let volume_name = ctx.provisioner.volume_name_for(claim)?;
    if ctx.store.get_persistent_volume(&volume_name).await?.is_some() {
        debug!(volume = %volume_name, "PersistentVolume already exists");
        return Ok(Action::await_change());
    }

    let options = ProvisionOptions {
        claim: claim.clone(),
        storage_class_name: class_name.to_string(),
        parameters: class.parameters.unwrap_or_default(),
        reclaim_policy: class
            .reclaim_policy
            .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string()),
        mount_options: class.mount_options.unwrap_or_default(),
    };

    let reference = claim.object_ref(&());
    let volume = match ctx.provisioner.provision(&options).await {
        Ok(volume) => volume,
        Err(e) => {
            ctx.store
                .publish_event(
                    &reference,
                    EventType::Warning,
                    "ProvisioningFailed",
                    "Provision",
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    ctx.store.create_persistent_volume(&volume).await?;
    info!(volume = %volume_name, "Provisioned volume for claim");
    ctx.store
        .publish_event(
            &reference,
            EventType::Normal,
            "ProvisioningSucceeded",
            "Provision",
            Some(format!("Successfully provisioned volume {volume_name}")),
        )
        .await;
    Ok(Action::await_change())
}

/// Delete a released volume this driver provisioned
pub async fn reconcile_volume(
    volume: Arc<PersistentVolume>,
    ctx: Arc<ProvisionerContext>,
) -> Result<Action> {
    let started = Instant::now();
    let span = tracing::info_span!(
        "controller.provisioner.reconcile_volume",
        resource.name = %volume.name_any()
    );
    metrics::increment_reconciliations(VOLUME_CONTROLLER);

    let result = release_volume(&volume, &ctx).instrument(span).await;
    metrics::observe_reconciliation_duration(VOLUME_CONTROLLER, started.elapsed().as_secs_f64());
    if result.is_ok() {
        ctx.backoff.reset(&resource_key(volume.as_ref()));
    }
    result
}

/// Whether `volume` is a released volume of `driver_name` that must be deleted
#[must_use]
pub fn should_delete(volume: &PersistentVolume, driver_name: &str) -> bool {
    let released = volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Released");
    let delete_policy = volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some("Delete");
    let ours = volume
        .annotations()
        .get(PROVISIONED_BY_ANNOTATION)
        .is_some_and(|by| by == driver_name);
    released && delete_policy && ours && volume.metadata.deletion_timestamp.is_none()
}

async fn release_volume(volume: &PersistentVolume, ctx: &ProvisionerContext) -> Result<Action> {
    if !should_delete(volume, ctx.driver_name()) {
        return Ok(Action::await_change());
    }

    if let Err(e) = ctx.provisioner.delete(volume).await {
        ctx.store
            .publish_event(
                &volume.object_ref(&()),
                EventType::Warning,
                "VolumeFailedDelete",
                "Delete",
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }
    ctx.store
        .delete_persistent_volume(&volume.name_any())
        .await?;
    info!("Deleted released volume");
    Ok(Action::await_change())
}

pub fn claim_error_policy(
    claim: Arc<PersistentVolumeClaim>,
    error: &Error,
    ctx: Arc<ProvisionerContext>,
) -> Action {
    handle_reconciliation_error(CLAIM_CONTROLLER, claim.as_ref(), error, &ctx.backoff)
}

pub fn volume_error_policy(
    volume: Arc<PersistentVolume>,
    error: &Error,
    ctx: Arc<ProvisionerContext>,
) -> Action {
    handle_reconciliation_error(VOLUME_CONTROLLER, volume.as_ref(), error, &ctx.backoff)
}
