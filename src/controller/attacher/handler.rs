//! # Attach Handlers
//!
//! What the attacher does for a `VolumeAttachment` once it decided to attach or
//! detach it. Chosen once at startup:
//!
//! - [`CsiHandler`]: controller publish/unpublish through the driver
//! - [`TrivialHandler`]: succeeds immediately, for drivers without an attach step

use crate::constants::NODE_ID_ANNOTATION;
use crate::controller::store::{fetch_credentials, ObjectStore};
use crate::driver::{
    AccessMode, Code, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
    Credentials, DriverClient, PublishContext, VolumeCapability,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, PersistentVolume};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait Handler: Send + Sync {
    /// Attach the volume to the node; returns the driver's publish context
    async fn attach(&self, attachment: &VolumeAttachment) -> Result<PublishContext>;

    /// Detach the volume from the node. Detaching a detached volume succeeds.
    async fn detach(&self, attachment: &VolumeAttachment) -> Result<()>;

    /// Last recorded attach outcome
    fn is_attached(&self, attachment: &VolumeAttachment) -> bool {
        attachment.status.as_ref().is_some_and(|s| s.attached)
    }
}

/// Handler for drivers that need no controller-side attach
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialHandler;

#[async_trait]
impl Handler for TrivialHandler {
    async fn attach(&self, attachment: &VolumeAttachment) -> Result<PublishContext> {
        debug!(attachment = %attachment.name_any(), "Trivial attach");
        Ok(PublishContext::new())
    }

    async fn detach(&self, attachment: &VolumeAttachment) -> Result<()> {
        debug!(attachment = %attachment.name_any(), "Trivial detach");
        Ok(())
    }
}

/// Handler calling controller publish/unpublish on the driver
pub struct CsiHandler {
    driver: DriverClient,
    store: Arc<dyn ObjectStore>,
    driver_name: String,
}

impl std::fmt::Debug for CsiHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiHandler")
            .field("driver", &self.driver)
            .field("driver_name", &self.driver_name)
            .finish_non_exhaustive()
    }
}

/// Volume and node coordinates of one attachment
struct Target {
    volume: PersistentVolume,
    csi: CSIPersistentVolumeSource,
    node_id: String,
}

impl CsiHandler {
    pub fn new(
        driver: DriverClient,
        store: Arc<dyn ObjectStore>,
        driver_name: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            store,
            driver_name: driver_name.into(),
        }
    }

    async fn target(&self, attachment: &VolumeAttachment) -> Result<Target> {
        let volume_name = attachment
            .spec
            .source
            .persistent_volume_name
            .as_deref()
            .ok_or_else(|| {
                Error::InvalidVolume(format!(
                    "VolumeAttachment {} does not reference a PersistentVolume",
                    attachment.name_any()
                ))
            })?;
        let volume = self
            .store
            .get_persistent_volume(volume_name)
            .await?
            .ok_or_else(|| {
                Error::InvalidVolume(format!("PersistentVolume {volume_name} not found"))
            })?;
        let csi = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.clone())
            .filter(|csi| csi.driver == self.driver_name)
            .ok_or_else(|| {
                Error::InvalidVolume(format!(
                    "PersistentVolume {volume_name} is not a CSI volume of driver {}",
                    self.driver_name
                ))
            })?;
        let node_id = self.node_id(&attachment.spec.node_name).await?;
        Ok(Target {
            volume,
            csi,
            node_id,
        })
    }

    /// Driver-level node id: `CSINode` first, then the legacy node annotation
    async fn node_id(&self, node_name: &str) -> Result<String> {
        if let Some(csi_node) = self.store.get_csi_node(node_name).await? {
            let registered = csi_node
                .spec
                .drivers
                .iter()
                .find(|driver| driver.name == self.driver_name)
                .map(|driver| driver.node_id.clone())
                .filter(|node_id| !node_id.is_empty());
            if let Some(node_id) = registered {
                return Ok(node_id);
            }
        }

        let node = self
            .store
            .get_node(node_name)
            .await?
            .ok_or_else(|| Error::InvalidObject(format!("node {node_name} not found")))?;
        let annotation = node.annotations().get(NODE_ID_ANNOTATION).ok_or_else(|| {
            Error::InvalidObject(format!(
                "node {node_name} has no {NODE_ID_ANNOTATION} annotation"
            ))
        })?;
        node_id_from_annotation(annotation, &self.driver_name).ok_or_else(|| {
            Error::InvalidObject(format!(
                "node {node_name} has no node id for driver {}",
                self.driver_name
            ))
        })
    }

    async fn credentials(&self, csi: &CSIPersistentVolumeSource) -> Result<Credentials> {
        match csi.controller_publish_secret_ref.as_ref() {
            Some(reference) => fetch_credentials(self.store.as_ref(), reference).await,
            None => Ok(Credentials::default()),
        }
    }
}

#[async_trait]
impl Handler for CsiHandler {
    #[instrument(skip_all, fields(attachment = %attachment.name_any()))]
    async fn attach(&self, attachment: &VolumeAttachment) -> Result<PublishContext> {
        let target = self.target(attachment).await?;
        let access_mode = attach_access_mode(&target.volume)?;
        let fs_type = target.csi.fs_type.clone().unwrap_or_default();
        let request = ControllerPublishVolumeRequest {
            volume_id: target.csi.volume_handle.clone(),
            node_id: target.node_id.clone(),
            volume_capability: VolumeCapability::mount(access_mode, &fs_type),
            readonly: target.csi.read_only.unwrap_or(false),
            secrets: self.credentials(&target.csi).await?,
            volume_attributes: target.csi.volume_attributes.clone().unwrap_or_default(),
        };
        let context = self.driver.controller_publish(&request).await?;
        info!(
            volume_id = %target.csi.volume_handle,
            node_id = %target.node_id,
            "Attached volume"
        );
        Ok(context)
    }

    #[instrument(skip_all, fields(attachment = %attachment.name_any()))]
    async fn detach(&self, attachment: &VolumeAttachment) -> Result<()> {
        let target = self.target(attachment).await?;
        let request = ControllerUnpublishVolumeRequest {
            volume_id: target.csi.volume_handle.clone(),
            node_id: target.node_id.clone(),
            secrets: self.credentials(&target.csi).await?,
        };
        match self.driver.controller_unpublish(&request).await {
            Ok(()) => {}
            Err(e) if e.driver_code() == Some(Code::NotFound) => {
                debug!(volume_id = %target.csi.volume_handle, "Volume already detached");
            }
            Err(e) => return Err(e),
        }
        info!(
            volume_id = %target.csi.volume_handle,
            node_id = %target.node_id,
            "Detached volume"
        );
        Ok(())
    }
}

/// Access mode used for attach, from the volume's access modes
pub fn attach_access_mode(volume: &PersistentVolume) -> Result<AccessMode> {
    let modes = volume
        .spec
        .as_ref()
        .and_then(|spec| spec.access_modes.as_deref())
        .unwrap_or_default();
    let has = |mode: &str| modes.iter().any(|m| m == mode);
    if has("ReadWriteMany") {
        Ok(AccessMode::MultiNodeMultiWriter)
    } else if has("ReadWriteOnce") {
        Ok(AccessMode::SingleNodeWriter)
    } else if has("ReadOnlyMany") {
        Ok(AccessMode::MultiNodeReaderOnly)
    } else {
        Err(Error::UnsupportedRequest(format!(
            "PersistentVolume {} has no supported access mode: {modes:?}",
            volume.name_any()
        )))
    }
}

/// Node id for `driver` from the JSON node annotation
fn node_id_from_annotation(annotation: &str, driver: &str) -> Option<String> {
    serde_json::from_str::<BTreeMap<String, String>>(annotation)
        .ok()?
        .remove(driver)
}
