//! # Provisioner
//!
//! Turns claims into driver volumes and released volumes back into nothing.
//!
//! - [`Provisioner::provision`]: claim + storage class parameters to a `PersistentVolume`
//! - [`Provisioner::delete`]: single delete call for a volume this driver created
//! - [`reconcile`]: the claim and volume watch loops driving the two operations

pub mod content_source;
pub mod quantity;
pub mod reconcile;
pub mod secrets;

use crate::constants::{
    DEFAULT_FS_TYPE, DEFAULT_PROVISIONER_ID_KEY, DEFAULT_VOLUME_NAME_PREFIX, FS_TYPE_PARAMETER,
    PROVISIONED_BY_ANNOTATION, STORAGE_RESOURCE,
};
use crate::controller::store::{fetch_credentials, ObjectStore};
use crate::driver::{
    AccessMode, CapacityRange, CreateVolumeRequest, Credentials, DeleteVolumeRequest,
    DriverClient, VolumeCapability,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use content_source::resolve_content_source;
use quantity::{bytes_to_quantity, parse_bytes};
use secrets::{
    resolve_secret_reference, CONTROLLER_PUBLISH_SECRET, NODE_PUBLISH_SECRET, NODE_STAGE_SECRET,
    PROVISIONER_SECRET,
};

/// Per-process provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Driver name; storage classes select this provisioner by it
    pub driver_name: String,
    /// Identity of this provisioner instance, recorded on every volume it creates
    pub identity: String,
    /// Volume attribute key under which [`Self::identity`] is recorded
    pub identity_key: String,
    pub volume_name_prefix: String,
    /// Keep only this many characters of the claim UID (dashes removed)
    pub volume_name_uuid_length: Option<usize>,
}

impl ProvisionerSettings {
    pub fn new(driver_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            identity: identity.into(),
            identity_key: DEFAULT_PROVISIONER_ID_KEY.to_string(),
            volume_name_prefix: DEFAULT_VOLUME_NAME_PREFIX.to_string(),
            volume_name_uuid_length: None,
        }
    }
}

/// Identity string for a new provisioner process: `<millis>-<random>-<driver>`
#[must_use]
pub fn generate_identity(driver_name: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &random[..8],
        driver_name
    )
}

/// Deterministic volume name for a claim UID
pub fn make_volume_name(prefix: &str, uid: &str, uuid_length: Option<usize>) -> Result<String> {
    if prefix.is_empty() {
        return Err(Error::Configuration(
            "volume name prefix cannot be empty".to_string(),
        ));
    }
    if uid.is_empty() {
        return Err(Error::InvalidObject(
            "corrupted PVC object, it is missing UID".to_string(),
        ));
    }
    match uuid_length {
        None => Ok(format!("{prefix}-{uid}")),
        Some(length) => {
            let stripped: String = uid.chars().filter(|c| *c != '-').collect();
            if length == 0 || length > stripped.len() {
                return Err(Error::Configuration(format!(
                    "volume name UUID length {length} must be between 1 and {}",
                    stripped.len()
                )));
            }
            Ok(format!("{prefix}-{}", &stripped[..length]))
        }
    }
}

/// Check the naming settings against a claim UID of the shape the API server assigns
pub fn validate_volume_naming(prefix: &str, uuid_length: Option<usize>) -> Result<()> {
    const SAMPLE_UID: &str = "00000000-0000-0000-0000-000000000000";
    make_volume_name(prefix, SAMPLE_UID, uuid_length).map(|_| ())
}

/// Inputs of a single provisioning attempt
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub claim: PersistentVolumeClaim,
    pub storage_class_name: String,
    pub parameters: BTreeMap<String, String>,
    pub reclaim_policy: String,
    pub mount_options: Vec<String>,
}

/// Provisioning engine
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn ObjectStore>,
    driver: DriverClient,
    settings: ProvisionerSettings,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("driver", &self.driver)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(store: Arc<dyn ObjectStore>, driver: DriverClient, settings: ProvisionerSettings) -> Self {
        Self {
            store,
            driver,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Name of the volume provisioned for `claim`
    pub fn volume_name_for(&self, claim: &PersistentVolumeClaim) -> Result<String> {
        make_volume_name(
            &self.settings.volume_name_prefix,
            claim.metadata.uid.as_deref().unwrap_or_default(),
            self.settings.volume_name_uuid_length,
        )
    }

    #[instrument(skip_all, fields(claim = %options.claim.name_any(), namespace = %options.claim.namespace().unwrap_or_default()))]
    pub async fn provision(&self, options: &ProvisionOptions) -> Result<PersistentVolume> {
        let claim = &options.claim;
        let spec = claim.spec.clone().unwrap_or_default();
        if spec.selector.is_some() {
            return Err(Error::UnsupportedRequest(
                "claim Selector is not supported".to_string(),
            ));
        }

        let volume_name = self.volume_name_for(claim)?;

        let requested_bytes = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|requests| requests.get(STORAGE_RESOURCE))
            .map(parse_bytes)
            .transpose()?
            .unwrap_or(0);
        if requested_bytes <= 0 {
            return Err(Error::InvalidObject(format!(
                "claim {} does not request any storage",
                claim.name_any()
            )));
        }

        let fs_type = fs_type(&options.parameters);
        let access_modes = spec.access_modes.clone().unwrap_or_default();
        let volume_capabilities: Vec<VolumeCapability> = access_modes
            .iter()
            .filter_map(|mode| AccessMode::from_kubernetes(mode))
            .map(|mode| VolumeCapability::mount(mode, &fs_type))
            .collect();

        let volume_content_source = match spec.data_source.as_ref() {
            Some(source) => Some(
                resolve_content_source(
                    self.store.as_ref(),
                    &claim.namespace().unwrap_or_default(),
                    source,
                    requested_bytes,
                )
                .await?,
            ),
            None => None,
        };

        let provisioner_secret =
            resolve_secret_reference(PROVISIONER_SECRET, &options.parameters, &volume_name, None)?;
        let secrets = match provisioner_secret.as_ref() {
            Some(reference) => fetch_credentials(self.store.as_ref(), reference).await?,
            None => Credentials::default(),
        };
        let controller_publish_secret = resolve_secret_reference(
            CONTROLLER_PUBLISH_SECRET,
            &options.parameters,
            &volume_name,
            Some(claim),
        )?;
        let node_stage_secret = resolve_secret_reference(
            NODE_STAGE_SECRET,
            &options.parameters,
            &volume_name,
            Some(claim),
        )?;
        let node_publish_secret = resolve_secret_reference(
            NODE_PUBLISH_SECRET,
            &options.parameters,
            &volume_name,
            Some(claim),
        )?;

        let request = CreateVolumeRequest {
            name: volume_name.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: requested_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities,
            parameters: options.parameters.clone(),
            secrets,
            volume_content_source,
        };
        let created = self.driver.create_volume(&request).await?;
        info!(volume = %volume_name, volume_id = %created.volume_id, "Driver created volume");

        if created.capacity_bytes < requested_bytes {
            let mut message = format!(
                "created volume capacity {} less than requested capacity {}",
                created.capacity_bytes, requested_bytes
            );
            let cleanup = DeleteVolumeRequest {
                volume_id: created.volume_id.clone(),
                secrets: request.secrets.clone(),
            };
            if let Err(e) = self.driver.delete_volume(&cleanup).await {
                message = format!(
                    "{message}. Cleanup of volume {volume_name} failed, volume is orphaned: {e}"
                );
            }
            return Err(Error::CapacityViolation(message));
        }

        let mut attributes = created.attributes.clone();
        attributes.insert(
            self.settings.identity_key.clone(),
            self.settings.identity.clone(),
        );

        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                annotations: Some(BTreeMap::from([(
                    PROVISIONED_BY_ANNOTATION.to_string(),
                    self.settings.driver_name.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(access_modes),
                capacity: Some(BTreeMap::from([(
                    STORAGE_RESOURCE.to_string(),
                    bytes_to_quantity(created.capacity_bytes),
                )])),
                claim_ref: Some(claim_reference(claim)),
                storage_class_name: Some(options.storage_class_name.clone()),
                persistent_volume_reclaim_policy: Some(options.reclaim_policy.clone()),
                mount_options: (!options.mount_options.is_empty())
                    .then(|| options.mount_options.clone()),
                volume_mode: spec.volume_mode.clone(),
                csi: Some(CSIPersistentVolumeSource {
                    driver: self.settings.driver_name.clone(),
                    volume_handle: created.volume_id.clone(),
                    fs_type: Some(fs_type),
                    read_only: Some(false),
                    volume_attributes: Some(attributes),
                    controller_publish_secret_ref: controller_publish_secret,
                    node_stage_secret_ref: node_stage_secret,
                    node_publish_secret_ref: node_publish_secret,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(
            volume = %volume_name,
            volume_id = %created.volume_id,
            "Successfully created PV for PVC"
        );
        Ok(volume)
    }

    #[instrument(skip_all, fields(volume = %volume.name_any()))]
    pub async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let csi = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .filter(|csi| csi.driver == self.settings.driver_name)
            .ok_or_else(|| {
                Error::InvalidVolume(format!(
                    "volume {} is not a CSI volume of driver {}",
                    volume.name_any(),
                    self.settings.driver_name
                ))
            })?;

        let mut secrets = Credentials::default();
        let class_name = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.storage_class_name.as_deref())
            .unwrap_or_default();
        if !class_name.is_empty() {
            match self.store.get_storage_class(class_name).await? {
                Some(class) => {
                    let parameters = class.parameters.unwrap_or_default();
                    let reference = resolve_secret_reference(
                        PROVISIONER_SECRET,
                        &parameters,
                        &volume.name_any(),
                        None,
                    )?;
                    if let Some(reference) = reference {
                        secrets = fetch_credentials(self.store.as_ref(), &reference).await?;
                    }
                }
                None => warn!(
                    storage_class = class_name,
                    "StorageClass no longer exists, deleting volume without credentials"
                ),
            }
        }

        self.driver
            .delete_volume(&DeleteVolumeRequest {
                volume_id: csi.volume_handle.clone(),
                secrets,
            })
            .await?;
        info!(volume_id = %csi.volume_handle, "Driver deleted volume");
        Ok(())
    }
}

/// Filesystem type parameter, looked up case-insensitively
fn fs_type(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(FS_TYPE_PARAMETER))
        .map(|(_, value)| value.clone())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
}

fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        name: claim.metadata.name.clone(),
        namespace: claim.metadata.namespace.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}
