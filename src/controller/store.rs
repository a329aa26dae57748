//! # Object Store
//!
//! Everything the sidecars read from or write to the Kubernetes API, behind a
//! trait so the provisioning engine and the reconcilers can run against an
//! in-memory store in tests.

use crate::crd::{VolumeSnapshot, VolumeSnapshotContent};
use crate::driver::{Credentials, PublishContext};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, Secret, SecretReference,
};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass, VolumeAttachment};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Status transitions written back to a `VolumeAttachment`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentStatusUpdate {
    /// Attach succeeded; clears any previous attach error
    Attached(PublishContext),
    /// Detach succeeded; clears the publish context and any detach error
    Detached,
    AttachFailed(String),
    DetachFailed(String),
}

impl AttachmentStatusUpdate {
    /// JSON merge patch for the status subresource
    #[must_use]
    pub fn to_patch(&self, now: &str) -> serde_json::Value {
        match self {
            Self::Attached(context) => json!({
                "status": {
                    "attached": true,
                    "attachmentMetadata": context,
                    "attachError": null,
                }
            }),
            Self::Detached => json!({
                "status": {
                    "attached": false,
                    "attachmentMetadata": null,
                    "detachError": null,
                }
            }),
            Self::AttachFailed(message) => json!({
                "status": {
                    "attachError": {"message": message, "time": now},
                }
            }),
            Self::DetachFailed(message) => json!({
                "status": {
                    "detachError": {"message": message, "time": now},
                }
            }),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_volume_snapshot(&self, namespace: &str, name: &str)
        -> Result<Option<VolumeSnapshot>>;

    async fn get_volume_snapshot_content(&self, name: &str)
        -> Result<Option<VolumeSnapshotContent>>;

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a volume. A volume that already exists counts as created.
    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<()>;

    /// Delete a volume. A volume that is already gone counts as deleted.
    async fn delete_persistent_volume(&self, name: &str) -> Result<()>;

    async fn get_csi_node(&self, name: &str) -> Result<Option<CSINode>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Patch the attachment status, returning the resource version the write produced
    async fn update_attachment_status(
        &self,
        name: &str,
        update: &AttachmentStatusUpdate,
    ) -> Result<Option<String>>;

    /// Replace the finalizer list, conditional on `resource_version` when one is given
    async fn set_attachment_finalizers(
        &self,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Best-effort event on an object; failures are only logged
    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Fetch the secret at `reference` and flatten its data into driver credentials
pub async fn fetch_credentials(
    store: &dyn ObjectStore,
    reference: &SecretReference,
) -> Result<Credentials> {
    let name = reference.name.as_deref().unwrap_or_default();
    let namespace = reference.namespace.as_deref().unwrap_or_default();
    let secret = store.get_secret(namespace, name).await?.ok_or_else(|| {
        Error::Configuration(format!(
            "error getting secret {name} in namespace {namespace}: not found"
        ))
    })?;

    let mut values = BTreeMap::new();
    for (key, value) in secret.data.into_iter().flatten() {
        values.insert(key, String::from_utf8_lossy(&value.0).into_owned());
    }
    for (key, value) in secret.string_data.into_iter().flatten() {
        values.insert(key, value);
    }
    Ok(Credentials::new(values))
}

/// [`ObjectStore`] backed by the Kubernetes API
pub struct KubeObjectStore {
    client: Client,
    recorder: Recorder,
}

impl std::fmt::Debug for KubeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectStore").finish_non_exhaustive()
    }
}

impl KubeObjectStore {
    /// `component` names the event source, e.g. `csi-provisioner`
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }
}

fn not_found_is_none<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        not_found_is_none(api.get(name).await)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        not_found_is_none(api.get(name).await)
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        not_found_is_none(api.get(name).await)
    }

    async fn get_volume_snapshot_content(
        &self,
        name: &str,
    ) -> Result<Option<VolumeSnapshotContent>> {
        let api: Api<VolumeSnapshotContent> = Api::all(self.client.clone());
        not_found_is_none(api.get(name).await)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        not_found_is_none(api.get(name).await)
    }

    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), volume).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                debug!(volume = %volume.name_any(), "PersistentVolume already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_csi_node(&self, name: &str) -> Result<Option<CSINode>> {
        let api: Api<CSINode> = Api::all(self.client.clone());
        not_found_is_none(api.get(name).await)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        not_found_is_none(api.get(name).await)
    }

    async fn update_attachment_status(
        &self,
        name: &str,
        update: &AttachmentStatusUpdate,
    ) -> Result<Option<String>> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        let patch = update.to_patch(&chrono::Utc::now().to_rfc3339());
        let patched = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(patched.resource_version())
    }

    async fn set_attachment_finalizers(
        &self,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&finalizer_patch(resource_version, finalizers)),
        )
        .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                reason,
                object = reference.name.as_deref().unwrap_or_default(),
                "Failed to publish event: {}",
                e
            );
        }
    }
}

/// Merge patch replacing the finalizers; a resource version turns it into a conditional write
fn finalizer_patch(resource_version: Option<&str>, finalizers: Vec<String>) -> serde_json::Value {
    let mut patch = json!({ "metadata": { "finalizers": finalizers } });
    if let Some(version) = resource_version {
        patch["metadata"]["resourceVersion"] = json!(version);
    }
    patch
}
