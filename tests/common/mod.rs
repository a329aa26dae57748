//! Common test utilities
//!
//! In-memory fakes of the driver and the object store, plus fixture builders
//! for the Kubernetes objects the sidecars read.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use csi_sidecar::controller::store::{AttachmentStatusUpdate, ObjectStore};
use csi_sidecar::crd::{VolumeSnapshot, VolumeSnapshotContent};
use csi_sidecar::driver::{
    Code, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    CsiDriver, DeleteVolumeRequest, PluginInfo, PublishContext, RpcStatus, Volume,
};
use csi_sidecar::Result;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass, VolumeAttachment};
use kube_runtime::events::EventType;
use kube::ResourceExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const DRIVER: &str = "hostpath.csi.k8s.io";

/// Scripted [`CsiDriver`]
///
/// Each operation pops its next scripted result; with nothing scripted it
/// succeeds (create returns exactly the requested capacity).
pub struct FakeDriver {
    pub name: String,
    /// Probe answer once the probe script is exhausted
    pub ready: AtomicBool,
    /// Create calls never return; the client's per-call timeout fires
    pub hang_create: AtomicBool,
    pub probes: AtomicUsize,
    probe_results: Mutex<VecDeque<Result<(), RpcStatus>>>,
    create_results: Mutex<VecDeque<Result<Volume, RpcStatus>>>,
    delete_results: Mutex<VecDeque<Result<(), RpcStatus>>>,
    publish_results: Mutex<VecDeque<Result<PublishContext, RpcStatus>>>,
    unpublish_results: Mutex<VecDeque<Result<(), RpcStatus>>>,
    pub create_requests: Mutex<Vec<CreateVolumeRequest>>,
    pub delete_requests: Mutex<Vec<DeleteVolumeRequest>>,
    pub publish_requests: Mutex<Vec<ControllerPublishVolumeRequest>>,
    pub unpublish_requests: Mutex<Vec<ControllerUnpublishVolumeRequest>>,
}

impl FakeDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: AtomicBool::new(true),
            hang_create: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            probe_results: Mutex::default(),
            create_results: Mutex::default(),
            delete_results: Mutex::default(),
            publish_results: Mutex::default(),
            unpublish_results: Mutex::default(),
            create_requests: Mutex::default(),
            delete_requests: Mutex::default(),
            publish_requests: Mutex::default(),
            unpublish_requests: Mutex::default(),
        }
    }

    pub fn script_probe(&self, result: Result<(), RpcStatus>) {
        self.probe_results.lock().unwrap().push_back(result);
    }

    pub fn script_create(&self, result: Result<Volume, RpcStatus>) {
        self.create_results.lock().unwrap().push_back(result);
    }

    pub fn script_delete(&self, result: Result<(), RpcStatus>) {
        self.delete_results.lock().unwrap().push_back(result);
    }

    pub fn script_publish(&self, result: Result<PublishContext, RpcStatus>) {
        self.publish_results.lock().unwrap().push_back(result);
    }

    pub fn script_unpublish(&self, result: Result<(), RpcStatus>) {
        self.unpublish_results.lock().unwrap().push_back(result);
    }

    pub fn create_calls(&self) -> usize {
        self.create_requests.lock().unwrap().len()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_requests.lock().unwrap().len()
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_requests.lock().unwrap().len()
    }

    pub fn unpublish_calls(&self) -> usize {
        self.unpublish_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CsiDriver for FakeDriver {
    async fn probe(&self) -> Result<(), RpcStatus> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.probe_results.lock().unwrap().pop_front() {
            return result;
        }
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcStatus::new(Code::Unavailable, "driver is starting"))
        }
    }

    async fn get_plugin_info(&self) -> Result<PluginInfo, RpcStatus> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: "1.0.0".to_string(),
        })
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, RpcStatus> {
        self.create_requests.lock().unwrap().push(request.clone());
        if self.hang_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let scripted = self.create_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Volume {
                volume_id: format!("vol-{}", request.name),
                capacity_bytes: request
                    .capacity_range
                    .map(|range| range.required_bytes)
                    .unwrap_or_default(),
                attributes: BTreeMap::from([("pool".to_string(), "fast".to_string())]),
            })
        })
    }

    async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<(), RpcStatus> {
        self.delete_requests.lock().unwrap().push(request.clone());
        self.delete_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn controller_publish_volume(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, RpcStatus> {
        self.publish_requests.lock().unwrap().push(request.clone());
        self.publish_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(PublishContext::from([(
                    "devicePath".to_string(),
                    "/dev/xvdb".to_string(),
                )]))
            })
    }

    async fn controller_unpublish_volume(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<(), RpcStatus> {
        self.unpublish_requests.lock().unwrap().push(request.clone());
        self.unpublish_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// Event recorded by [`FakeStore::publish_event`]
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// In-memory [`ObjectStore`]
#[derive(Default)]
pub struct FakeStore {
    secrets: Mutex<HashMap<String, Secret>>,
    storage_classes: Mutex<HashMap<String, StorageClass>>,
    snapshots: Mutex<HashMap<String, VolumeSnapshot>>,
    snapshot_contents: Mutex<HashMap<String, VolumeSnapshotContent>>,
    volumes: Mutex<HashMap<String, PersistentVolume>>,
    csi_nodes: Mutex<HashMap<String, CSINode>>,
    nodes: Mutex<HashMap<String, Node>>,
    pub status_updates: Mutex<Vec<(String, AttachmentStatusUpdate)>>,
    pub finalizer_writes: Mutex<Vec<(String, Vec<String>)>>,
    attachment_versions: Mutex<HashMap<String, u64>>,
    pub events: Mutex<Vec<RecordedEvent>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl FakeStore {
    pub fn add_secret(&self, namespace: &str, name: &str, values: &[(&str, &str)]) {
        let secret: Secret = serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": namespace},
            "stringData": values.iter().copied().collect::<BTreeMap<_, _>>(),
        }))
        .unwrap();
        self.secrets
            .lock()
            .unwrap()
            .insert(key(namespace, name), secret);
    }

    pub fn add_storage_class(&self, class: StorageClass) {
        self.storage_classes
            .lock()
            .unwrap()
            .insert(class.name_any(), class);
    }

    pub fn add_snapshot(&self, snapshot: VolumeSnapshot) {
        let k = key(&snapshot.namespace().unwrap_or_default(), &snapshot.name_any());
        self.snapshots.lock().unwrap().insert(k, snapshot);
    }

    pub fn add_snapshot_content(&self, content: VolumeSnapshotContent) {
        self.snapshot_contents
            .lock()
            .unwrap()
            .insert(content.name_any(), content);
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.name_any(), volume);
    }

    pub fn add_csi_node(&self, csi_node: CSINode) {
        self.csi_nodes
            .lock()
            .unwrap()
            .insert(csi_node.name_any(), csi_node);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name_any(), node);
    }

    /// Track the resource version of an attachment: every write bumps it and
    /// conditional finalizer writes carrying a stale version conflict
    pub fn track_attachment(&self, attachment: &VolumeAttachment) {
        let version = attachment
            .resource_version()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        self.attachment_versions
            .lock()
            .unwrap()
            .insert(attachment.name_any(), version);
    }

    pub fn attachment_version(&self, name: &str) -> Option<String> {
        self.attachment_versions
            .lock()
            .unwrap()
            .get(name)
            .map(u64::to_string)
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().unwrap().get(name).cloned()
    }

    pub fn statuses(&self) -> Vec<(String, AttachmentStatusUpdate)> {
        self.status_updates.lock().unwrap().clone()
    }

    pub fn finalizers(&self) -> Vec<(String, Vec<String>)> {
        self.finalizer_writes.lock().unwrap().clone()
    }

    pub fn recorded_events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.storage_classes.lock().unwrap().get(name).cloned())
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn get_volume_snapshot_content(
        &self,
        name: &str,
    ) -> Result<Option<VolumeSnapshotContent>> {
        Ok(self.snapshot_contents.lock().unwrap().get(name).cloned())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volume(name))
    }

    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<()> {
        self.volumes
            .lock()
            .unwrap()
            .entry(volume.name_any())
            .or_insert_with(|| volume.clone());
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_csi_node(&self, name: &str) -> Result<Option<CSINode>> {
        Ok(self.csi_nodes.lock().unwrap().get(name).cloned())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn update_attachment_status(
        &self,
        name: &str,
        update: &AttachmentStatusUpdate,
    ) -> Result<Option<String>> {
        self.status_updates
            .lock()
            .unwrap()
            .push((name.to_string(), update.clone()));
        let mut versions = self.attachment_versions.lock().unwrap();
        Ok(versions.get_mut(name).map(|version| {
            *version += 1;
            version.to_string()
        }))
    }

    async fn set_attachment_finalizers(
        &self,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let mut versions = self.attachment_versions.lock().unwrap();
        if let Some(current) = versions.get_mut(name) {
            if let Some(expected) = resource_version {
                if expected != current.to_string() {
                    return Err(conflict(name).into());
                }
            }
            *current += 1;
        }
        self.finalizer_writes
            .lock()
            .unwrap()
            .push((name.to_string(), finalizers));
        Ok(())
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: reference.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// 409 as returned by the API server for a stale resource version
fn conflict(name: &str) -> kube::Error {
    kube::Error::Api(
        serde_json::from_value(json!({
            "status": "Failure",
            "message": format!("Operation cannot be fulfilled on volumeattachments {name:?}: the object has been modified"),
            "reason": "Conflict",
            "code": 409,
        }))
        .unwrap(),
    )
}

pub fn claim(name: &str, uid: &str, storage: &str, access_modes: &[&str]) -> PersistentVolumeClaim {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "namespace": "default",
            "uid": uid,
            "resourceVersion": "7",
        },
        "spec": {
            "accessModes": access_modes,
            "storageClassName": "fast",
            "resources": {"requests": {"storage": storage}},
        }
    }))
    .unwrap()
}

pub fn storage_class(name: &str, provisioner: &str, parameters: &[(&str, &str)]) -> StorageClass {
    serde_json::from_value(json!({
        "metadata": {"name": name},
        "provisioner": provisioner,
        "parameters": parameters.iter().copied().collect::<BTreeMap<_, _>>(),
    }))
    .unwrap()
}

/// CSI volume of `driver` named `name` with handle `handle`
pub fn csi_volume(name: &str, driver: &str, handle: &str, access_modes: &[&str]) -> PersistentVolume {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "annotations": {"pv.kubernetes.io/provisioned-by": driver},
        },
        "spec": {
            "accessModes": access_modes,
            "capacity": {"storage": "1Gi"},
            "storageClassName": "fast",
            "persistentVolumeReclaimPolicy": "Delete",
            "csi": {
                "driver": driver,
                "volumeHandle": handle,
                "fsType": "ext4",
            },
        }
    }))
    .unwrap()
}

pub fn attachment(name: &str, attacher: &str, volume: &str, node: &str) -> VolumeAttachment {
    serde_json::from_value(json!({
        "metadata": {"name": name, "resourceVersion": "11"},
        "spec": {
            "attacher": attacher,
            "nodeName": node,
            "source": {"persistentVolumeName": volume},
        }
    }))
    .unwrap()
}

pub fn csi_node(name: &str, driver: &str, node_id: &str) -> CSINode {
    serde_json::from_value(json!({
        "metadata": {"name": name},
        "spec": {"drivers": [{"name": driver, "nodeID": node_id}]},
    }))
    .unwrap()
}
