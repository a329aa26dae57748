//! Request and response messages exchanged with the driver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

/// Opaque per-node context returned by an attach call
pub type PublishContext = BTreeMap<String, String>;

/// Secret key/value pairs handed to the driver.
///
/// Values are sent to the driver as-is but never rendered by `Debug`, and are
/// zeroed when the map is dropped.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, String>> for Credentials {
    fn from(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|key| (key, "***")))
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    MultiNodeReaderOnly,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Map a Kubernetes volume access mode. Modes without a driver equivalent map to `None`.
    #[must_use]
    pub fn from_kubernetes(mode: &str) -> Option<Self> {
        match mode {
            "ReadWriteOnce" => Some(Self::SingleNodeWriter),
            "ReadWriteMany" => Some(Self::MultiNodeMultiWriter),
            "ReadOnlyMany" => Some(Self::MultiNodeReaderOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountVolume {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub mount: MountVolume,
}

impl VolumeCapability {
    #[must_use]
    pub fn mount(access_mode: AccessMode, fs_type: &str) -> Self {
        Self {
            access_mode,
            mount: MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeContentSource {
    #[serde(rename_all = "camelCase")]
    Snapshot { snapshot_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_content_source: Option<VolumeContentSource>,
}

/// Volume as reported by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub secrets: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub secrets: Credentials,
    #[serde(default)]
    pub volume_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub secrets: Credentials,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub vendor_version: String,
}
