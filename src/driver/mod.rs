//! # Driver
//!
//! The remote storage driver as seen by the sidecars.
//!
//! - [`CsiDriver`]: the narrow set of remote operations both sidecars use
//! - [`SocketDriver`]: JSON-over-Unix-socket implementation of [`CsiDriver`]
//! - [`DriverClient`]: timeouts, readiness probing and create-volume retry on top of any [`CsiDriver`]
//! - [`StripSecrets`]: log rendering of requests with secret payloads removed

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod client;
pub mod sanitize;
pub mod socket;
pub mod types;

pub use client::DriverClient;
pub use sanitize::StripSecrets;
pub use socket::SocketDriver;
pub use types::*;

/// Status codes a driver call can fail with (gRPC vocabulary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Failed driver call: a status code plus the driver's description
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: Code,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {:?} desc = {}", self.code, self.message)
    }
}

/// Remote operations of a CSI driver used by the provisioner and the attacher
///
/// Implementations perform exactly one remote call per method. Deadlines and
/// retries are layered on top by [`DriverClient`].
#[async_trait]
pub trait CsiDriver: Send + Sync {
    /// Lightweight health check
    async fn probe(&self) -> Result<(), RpcStatus>;

    /// Identity query, used to learn the driver name
    async fn get_plugin_info(&self) -> Result<PluginInfo, RpcStatus>;

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, RpcStatus>;

    async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<(), RpcStatus>;

    /// Attach. Returns the publish context the node side needs later.
    async fn controller_publish_volume(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, RpcStatus>;

    /// Detach.
    async fn controller_unpublish_volume(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<(), RpcStatus>;
}
