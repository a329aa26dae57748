//! Unix socket transport to the driver.
//!
//! Each call opens a fresh connection, writes one JSON request envelope, shuts
//! down the write half and reads the full reply.

use crate::driver::{
    Code, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    CsiDriver, DeleteVolumeRequest, PluginInfo, PublishContext, RpcStatus, StripSecrets, Volume,
};
use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

/// Upper bound on a single reply
const MAX_REPLY_BYTES: u64 = 16 * 1024 * 1024;

/// Request envelope written to the socket
#[derive(Debug, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum DriverRequest<'a> {
    Probe,
    GetPluginInfo,
    CreateVolume(&'a CreateVolumeRequest),
    DeleteVolume(&'a DeleteVolumeRequest),
    ControllerPublishVolume(&'a ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(&'a ControllerUnpublishVolumeRequest),
}

/// Reply envelope read from the socket
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriverReply {
    Ok(serde_json::Value),
    Error(RpcStatus),
}

/// [`CsiDriver`] speaking JSON over a Unix domain socket
#[derive(Debug, Clone)]
pub struct SocketDriver {
    path: PathBuf,
}

impl SocketDriver {
    /// Accepts `unix:///run/csi/socket`, `unix:/run/csi/socket` or a plain path.
    pub fn new(address: &str) -> Self {
        let path = address
            .strip_prefix("unix://")
            .or_else(|| address.strip_prefix("unix:"))
            .unwrap_or(address);
        Self {
            path: PathBuf::from(path),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip_all, fields(socket = %self.path.display(), request = %StripSecrets(request)))]
    async fn call<T: DeserializeOwned>(&self, request: &DriverRequest<'_>) -> Result<T, RpcStatus> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
            RpcStatus::new(
                Code::Unavailable,
                format!("failed to connect to {}: {e}", self.path.display()),
            )
        })?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| RpcStatus::new(Code::Internal, format!("failed to encode request: {e}")))?;
        stream.write_all(&payload).await.map_err(transport)?;
        stream.shutdown().await.map_err(transport)?;

        let mut buf = Vec::new();
        stream
            .take(MAX_REPLY_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(transport)?;

        let reply: DriverReply = serde_json::from_slice(&buf)
            .map_err(|e| RpcStatus::new(Code::Internal, format!("malformed driver reply: {e}")))?;
        debug!(reply = %StripSecrets(&reply), "driver reply received");

        match reply {
            DriverReply::Ok(value) => serde_json::from_value(value).map_err(|e| {
                RpcStatus::new(Code::Internal, format!("unexpected driver reply: {e}"))
            }),
            DriverReply::Error(status) => Err(status),
        }
    }
}

fn transport(e: std::io::Error) -> RpcStatus {
    RpcStatus::new(Code::Unavailable, format!("driver connection failed: {e}"))
}

#[async_trait]
impl CsiDriver for SocketDriver {
    async fn probe(&self) -> Result<(), RpcStatus> {
        self.call::<IgnoredAny>(&DriverRequest::Probe)
            .await
            .map(|_| ())
    }

    async fn get_plugin_info(&self) -> Result<PluginInfo, RpcStatus> {
        self.call(&DriverRequest::GetPluginInfo).await
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, RpcStatus> {
        self.call(&DriverRequest::CreateVolume(request)).await
    }

    async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<(), RpcStatus> {
        self.call::<IgnoredAny>(&DriverRequest::DeleteVolume(request))
            .await
            .map(|_| ())
    }

    async fn controller_publish_volume(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, RpcStatus> {
        self.call::<Option<PublishContext>>(&DriverRequest::ControllerPublishVolume(request))
            .await
            .map(Option::unwrap_or_default)
    }

    async fn controller_unpublish_volume(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<(), RpcStatus> {
        self.call::<IgnoredAny>(&DriverRequest::ControllerUnpublishVolume(request))
            .await
            .map(|_| ())
    }
}
