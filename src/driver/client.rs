//! # Driver Client
//!
//! Deadlines and retries around a [`CsiDriver`].
//!
//! - every call runs under a fixed per-call timeout; a call that outlives it
//!   fails with `DEADLINE_EXCEEDED`
//! - create-volume is retried on `DEADLINE_EXCEEDED` following a
//!   [`BackoffPolicy`]; any other failure ends the sequence immediately
//! - delete, publish and unpublish are single attempts, the reconcilers requeue
//! - readiness is probed once per second until an overall deadline

use crate::constants::PROBE_INTERVAL;
use crate::controller::backoff::BackoffPolicy;
use crate::driver::{
    Code, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    CsiDriver, DeleteVolumeRequest, PublishContext, RpcStatus, StripSecrets, Volume,
};
use crate::error::{Error, Result};
use crate::observability::metrics;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DriverClient {
    driver: Arc<dyn CsiDriver>,
    timeout: Duration,
    create_backoff: BackoffPolicy,
}

impl fmt::Debug for DriverClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClient")
            .field("timeout", &self.timeout)
            .field("create_backoff", &self.create_backoff)
            .finish_non_exhaustive()
    }
}

impl DriverClient {
    /// Client with the default create-volume schedule
    pub fn new(driver: Arc<dyn CsiDriver>, timeout: Duration) -> Self {
        Self {
            driver,
            timeout,
            create_backoff: BackoffPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_create_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.create_backoff = policy;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one remote call under the per-call timeout and record its outcome
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, RpcStatus>
    where
        F: Future<Output = Result<T, RpcStatus>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RpcStatus::new(
                Code::DeadlineExceeded,
                format!(
                    "{operation} did not complete within {}",
                    humantime::format_duration(self.timeout)
                ),
            )),
        };
        metrics::observe_driver_operation(
            operation,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Probe the driver every second until it answers or `overall` elapses
    pub async fn wait_for_driver_ready(&self, overall: Duration) -> Result<()> {
        let deadline = Instant::now() + overall;
        loop {
            info!("Probing CSI driver for readiness");
            let remaining = deadline.saturating_duration_since(Instant::now());
            let last = match tokio::time::timeout(remaining.min(self.timeout), self.driver.probe())
                .await
            {
                Ok(Ok(())) => {
                    info!("CSI driver is ready");
                    return Ok(());
                }
                Ok(Err(status)) => status.to_string(),
                Err(_) => "probe timed out".to_string(),
            };
            warn!("CSI driver probe failed: {}", last);

            if Instant::now() + PROBE_INTERVAL > deadline {
                return Err(Error::DriverUnavailable(format!(
                    "driver did not become ready within {}: {last}",
                    humantime::format_duration(overall)
                )));
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Driver name as reported by the identity call
    pub async fn driver_name(&self) -> Result<String> {
        let info = self
            .call("GetPluginInfo", self.driver.get_plugin_info())
            .await
            .map_err(Error::Operation)?;
        if info.name.is_empty() {
            return Err(Error::Configuration(
                "driver reported an empty name".to_string(),
            ));
        }
        info!(driver = %info.name, version = %info.vendor_version, "Discovered CSI driver");
        Ok(info.name)
    }

    /// Create a volume, retrying while the driver keeps running out of time
    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume> {
        let mut delays = self.create_backoff.delays();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            debug!(attempt, request = %StripSecrets(request), "CreateVolume");
            match self
                .call("CreateVolume", self.driver.create_volume(request))
                .await
            {
                Ok(volume) => return Ok(volume),
                Err(status) if status.code == Code::DeadlineExceeded => match delays.next() {
                    Some(delay) => {
                        warn!(
                            attempt,
                            volume = %request.name,
                            "CreateVolume timed out, retrying in {}",
                            humantime::format_duration(delay)
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(Error::TransientDriver(status)),
                },
                Err(status) => return Err(Error::Operation(status)),
            }
        }
    }

    pub async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<()> {
        debug!(request = %StripSecrets(request), "DeleteVolume");
        self.call("DeleteVolume", self.driver.delete_volume(request))
            .await
            .map_err(Error::Operation)
    }

    pub async fn controller_publish(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<PublishContext> {
        debug!(request = %StripSecrets(request), "ControllerPublishVolume");
        self.call(
            "ControllerPublishVolume",
            self.driver.controller_publish_volume(request),
        )
        .await
        .map_err(Error::Operation)
    }

    pub async fn controller_unpublish(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        debug!(request = %StripSecrets(request), "ControllerUnpublishVolume");
        self.call(
            "ControllerUnpublishVolume",
            self.driver.controller_unpublish_volume(request),
        )
        .await
        .map_err(Error::Operation)
    }
}
