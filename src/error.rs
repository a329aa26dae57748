//! # Errors
//!
//! Error taxonomy shared by the provisioner and the attacher.
//!
//! Every variant carries a human readable cause. Secret values never end up in
//! these messages: callers only ever format secret *coordinates*.

use crate::driver::{Code, RpcStatus};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad storage class parameters, unresolvable templates, missing secrets.
    #[error("{0}")]
    Configuration(String),

    /// A claim asks for something this provisioner does not do.
    #[error("{0}")]
    UnsupportedRequest(String),

    /// The driver returned a smaller volume than requested.
    #[error("{0}")]
    CapacityViolation(String),

    /// The driver never answered its readiness probe.
    #[error("driver unavailable: {0}")]
    DriverUnavailable(String),

    /// Create-volume kept timing out until the retry schedule ran out.
    #[error("{0}")]
    TransientDriver(RpcStatus),

    /// Any other driver-reported failure.
    #[error("{0}")]
    Operation(RpcStatus),

    /// The volume cannot be handled by this driver.
    #[error("{0}")]
    InvalidVolume(String),

    /// The claim's data source snapshot could not be used.
    #[error("error getting handle for DataSource Type {kind} by Name {name}: {reason}")]
    InvalidContentSource {
        kind: String,
        name: String,
        reason: String,
    },

    /// An orchestrator object is missing fields the sidecar relies on.
    #[error("{0}")]
    InvalidObject(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Short, stable name of the error class, used in status messages and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::UnsupportedRequest(_) => "UnsupportedRequest",
            Self::CapacityViolation(_) => "CapacityViolation",
            Self::DriverUnavailable(_) => "DriverUnavailable",
            Self::TransientDriver(_) => "TransientDriverError",
            Self::Operation(_) => "OperationError",
            Self::InvalidVolume(_) => "InvalidVolume",
            Self::InvalidContentSource { .. } => "InvalidContentSource",
            Self::InvalidObject(_) => "InvalidObject",
            Self::Kube(_) => "KubernetesError",
        }
    }

    /// Whether retrying the same request without any outside change could succeed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnsupportedRequest(_)
                | Self::CapacityViolation(_)
                | Self::InvalidVolume(_)
                | Self::InvalidContentSource { .. }
        )
    }

    /// The driver status code, for errors that came back from the driver.
    #[must_use]
    pub fn driver_code(&self) -> Option<Code> {
        match self {
            Self::TransientDriver(status) | Self::Operation(status) => Some(status.code),
            _ => None,
        }
    }
}
