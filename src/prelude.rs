//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use csi_sidecar::prelude::*;
//! ```

pub use crate::error::{Error, Result};

pub use crate::driver::{
    AccessMode, Code, CreateVolumeRequest, CsiDriver, DriverClient, PublishContext, RpcStatus,
    SocketDriver, Volume,
};

pub use crate::controller::attacher::{AttacherContext, CsiHandler, Handler, TrivialHandler};
pub use crate::controller::leader::{LeaderLock, Leadership, LeaseLock};
pub use crate::controller::provisioner::{ProvisionOptions, Provisioner, ProvisionerSettings};
pub use crate::controller::store::{AttachmentStatusUpdate, KubeObjectStore, ObjectStore};

pub use crate::config::{AttacherCli, ControllerConfig, ProvisionerCli};
