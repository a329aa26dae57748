//! CSI Sidecar Library
//!
//! Kubernetes sidecar controllers that drive an out-of-process CSI driver:
//!
//! - the provisioner creates volumes for claims and deletes released ones
//! - the attacher attaches volumes to nodes for `VolumeAttachment` objects
//!
//! ```rust
//! use csi_sidecar::prelude::*;
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod driver;
pub mod error;
pub mod observability;
pub mod prelude;
pub mod runtime;

pub use error::{Error, Result};
