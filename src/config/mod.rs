//! # Configuration
//!
//! - `cli.rs` - process flags of `csi-provisioner` and `csi-attacher`
//! - `controller.rs` - ambient settings from environment variables

pub mod cli;
pub mod controller;

pub use cli::{AttacherCli, CommonArgs, ProvisionerCli};
pub use controller::ControllerConfig;
