//! # Attacher
//!
//! Attaches volumes to nodes for `VolumeAttachment` objects naming this driver.
//!
//! - `handler.rs` - driver-backed and trivial attach/detach
//! - `reconcile.rs` - per-attachment state machine, status and finalizer writes

pub mod handler;
pub mod reconcile;

pub use handler::{attach_access_mode, CsiHandler, Handler, TrivialHandler};
pub use reconcile::{finalizer_name, reconcile_attachment, AttacherContext};
