//! # Controller
//!
//! Core controller modules of both sidecars.
//!
//! - `attacher`: attach/detach handlers and the `VolumeAttachment` reconciler
//! - `backoff`: create-volume retry schedule and per-resource requeue backoff
//! - `leader`: `Lease` based leader election
//! - `provisioner`: provisioning engine and the claim/volume reconcilers
//! - `server`: HTTP server for metrics and health checks
//! - `store`: Kubernetes reads and writes behind the `ObjectStore` trait

pub mod attacher;
pub mod backoff;
pub mod leader;
pub mod provisioner;
pub mod server;
pub mod store;
