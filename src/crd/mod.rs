//! # Custom Resource Definitions
//!
//! Third-party CRD types read by the sidecars.
//!
//! ## Module Structure
//!
//! - `snapshot.rs` - `VolumeSnapshot` and `VolumeSnapshotContent` (restoring claims from snapshots)

mod snapshot;

pub use snapshot::{
    CsiVolumeSnapshotSource, VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSpec,
    VolumeSnapshotError, VolumeSnapshotSpec, VolumeSnapshotStatus,
};
