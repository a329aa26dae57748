//! # Constants
//!
//! Shared constants used throughout both sidecars.
//!
//! These values represent reasonable defaults and can be overridden via
//! command line flags or environment variables where applicable.

use std::time::Duration;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default per-resource requeue backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default per-resource requeue backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Initial delay of the create-volume retry schedule
pub const CREATE_VOLUME_BACKOFF_INITIAL: Duration = Duration::from_secs(5);

/// Growth factor of the create-volume retry schedule
pub const CREATE_VOLUME_BACKOFF_FACTOR: f64 = 1.2;

/// Number of create-volume attempts
pub const CREATE_VOLUME_BACKOFF_STEPS: u32 = 10;

/// Interval between driver readiness probes
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Storage class parameter holding the filesystem type (matched case-insensitively)
pub const FS_TYPE_PARAMETER: &str = "fstype";

/// Filesystem used when the storage class does not name one
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Only data source kind a claim may restore from
pub const SNAPSHOT_KIND: &str = "VolumeSnapshot";

/// API group of [`SNAPSHOT_KIND`]
pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Volume attribute recording which provisioner instance created the volume
pub const DEFAULT_PROVISIONER_ID_KEY: &str = "storage.kubernetes.io/csiProvisionerIdentity";

/// Annotation set on every volume this sidecar creates
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Node annotation carrying a JSON map of driver name to node id
pub const NODE_ID_ANNOTATION: &str = "csi.volume.kubernetes.io/nodeid";

/// Attacher name used when running without a driver
pub const DUMMY_ATTACHER_NAME: &str = "csi/dummy";

/// Default prefix of provisioned volume names
pub const DEFAULT_VOLUME_NAME_PREFIX: &str = "pvc";

/// Storage request key on claims and capacity key on volumes
pub const STORAGE_RESOURCE: &str = "storage";

/// How long a leader lease stays valid without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// How long the leader keeps retrying a failed renewal before giving up
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Interval between acquisition attempts and between renewals
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);
