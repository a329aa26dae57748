//! # Command Line
//!
//! Flags of the two binaries. Every flag can also be set through the
//! environment variable named next to it; durations take `humantime` strings
//! such as `15s`, `1m` or `10m`.

use clap::{Args, Parser};
use std::time::Duration;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_HASH"),
    ", built ",
    env!("BUILD_DATETIME"),
    ")"
);

/// Flags shared by both sidecars
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Address of the CSI driver socket
    #[arg(long, env = "CSI_ADDRESS", default_value = "/run/csi/socket")]
    pub csi_address: String,

    /// How long to wait for the driver to become ready
    #[arg(long, env = "CONNECTION_TIMEOUT", default_value = "1m", value_parser = humantime::parse_duration)]
    pub connection_timeout: Duration,

    /// Timeout of a single driver call
    #[arg(long, env = "TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Periodic re-check interval of objects in their desired state
    #[arg(long, env = "RESYNC", default_value = "10m", value_parser = humantime::parse_duration)]
    pub resync: Duration,

    /// Number of objects reconciled in parallel
    #[arg(long, env = "WORKER_THREADS", default_value_t = 10)]
    pub worker_threads: u16,

    /// Run only while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION", default_value_t = false)]
    pub leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "default")]
    pub leader_election_namespace: String,

    /// Identity of this instance in the leader lease; defaults to the host name
    #[arg(long, env = "LEADER_ELECTION_IDENTITY")]
    pub leader_election_identity: Option<String>,
}

impl CommonArgs {
    /// Leader identity: the flag, else `POD_NAME`, else `HOSTNAME`
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.leader_election_identity
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|identity| !identity.is_empty())
    }
}

/// Provisions volumes for claims of storage classes naming the driver
#[derive(Debug, Clone, Parser)]
#[command(name = "csi-provisioner", version, long_version = LONG_VERSION)]
pub struct ProvisionerCli {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Provisioner name; defaults to the driver name
    #[arg(long, env = "PROVISIONER")]
    pub provisioner: Option<String>,

    /// Prefix of provisioned volume names
    #[arg(long, env = "VOLUME_NAME_PREFIX", default_value = "pvc")]
    pub volume_name_prefix: String,

    /// Truncate the claim UID in volume names to this many characters; negative keeps it whole
    #[arg(long, env = "VOLUME_NAME_UUID_LENGTH", default_value_t = -1, allow_negative_numbers = true)]
    pub volume_name_uuid_length: i64,
}

impl ProvisionerCli {
    #[must_use]
    pub fn uuid_length(&self) -> Option<usize> {
        usize::try_from(self.volume_name_uuid_length).ok()
    }
}

/// Attaches volumes to nodes for `VolumeAttachment` objects naming the driver
#[derive(Debug, Clone, Parser)]
#[command(name = "csi-attacher", version, long_version = LONG_VERSION)]
pub struct AttacherCli {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Run without a driver, attaching every `csi/dummy` volume immediately
    #[arg(long, env = "DUMMY", default_value_t = false)]
    pub dummy: bool,
}
