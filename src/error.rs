use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cloud::CloudError;
use crate::host::HostError;
use crate::imds::ImdsError;

/// Failures that stop the whole run.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("configured for instance {expected} but running on {actual}")]
    WrongInstance { expected: String, actual: String },

    #[error("instance {instance_id} is not marked out of service: tag {key} is {}", describe_tag(.found))]
    NotOutOfService {
        instance_id: String,
        key: String,
        found: Option<String>,
    },

    #[error("instance {0} was not returned by DescribeInstances")]
    InstanceNotFound(String),

    #[error("snapshot {snapshot_id} entered state {state}")]
    SnapshotFailed { snapshot_id: String, state: String },

    #[error("volume {volume_id} is attached but no device node appeared for {device}")]
    DeviceNotVisible { volume_id: String, device: String },

    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Metadata(#[from] ImdsError),
}

fn describe_tag(found: &Option<String>) -> String {
    match found {
        Some(value) => format!("{value:?}"),
        None => "missing".to_string(),
    }
}

/// Outcome of a gate that may pass a device over without failing the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Proceed(T),
    Skip(SkipReason),
}

/// Reasons a single device is passed over while the run continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnsafePath { path: PathBuf, why: &'static str },
    StagingExists(PathBuf),
    DataDirMissing(PathBuf),
    InsufficientCapacity { used_bytes: u64, requested_bytes: u64 },
    NotRunning(String),
    RootDevice(String),
    ReplacementInUse(String),
    SourceNotFound(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsafePath { path, why } => {
                write!(f, "unsafe path {}: {}", path.display(), why)
            }
            SkipReason::StagingExists(path) => write!(
                f,
                "staging directory {} already exists; remove it or choose another",
                path.display()
            ),
            SkipReason::DataDirMissing(path) => {
                write!(f, "data directory {} does not exist", path.display())
            }
            SkipReason::InsufficientCapacity {
                used_bytes,
                requested_bytes,
            } => write!(
                f,
                "{} bytes in use do not fit in the requested {} bytes",
                used_bytes, requested_bytes
            ),
            SkipReason::NotRunning(state) => {
                write!(f, "instance must be running, it is {}", state)
            }
            SkipReason::RootDevice(device) => {
                write!(f, "{} is the root device of the instance", device)
            }
            SkipReason::ReplacementInUse(device) => write!(
                f,
                "a volume is already attached at replacement device {}",
                device
            ),
            SkipReason::SourceNotFound(device) => {
                write!(f, "{} is not attached to the instance, nothing to do", device)
            }
        }
    }
}
