pub mod credentials;
pub mod ec2;
pub mod sigv4;
pub mod xml;

use thiserror::Error;

pub use credentials::{CredentialProvider, Credentials};
pub use ec2::Ec2Client;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{action} request failed: {source}")]
    Transport {
        action: String,
        source: reqwest::Error,
    },

    #[error("{action} returned {code}: {message}")]
    Api {
        action: String,
        code: String,
        message: String,
    },

    #[error("{action} returned an unreadable response: {detail}")]
    Parse { action: String, detail: String },

    #[error("no AWS credentials available: {0}")]
    Credentials(String),
}

impl CloudError {
    pub(crate) fn parse(action: &str, detail: impl Into<String>) -> Self {
        CloudError::Parse {
            action: action.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Look up a tag value by key.
pub fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key == key)
        .map(|t| t.value.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub state: String,
    pub root_device_name: Option<String>,
    pub block_devices: Vec<BlockDeviceMapping>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub availability_zone: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub volume_type: String,
    pub iops: Option<u32>,
    /// MiB/s, reported for `gp3` only.
    pub throughput: Option<u32>,
    pub size_gib: u32,
    pub state: String,
    pub attachments: Vec<VolumeAttachment>,
    pub tags: Vec<Tag>,
}

impl Volume {
    pub fn attachment_state(&self, instance_id: &str) -> Option<&str> {
        self.attachments
            .iter()
            .find(|a| a.instance_id == instance_id)
            .map(|a| a.state.as_str())
    }
}

/// Volume types whose IOPS must be supplied explicitly on creation.
pub fn requires_iops(volume_type: &str) -> bool {
    matches!(volume_type, "io1" | "io2")
}

/// Volume types that accept a provisioned throughput.
pub fn supports_throughput(volume_type: &str) -> bool {
    volume_type == "gp3"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub state: String,
    pub progress: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub volume_id: String,
    pub description: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub availability_zone: String,
    pub size_gib: u32,
    pub volume_type: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub iops: Option<u32>,
    pub throughput: Option<u32>,
    pub tags: Vec<Tag>,
}

pub trait CloudApi {
    fn describe_instance(&self, instance_id: &str) -> Result<Option<Instance>, CloudError>;

    fn describe_volume(&self, volume_id: &str) -> Result<Volume, CloudError>;

    /// Aggregate health (`ok`, `impaired`, ...). `None` while EC2 has not
    /// published a status for the volume yet.
    fn describe_volume_status(&self, volume_id: &str) -> Result<Option<String>, CloudError>;

    fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, CloudError>;

    /// Volumes carrying tag `key` with value `value`.
    fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<Volume>, CloudError>;

    fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<String, CloudError>;

    fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String, CloudError>;

    fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError>;

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError>;

    fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        force: bool,
    ) -> Result<(), CloudError>;
}
