// Retired volumes are tagged only after the detach is confirmed.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

use crate::cloud::{Tag, Volume};

pub const CREATED_BY: &str = "ProcessCreatedBy";
pub const CREATED_AT: &str = "ProcessCreatedTimestamp";
pub const ORIGINAL_HOST: &str = "OriginalHost";
pub const SOURCE_VOLUME: &str = "VolumeId";
pub const HOST_ASSIGNED: &str = "HostAssigned";
pub const REPLACES_VOLUME: &str = "ReplacesVolumeId";
pub const REPLACED_BY_VOLUME: &str = "ReplacedByVolumeId";
pub const ORIGINAL_MOUNT_POINT: &str = "OriginalMountPoint";
pub const DEVICE: &str = "Device";
pub const RECOVER_ME: &str = "RecoverMe";
pub const RECOVER_ME_VALUE: &str = "Yes";

pub const PROCESS_NAME: &str = "ebs-shrink";

/// EC2 rejects more than this many tags per resource.
const MAX_TAGS: usize = 50;

const PROVENANCE_KEYS: &[&str] = &[
    CREATED_BY,
    CREATED_AT,
    ORIGINAL_HOST,
    SOURCE_VOLUME,
    HOST_ASSIGNED,
    REPLACES_VOLUME,
    REPLACED_BY_VOLUME,
    ORIGINAL_MOUNT_POINT,
    DEVICE,
    RECOVER_ME,
];

/// Who created a resource and when. One per device migration so every
/// resource of that migration shares the same timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    instance_id: String,
    timestamp: String,
}

impl Provenance {
    pub fn new(instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    fn base(&self) -> Vec<Tag> {
        vec![
            Tag::new(CREATED_BY, PROCESS_NAME),
            Tag::new(CREATED_AT, &self.timestamp),
        ]
    }

    pub fn snapshot_tags(&self, source_volume_id: &str) -> Vec<Tag> {
        let mut tags = self.base();
        tags.push(Tag::new(ORIGINAL_HOST, &self.instance_id));
        tags.push(Tag::new(SOURCE_VOLUME, source_volume_id));
        tags
    }

    /// The source's own tags carried over, followed by provenance. Reserved
    /// `aws:` keys and stale provenance from an earlier run are dropped.
    pub fn replacement_tags(&self, source: &Volume) -> Vec<Tag> {
        let mut provenance = self.base();
        provenance.push(Tag::new(HOST_ASSIGNED, &self.instance_id));
        provenance.push(Tag::new(REPLACES_VOLUME, &source.volume_id));

        let room = MAX_TAGS - provenance.len();
        let mut tags: Vec<Tag> = source
            .tags
            .iter()
            .filter(|t| !t.key.starts_with("aws:"))
            .filter(|t| !PROVENANCE_KEYS.contains(&t.key.as_str()))
            .take(room)
            .cloned()
            .collect();
        tags.extend(provenance);
        tags
    }

    /// Tags for the retired source volume.
    pub fn recovery_tags(&self, replaced_by: &str, mount_point: &Path, device: &str) -> Vec<Tag> {
        let mut tags = self.base();
        tags.push(Tag::new(ORIGINAL_HOST, &self.instance_id));
        tags.push(Tag::new(REPLACED_BY_VOLUME, replaced_by));
        tags.push(Tag::new(
            ORIGINAL_MOUNT_POINT,
            mount_point.to_string_lossy(),
        ));
        tags.push(Tag::new(DEVICE, device));
        tags.push(Tag::new(RECOVER_ME, RECOVER_ME_VALUE));
        tags
    }
}
