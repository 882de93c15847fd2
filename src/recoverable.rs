use crate::cloud::{tag_value, CloudApi, CloudError, Volume};
use crate::tags;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableVolume {
    pub volume_id: String,
    pub state: String,
    pub size_gib: u32,
    pub original_host: Option<String>,
    pub replaced_by: Option<String>,
    pub mount_point: Option<String>,
    pub device: Option<String>,
    pub retired_at: Option<String>,
}

impl From<&Volume> for RecoverableVolume {
    fn from(volume: &Volume) -> Self {
        let tag = |key: &str| tag_value(&volume.tags, key).map(str::to_string);
        Self {
            volume_id: volume.volume_id.clone(),
            state: volume.state.clone(),
            size_gib: volume.size_gib,
            original_host: tag(tags::ORIGINAL_HOST),
            replaced_by: tag(tags::REPLACED_BY_VOLUME),
            mount_point: tag(tags::ORIGINAL_MOUNT_POINT),
            device: tag(tags::DEVICE),
            retired_at: tag(tags::CREATED_AT),
        }
    }
}

pub fn list_recoverable<C: CloudApi + ?Sized>(
    cloud: &C,
) -> Result<Vec<RecoverableVolume>, CloudError> {
    let volumes = cloud.find_volumes_by_tag(tags::RECOVER_ME, tags::RECOVER_ME_VALUE)?;
    let mut found: Vec<RecoverableVolume> = volumes.iter().map(RecoverableVolume::from).collect();
    found.sort_by(|a, b| a.retired_at.cmp(&b.retired_at));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Tag;

    #[test]
    fn reads_recovery_tags() {
        let volume = Volume {
            volume_id: "vol-old".into(),
            availability_zone: "us-east-1a".into(),
            encrypted: false,
            kms_key_id: None,
            volume_type: "gp3".into(),
            iops: None,
            throughput: None,
            size_gib: 200,
            state: "available".into(),
            attachments: vec![],
            tags: vec![
                Tag::new(tags::REPLACED_BY_VOLUME, "vol-new"),
                Tag::new(tags::ORIGINAL_MOUNT_POINT, "/data"),
                Tag::new(tags::RECOVER_ME, "Yes"),
            ],
        };
        let recoverable = RecoverableVolume::from(&volume);
        assert_eq!(recoverable.replaced_by.as_deref(), Some("vol-new"));
        assert_eq!(recoverable.mount_point.as_deref(), Some("/data"));
        assert_eq!(recoverable.original_host, None);
    }
}
