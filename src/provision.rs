use std::time::Instant;
use tracing::info;

use crate::cloud::{
    requires_iops, supports_throughput, CloudApi, CreateSnapshotRequest, CreateVolumeRequest, Volume,
};
use crate::config::{DeviceMigration, WaitSettings};
use crate::error::MigrationError;
use crate::tags::{Provenance, PROCESS_NAME};
use crate::wait::{poll_until, Poll};

const SNAPSHOT_COMPLETED: &str = "completed";
const SNAPSHOT_ERROR: &str = "error";
const VOLUME_OK: &str = "ok";

/// Resources created for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub snapshot_id: String,
    pub volume_id: String,
}

/// Replacement request cloned from `source` except for its size.
pub fn replacement_request(
    source: &Volume,
    size_gib: u32,
    provenance: &Provenance,
) -> CreateVolumeRequest {
    CreateVolumeRequest {
        availability_zone: source.availability_zone.clone(),
        size_gib,
        volume_type: source.volume_type.clone(),
        encrypted: source.encrypted,
        kms_key_id: source.kms_key_id.clone().filter(|_| source.encrypted),
        iops: source.iops.filter(|_| requires_iops(&source.volume_type)),
        throughput: source
            .throughput
            .filter(|_| supports_throughput(&source.volume_type)),
        tags: provenance.replacement_tags(source),
    }
}

pub fn provision<C: CloudApi + ?Sized>(
    cloud: &C,
    instance_id: &str,
    device: &DeviceMigration,
    source: &Volume,
    provenance: &Provenance,
    wait: &WaitSettings,
) -> Result<Provisioned, MigrationError> {
    println!("Creating snapshot of old disk and allocating storage for replacement");
    info!(volume_id = %source.volume_id, "CreateSnapshot");
    let snapshot_id = cloud.create_snapshot(&CreateSnapshotRequest {
        volume_id: source.volume_id.clone(),
        description: format!(
            "Snapshot from {} of {} on {}",
            PROCESS_NAME, source.volume_id, instance_id
        ),
        tags: provenance.snapshot_tags(&source.volume_id),
    })?;

    let request = replacement_request(source, device.new_size_gib, provenance);
    info!(
        availability_zone = %request.availability_zone,
        volume_type = %request.volume_type,
        size_gib = request.size_gib,
        iops = ?request.iops,
        "CreateVolume"
    );
    let volume_id = cloud.create_volume(&request)?;
    println!("Snapshot {} and volume {} requested", snapshot_id, volume_id);

    wait_for_both(cloud, &snapshot_id, &volume_id, wait)?;
    println!("Snapshot complete and new storage is ready to be connected!");
    info!(%snapshot_id, %volume_id, "snapshot complete and replacement available");

    Ok(Provisioned {
        snapshot_id,
        volume_id,
    })
}

/// Each side stops being polled once it has reached its terminal state.
fn wait_for_both<C: CloudApi + ?Sized>(
    cloud: &C,
    snapshot_id: &str,
    volume_id: &str,
    wait: &WaitSettings,
) -> Result<(), MigrationError> {
    let started = Instant::now();
    let volume_deadline = wait.volume().deadline();
    let mut snapshot_done = false;
    let mut volume_done = false;
    let mut progress = String::from("?");

    poll_until(&wait.snapshot(), "snapshot and replacement volume", || {
        if !snapshot_done {
            let snapshot = cloud.describe_snapshot(snapshot_id)?;
            info!(%snapshot_id, state = %snapshot.state, progress = ?snapshot.progress, "snapshot status");
            if snapshot.state == SNAPSHOT_ERROR {
                return Err(MigrationError::SnapshotFailed {
                    snapshot_id: snapshot_id.to_string(),
                    state: snapshot.state,
                });
            }
            snapshot_done = snapshot.state == SNAPSHOT_COMPLETED;
            progress = snapshot.progress.unwrap_or_else(|| snapshot.state.clone());
        }

        if !volume_done {
            let status = cloud.describe_volume_status(volume_id)?;
            info!(%volume_id, ?status, "volume status");
            volume_done = status.as_deref() == Some(VOLUME_OK);
            if !volume_done && started.elapsed() >= volume_deadline {
                return Err(MigrationError::Timeout {
                    what: format!("volume {volume_id} to become available"),
                    elapsed: started.elapsed(),
                });
            }
        }

        Ok(if snapshot_done && volume_done {
            Poll::Ready(())
        } else {
            Poll::Pending(format!(
                "snapshot {} ({}), volume {}",
                if snapshot_done { SNAPSHOT_COMPLETED } else { "pending" },
                progress,
                if volume_done { VOLUME_OK } else { "creating" }
            ))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Tag;
    use chrono::Utc;

    fn source(volume_type: &str, iops: Option<u32>, encrypted: bool) -> Volume {
        Volume {
            volume_id: "vol-old".into(),
            availability_zone: "us-west-2b".into(),
            encrypted,
            kms_key_id: Some("key-1".into()),
            volume_type: volume_type.into(),
            iops,
            throughput: Some(250),
            size_gib: 500,
            state: "in-use".into(),
            attachments: vec![],
            tags: vec![Tag::new("Name", "data")],
        }
    }

    #[test]
    fn replacement_clones_source_except_size() {
        let provenance = Provenance::new("i-1", Utc::now());
        let request = replacement_request(&source("io1", Some(4000), true), 50, &provenance);
        assert_eq!(request.availability_zone, "us-west-2b");
        assert_eq!(request.volume_type, "io1");
        assert_eq!(request.size_gib, 50);
        assert!(request.encrypted);
        assert_eq!(request.kms_key_id.as_deref(), Some("key-1"));
        assert_eq!(request.iops, Some(4000));
        assert_eq!(request.throughput, None);
    }

    #[test]
    fn gp3_keeps_its_throughput() {
        let provenance = Provenance::new("i-1", Utc::now());
        let request = replacement_request(&source("gp3", Some(3000), false), 50, &provenance);
        assert_eq!(request.throughput, Some(250));
        assert_eq!(request.iops, None);
    }

    #[test]
    fn iops_dropped_when_type_does_not_need_it() {
        let provenance = Provenance::new("i-1", Utc::now());
        let request = replacement_request(&source("gp2", Some(300), false), 50, &provenance);
        assert_eq!(request.iops, None);
        assert_eq!(request.kms_key_id, None);
        assert!(!request.encrypted);
    }
}
