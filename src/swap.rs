// The source volume is never deleted.

use std::path::Path;
use tracing::info;

use crate::cloud::CloudApi;
use crate::config::{DeviceMigration, WaitSettings};
use crate::error::MigrationError;
use crate::host::{Host, HostCommand};
use crate::tags::Provenance;
use crate::wait::{poll_until, Poll};

const AVAILABLE: &str = "available";

/// Unmount staging and data directory, then mount the new device at the data directory.
pub fn remount<H: Host + ?Sized>(
    host: &H,
    local_device: &Path,
    device: &DeviceMigration,
) -> Result<(), MigrationError> {
    info!(staging_dir = %device.staging_dir.display(), data_dir = %device.data_dir.display(), "unmounting");
    host.run(&HostCommand::new("umount").arg(&device.staging_dir))?;
    host.run(&HostCommand::new("umount").arg(&device.data_dir))?;

    host.run(
        &HostCommand::new("mount")
            .arg(local_device)
            .arg(&device.data_dir),
    )?;
    println!(
        "Mounted {} at {}",
        local_device.display(),
        device.data_dir.display()
    );
    info!(device = %local_device.display(), data_dir = %device.data_dir.display(), "replacement mounted at data directory");
    Ok(())
}

/// Detach the source, wait until it is `available`, then tag it for recovery.
pub fn retire<C: CloudApi + ?Sized>(
    cloud: &C,
    instance_id: &str,
    source_volume_id: &str,
    replacement_volume_id: &str,
    device: &DeviceMigration,
    provenance: &Provenance,
    wait: &WaitSettings,
) -> Result<(), MigrationError> {
    println!("Detaching old volume {}", source_volume_id);
    info!(volume_id = %source_volume_id, device = %device.source_device, "DetachVolume");
    cloud.detach_volume(source_volume_id, instance_id, &device.source_device, false)?;

    poll_until(&wait.detach(), &format!("{source_volume_id} to detach"), || {
        let volume = cloud.describe_volume(source_volume_id)?;
        info!(volume_id = %source_volume_id, state = %volume.state, "detach status");
        Ok(if volume.state == AVAILABLE {
            Poll::Ready(())
        } else {
            Poll::Pending(volume.state)
        })
    })?;

    let tags = provenance.recovery_tags(replacement_volume_id, &device.data_dir, &device.source_device);
    info!(volume_id = %source_volume_id, replaced_by = %replacement_volume_id, "tagging retired volume for recovery");
    cloud.create_tags(source_volume_id, &tags)?;
    Ok(())
}

pub fn remove_staging<H: Host + ?Sized>(host: &H, staging_dir: &Path) -> Result<(), MigrationError> {
    info!(staging_dir = %staging_dir.display(), "removing staging directory");
    host.run(&HostCommand::new("rm").arg("-r").arg(staging_dir))?;
    Ok(())
}
