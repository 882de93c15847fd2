use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cloud::CloudApi;
use crate::config::{CopyConsistency, WaitSettings};
use crate::error::MigrationError;
use crate::host::{nvme_alias, Host, HostCommand};
use crate::wait::{poll_until, Poll};

const ATTACHED: &str = "attached";
const VOLUME_OK: &str = "ok";

pub fn attach<C: CloudApi + ?Sized>(
    cloud: &C,
    instance_id: &str,
    volume_id: &str,
    device_name: &str,
    wait: &WaitSettings,
) -> Result<(), MigrationError> {
    info!(%volume_id, %instance_id, device = %device_name, "AttachVolume");
    cloud.attach_volume(volume_id, instance_id, device_name)?;

    poll_until(&wait.attach(), &format!("{volume_id} to attach"), || {
        let volume = cloud.describe_volume(volume_id)?;
        let attachment = volume.attachment_state(instance_id).unwrap_or("detached");
        let status = cloud.describe_volume_status(volume_id)?;
        info!(%volume_id, attachment, ?status, "attach status");

        Ok(if attachment == ATTACHED && status.as_deref() == Some(VOLUME_OK) {
            Poll::Ready(())
        } else {
            Poll::Pending(format!(
                "attachment {}, status {}",
                attachment,
                status.as_deref().unwrap_or("unknown")
            ))
        })
    })?;

    println!("New storage connected at {}", device_name);
    Ok(())
}

/// Device nodes the kernel may expose for a volume attached as `device_name`.
fn candidate_nodes(device_name: &str, volume_id: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(device_name)];
    if let Some(suffix) = device_name.strip_prefix("/dev/sd") {
        candidates.push(PathBuf::from(format!("/dev/xvd{suffix}")));
    }
    candidates.push(nvme_alias(volume_id));
    candidates
}

/// Local block device for the attached volume, waiting for udev if needed.
pub fn resolve_device<H: Host + ?Sized>(
    host: &H,
    device_name: &str,
    volume_id: &str,
    wait: &WaitSettings,
) -> Result<PathBuf, MigrationError> {
    let candidates = candidate_nodes(device_name, volume_id);
    let found = poll_until(&wait.attach(), &format!("device node for {volume_id}"), || {
        Ok(match candidates.iter().find(|p| host.path_exists(p)) {
            Some(path) => Poll::Ready(path.clone()),
            None => Poll::Pending("no device node yet".into()),
        })
    });

    match found {
        Ok(path) => {
            info!(%volume_id, device = %path.display(), "resolved local device");
            Ok(path)
        }
        Err(MigrationError::Timeout { .. }) => Err(MigrationError::DeviceNotVisible {
            volume_id: volume_id.to_string(),
            device: device_name.to_string(),
        }),
        Err(other) => Err(other),
    }
}

fn run<H: Host + ?Sized>(host: &H, command: HostCommand) -> Result<String, MigrationError> {
    info!(command = %command, "running");
    let output = host.run(&command)?;
    Ok(output.stdout)
}

/// Create the filesystem and mount the new device at the staging directory.
pub fn format_and_mount<H: Host + ?Sized>(
    host: &H,
    local_device: &Path,
    filesystem: &str,
    staging_dir: &Path,
) -> Result<(), MigrationError> {
    println!("Setting up file system on {}", local_device.display());

    let probe = run(host, HostCommand::new("file").arg("-s").arg(local_device))?;
    info!(device = %local_device.display(), probe = %probe.trim(), "device probed");

    run(
        host,
        HostCommand::new("mkfs")
            .arg("-t")
            .arg(filesystem)
            .arg(local_device),
    )?;
    // Parent must exist; only the leaf is removed again after the swap.
    run(host, HostCommand::new("mkdir").arg(staging_dir))?;
    run(
        host,
        HostCommand::new("mount").arg(local_device).arg(staging_dir),
    )?;

    info!(device = %local_device.display(), staging_dir = %staging_dir.display(), "mounted at staging directory");
    Ok(())
}

fn rsync(data_dir: &Path, staging_dir: &Path) -> HostCommand {
    // Trailing slash: copy the contents, not the directory itself.
    let source = format!("{}/", data_dir.display());
    HostCommand::new("rsync")
        .arg("-a")
        .arg(source)
        .arg(staging_dir)
}

/// One-way, permission-preserving copy from the live data directory.
pub fn copy<H: Host + ?Sized>(
    host: &H,
    data_dir: &Path,
    staging_dir: &Path,
    consistency: CopyConsistency,
) -> Result<(), MigrationError> {
    println!(
        "Copying files from {} to {}",
        data_dir.display(),
        staging_dir.display()
    );

    match consistency {
        CopyConsistency::Live => {
            warn!(
                data_dir = %data_dir.display(),
                "copying while the source stays writable; files changed during the copy may be inconsistent"
            );
            run(host, rsync(data_dir, staging_dir))?;
        }
        CopyConsistency::Frozen => {
            info!(data_dir = %data_dir.display(), "freezing source filesystem");
            run(host, HostCommand::new("fsfreeze").arg("--freeze").arg(data_dir))?;

            let copied = run(host, rsync(data_dir, staging_dir));
            let thawed = run(
                host,
                HostCommand::new("fsfreeze").arg("--unfreeze").arg(data_dir),
            );
            copied?;
            thawed?;
        }
    }

    info!(data_dir = %data_dir.display(), staging_dir = %staging_dir.display(), "copy complete");
    Ok(())
}
