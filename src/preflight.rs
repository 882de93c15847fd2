// Identity mismatch is fatal; path problems only skip their device.

use std::path::{Component, Path};
use tracing::{info, warn};

use crate::config::DeviceMigration;
use crate::error::{MigrationError, SkipReason, Step};
use crate::host::Host;
use crate::imds::InstanceIdentity;

const GIB: u64 = 1024 * 1024 * 1024;

pub fn verify_identity<I>(expected: &str, identity: &I) -> Result<(), MigrationError>
where
    I: InstanceIdentity + ?Sized,
{
    info!(instance_id = expected, "checking runtime identity");
    let actual = identity.instance_id()?;
    if actual != expected {
        warn!(expected, %actual, "refusing to run on a different instance");
        return Err(MigrationError::WrongInstance {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn unsafe_reason(path: &Path) -> Option<&'static str> {
    if path.as_os_str().is_empty() {
        return Some("path is empty");
    }
    if !path.is_absolute() {
        return Some("path must be absolute");
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Some("path must not contain '..'");
    }
    if path.parent().is_none() {
        return Some("path is the filesystem root");
    }
    None
}

/// Path safety and existence for one device.
pub fn check_paths<H: Host + ?Sized>(device: &DeviceMigration, host: &H) -> Step<()> {
    info!(staging_dir = %device.staging_dir.display(), data_dir = %device.data_dir.display(), "checking paths");

    for path in [&device.staging_dir, &device.data_dir] {
        if let Some(why) = unsafe_reason(path) {
            return Step::Skip(SkipReason::UnsafePath {
                path: path.clone(),
                why,
            });
        }
    }
    if device.staging_dir.starts_with(&device.data_dir) {
        return Step::Skip(SkipReason::UnsafePath {
            path: device.staging_dir.clone(),
            why: "staging directory must be outside the data directory",
        });
    }
    if device.data_dir.starts_with(&device.staging_dir) {
        return Step::Skip(SkipReason::UnsafePath {
            path: device.staging_dir.clone(),
            why: "staging directory must not contain the data directory",
        });
    }

    if host.path_exists(&device.staging_dir) {
        return Step::Skip(SkipReason::StagingExists(device.staging_dir.clone()));
    }
    if !host.path_exists(&device.data_dir) {
        return Step::Skip(SkipReason::DataDirMissing(device.data_dir.clone()));
    }
    Step::Proceed(())
}

/// The data in use under `data_dir` has to fit on the replacement.
pub fn check_capacity<H: Host + ?Sized>(
    device: &DeviceMigration,
    host: &H,
) -> Result<Step<()>, MigrationError> {
    let used_bytes = host.used_bytes(&device.data_dir)?;
    let requested_bytes = u64::from(device.new_size_gib) * GIB;
    info!(used_bytes, requested_bytes, "checking capacity");

    if used_bytes > requested_bytes {
        return Ok(Step::Skip(SkipReason::InsufficientCapacity {
            used_bytes,
            requested_bytes,
        }));
    }
    Ok(Step::Proceed(()))
}
