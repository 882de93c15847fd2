use tracing::{info, warn};

use crate::cloud::{tag_value, CloudApi, Volume};
use crate::config::{Config, DeviceMigration};
use crate::error::{MigrationError, SkipReason, Step};

const RUNNING: &str = "running";

pub fn inspect<C: CloudApi + ?Sized>(
    cloud: &C,
    config: &Config,
    device: &DeviceMigration,
) -> Result<Step<Volume>, MigrationError> {
    info!(instance_id = %config.instance_id, "DescribeInstances");
    let instance = cloud
        .describe_instance(&config.instance_id)?
        .ok_or_else(|| MigrationError::InstanceNotFound(config.instance_id.clone()))?;
    println!("Got the instance {}. It is {}.", instance.instance_id, instance.state);
    info!(instance_id = %instance.instance_id, state = %instance.state, "found instance");

    if instance.state != RUNNING {
        return Ok(Step::Skip(SkipReason::NotRunning(instance.state)));
    }

    let eligibility = &config.eligibility;
    match tag_value(&instance.tags, &eligibility.key) {
        Some(value) if value == eligibility.value => {
            info!(key = %eligibility.key, value, "instance is out of service");
            println!("Instance marked out of service. Ready to proceed.");
        }
        found => {
            warn!(key = %eligibility.key, ?found, "instance is not marked out of service");
            return Err(MigrationError::NotOutOfService {
                instance_id: instance.instance_id,
                key: eligibility.key.clone(),
                found: found.map(str::to_string),
            });
        }
    }

    if instance.root_device_name.as_deref() == Some(device.source_device.as_str()) {
        return Ok(Step::Skip(SkipReason::RootDevice(device.source_device.clone())));
    }

    if instance
        .block_devices
        .iter()
        .any(|m| m.device_name == device.replacement_device)
    {
        return Ok(Step::Skip(SkipReason::ReplacementInUse(
            device.replacement_device.clone(),
        )));
    }

    let Some(volume_id) = instance
        .block_devices
        .iter()
        .find(|m| m.device_name == device.source_device)
        .and_then(|m| m.volume_id.clone())
    else {
        return Ok(Step::Skip(SkipReason::SourceNotFound(
            device.source_device.clone(),
        )));
    };

    info!(%volume_id, device = %device.source_device, "DescribeVolumes");
    let volume = cloud.describe_volume(&volume_id)?;
    println!(
        "Found! Storage for {} in AZ: {}",
        volume.volume_id, volume.availability_zone
    );
    info!(
        volume_id = %volume.volume_id,
        availability_zone = %volume.availability_zone,
        volume_type = %volume.volume_type,
        size_gib = volume.size_gib,
        encrypted = volume.encrypted,
        "found source volume"
    );
    Ok(Step::Proceed(volume))
}
