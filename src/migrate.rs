// Skips continue with the next device; any error after the first mutating call ends the run.

use chrono::Utc;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};

use crate::cloud::{CloudApi, CreateVolumeRequest};
use crate::config::{Config, DeviceMigration};
use crate::error::{MigrationError, SkipReason, Step};
use crate::host::Host;
use crate::imds::InstanceIdentity;
use crate::tags::Provenance;
use crate::{inspect, preflight, provision, swap, transfer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub snapshot_id: String,
    pub retired_volume_id: String,
    pub replacement_volume_id: String,
    pub local_device: PathBuf,
}

/// What a real run would create, reported by dry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub source_volume_id: String,
    pub replacement: CreateVolumeRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Completed(Completed),
    Skipped(SkipReason),
    Planned(Plan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub source_device: String,
    pub outcome: DeviceOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub devices: Vec<DeviceReport>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, DeviceOutcome::Completed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, DeviceOutcome::Skipped(_)))
            .count()
    }
}

pub struct Migrator<'a, C: CloudApi + ?Sized, H: Host + ?Sized> {
    config: Config,
    cloud: &'a C,
    host: &'a H,
    dry_run: bool,
}

impl<'a, C: CloudApi + ?Sized, H: Host + ?Sized> Migrator<'a, C, H> {
    pub fn new(config: Config, cloud: &'a C, host: &'a H) -> Self {
        Self {
            config,
            cloud,
            host,
            dry_run: false,
        }
    }

    /// Stop each device after inspection, issuing no mutating call.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run<I: InstanceIdentity + ?Sized>(&self, identity: &I) -> Result<RunReport, MigrationError> {
        info!(instance_id = %self.config.instance_id, dry_run = self.dry_run, "run started");
        preflight::verify_identity(&self.config.instance_id, identity)?;

        let mut report = RunReport::default();
        for device in &self.config.devices {
            let span = info_span!("device", source = %device.source_device);
            let _guard = span.enter();

            let outcome = self.migrate_device(device).inspect_err(|e| {
                error!(error = %e, "run aborted");
            })?;

            match &outcome {
                DeviceOutcome::Skipped(reason) => {
                    warn!(%reason, "device skipped");
                    println!("Skipping {}: {}", device.source_device, reason);
                }
                DeviceOutcome::Planned(plan) => {
                    info!(source_volume_id = %plan.source_volume_id, "dry run planned");
                    println!(
                        "Would replace {} ({}) with a {} GiB {} volume in {}",
                        device.source_device,
                        plan.source_volume_id,
                        plan.replacement.size_gib,
                        plan.replacement.volume_type,
                        plan.replacement.availability_zone
                    );
                }
                DeviceOutcome::Completed(done) => {
                    info!(
                        replacement_volume_id = %done.replacement_volume_id,
                        retired_volume_id = %done.retired_volume_id,
                        "device complete"
                    );
                    println!(
                        "Process complete! Mounted new device {} to {} on instance {}",
                        device.replacement_device,
                        device.data_dir.display(),
                        self.config.instance_id
                    );
                }
            }

            report.devices.push(DeviceReport {
                source_device: device.source_device.clone(),
                outcome,
            });
        }

        info!(
            completed = report.completed(),
            skipped = report.skipped(),
            "run finished"
        );
        Ok(report)
    }

    fn migrate_device(&self, device: &DeviceMigration) -> Result<DeviceOutcome, MigrationError> {
        if let Step::Skip(reason) = preflight::check_paths(device, self.host) {
            return Ok(DeviceOutcome::Skipped(reason));
        }
        if let Step::Skip(reason) = preflight::check_capacity(device, self.host)? {
            return Ok(DeviceOutcome::Skipped(reason));
        }

        let source = match inspect::inspect(self.cloud, &self.config, device)? {
            Step::Proceed(volume) => volume,
            Step::Skip(reason) => return Ok(DeviceOutcome::Skipped(reason)),
        };

        let instance_id = self.config.instance_id.as_str();
        let wait = &self.config.wait;
        let provenance = Provenance::new(instance_id, Utc::now());
        info!(volume_id = %source.volume_id, created_at = provenance.timestamp(), "source volume eligible");

        if self.dry_run {
            return Ok(DeviceOutcome::Planned(Plan {
                source_volume_id: source.volume_id.clone(),
                replacement: provision::replacement_request(
                    &source,
                    device.new_size_gib,
                    &provenance,
                ),
            }));
        }

        let created = provision::provision(
            self.cloud,
            instance_id,
            device,
            &source,
            &provenance,
            wait,
        )?;

        transfer::attach(
            self.cloud,
            instance_id,
            &created.volume_id,
            &device.replacement_device,
            wait,
        )?;
        let local_device = transfer::resolve_device(
            self.host,
            &device.replacement_device,
            &created.volume_id,
            wait,
        )?;
        transfer::format_and_mount(
            self.host,
            &local_device,
            &self.config.filesystem,
            &device.staging_dir,
        )?;
        transfer::copy(
            self.host,
            &device.data_dir,
            &device.staging_dir,
            self.config.copy.consistency,
        )?;

        swap::remount(self.host, &local_device, device)?;
        swap::retire(
            self.cloud,
            instance_id,
            &source.volume_id,
            &created.volume_id,
            device,
            &provenance,
            wait,
        )?;
        swap::remove_staging(self.host, &device.staging_dir)?;

        Ok(DeviceOutcome::Completed(Completed {
            snapshot_id: created.snapshot_id,
            retired_volume_id: source.volume_id,
            replacement_volume_id: created.volume_id,
            local_device,
        }))
    }
}
