#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use ebs_shrink::cloud::{
    BlockDeviceMapping, CloudApi, CloudError, CreateSnapshotRequest, CreateVolumeRequest,
    Instance, Snapshot, Tag, Volume, VolumeAttachment,
};
use ebs_shrink::host::{CommandOutput, Host, HostCommand, HostError};
use ebs_shrink::imds::{ImdsError, InstanceIdentity};
use ebs_shrink::Config;

pub const INSTANCE: &str = "i-0abc";
pub const SOURCE_VOLUME: &str = "vol-old";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    DescribeInstance,
    DescribeVolume(String),
    DescribeVolumeStatus(String),
    DescribeSnapshot(String),
    FindVolumesByTag(String, String),
    CreateSnapshot(CreateSnapshotRequest),
    CreateVolume(CreateVolumeRequest),
    CreateTags(String, Vec<Tag>),
    Attach { volume_id: String, device: String },
    Detach { volume_id: String, device: String, force: bool },
}

impl Call {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Call::CreateSnapshot(_)
                | Call::CreateVolume(_)
                | Call::CreateTags(..)
                | Call::Attach { .. }
                | Call::Detach { .. }
        )
    }
}

pub struct FakeCloud {
    pub instance: RefCell<Instance>,
    pub volumes: RefCell<BTreeMap<String, Volume>>,
    pub calls: RefCell<Vec<Call>>,
    /// State reported for every snapshot.
    pub snapshot_state: RefCell<String>,
    /// Status reported for volumes created by the run.
    pub new_volume_status: RefCell<Option<String>>,
    /// State a volume reports once DetachVolume has been accepted.
    pub detach_state: RefCell<String>,
    /// Fail the first call whose name matches.
    pub fail_on: RefCell<Option<&'static str>>,
    next_id: Cell<u32>,
}

pub fn volume(id: &str, size_gib: u32, device: Option<&str>) -> Volume {
    Volume {
        volume_id: id.to_string(),
        availability_zone: "us-east-1a".into(),
        encrypted: true,
        kms_key_id: Some("arn:aws:kms:us-east-1:111:key/abc".into()),
        volume_type: "gp3".into(),
        iops: Some(3000),
        throughput: Some(250),
        size_gib,
        state: if device.is_some() { "in-use" } else { "available" }.into(),
        attachments: device
            .map(|d| {
                vec![VolumeAttachment {
                    instance_id: INSTANCE.into(),
                    device: d.into(),
                    state: "attached".into(),
                }]
            })
            .unwrap_or_default(),
        tags: vec![Tag::new("Name", "data")],
    }
}

impl FakeCloud {
    /// Running, out-of-service instance with `/dev/xvda` root and `vol-old` at `/dev/sdf`.
    pub fn eligible() -> Self {
        let instance = Instance {
            instance_id: INSTANCE.into(),
            state: "running".into(),
            root_device_name: Some("/dev/xvda".into()),
            block_devices: vec![
                BlockDeviceMapping {
                    device_name: "/dev/xvda".into(),
                    volume_id: Some("vol-root".into()),
                },
                BlockDeviceMapping {
                    device_name: "/dev/sdf".into(),
                    volume_id: Some(SOURCE_VOLUME.into()),
                },
            ],
            tags: vec![Tag::new("in_service", "No"), Tag::new("Name", "db-1")],
        };

        let mut volumes = BTreeMap::new();
        volumes.insert("vol-root".to_string(), volume("vol-root", 8, Some("/dev/xvda")));
        volumes.insert(SOURCE_VOLUME.to_string(), volume(SOURCE_VOLUME, 200, Some("/dev/sdf")));

        Self {
            instance: RefCell::new(instance),
            volumes: RefCell::new(volumes),
            calls: RefCell::new(Vec::new()),
            snapshot_state: RefCell::new("completed".into()),
            new_volume_status: RefCell::new(Some("ok".into())),
            detach_state: RefCell::new("available".into()),
            fail_on: RefCell::new(None),
            next_id: Cell::new(1),
        }
    }

    pub fn set_instance_tag(&self, key: &str, value: Option<&str>) {
        let mut instance = self.instance.borrow_mut();
        instance.tags.retain(|t| t.key != key);
        if let Some(value) = value {
            instance.tags.push(Tag::new(key, value));
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutating).collect()
    }

    pub fn volume(&self, id: &str) -> Volume {
        self.volumes.borrow()[id].clone()
    }

    fn record(&self, name: &'static str, call: Call) -> Result<(), CloudError> {
        self.calls.borrow_mut().push(call);
        if *self.fail_on.borrow() == Some(name) {
            return Err(CloudError::Api {
                action: name.to_string(),
                code: "InternalError".into(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.next_id.get();
        self.next_id.set(n + 1);
        format!("{prefix}-new{n}")
    }

    fn not_found(action: &str, id: &str) -> CloudError {
        CloudError::Api {
            action: action.to_string(),
            code: "InvalidVolume.NotFound".into(),
            message: format!("The volume '{id}' does not exist."),
        }
    }
}

impl CloudApi for FakeCloud {
    fn describe_instance(&self, _instance_id: &str) -> Result<Option<Instance>, CloudError> {
        self.record("DescribeInstances", Call::DescribeInstance)?;
        Ok(Some(self.instance.borrow().clone()))
    }

    fn describe_volume(&self, volume_id: &str) -> Result<Volume, CloudError> {
        self.record("DescribeVolumes", Call::DescribeVolume(volume_id.into()))?;
        self.volumes
            .borrow()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Self::not_found("DescribeVolumes", volume_id))
    }

    fn describe_volume_status(&self, volume_id: &str) -> Result<Option<String>, CloudError> {
        self.record(
            "DescribeVolumeStatus",
            Call::DescribeVolumeStatus(volume_id.into()),
        )?;
        if !self.volumes.borrow().contains_key(volume_id) {
            return Err(Self::not_found("DescribeVolumeStatus", volume_id));
        }
        if volume_id.contains("-new") {
            return Ok(self.new_volume_status.borrow().clone());
        }
        Ok(Some("ok".into()))
    }

    fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, CloudError> {
        self.record("DescribeSnapshots", Call::DescribeSnapshot(snapshot_id.into()))?;
        Ok(Snapshot {
            snapshot_id: snapshot_id.into(),
            state: self.snapshot_state.borrow().clone(),
            progress: Some("100%".into()),
        })
    }

    fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<Volume>, CloudError> {
        self.record(
            "DescribeVolumes",
            Call::FindVolumesByTag(key.into(), value.into()),
        )?;
        Ok(self
            .volumes
            .borrow()
            .values()
            .filter(|v| v.tags.iter().any(|t| t.key == key && t.value == value))
            .cloned()
            .collect())
    }

    fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<String, CloudError> {
        self.record("CreateSnapshot", Call::CreateSnapshot(request.clone()))?;
        Ok(self.next("snap"))
    }

    fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String, CloudError> {
        self.record("CreateVolume", Call::CreateVolume(request.clone()))?;
        let id = self.next("vol");
        self.volumes.borrow_mut().insert(
            id.clone(),
            Volume {
                volume_id: id.clone(),
                availability_zone: request.availability_zone.clone(),
                encrypted: request.encrypted,
                kms_key_id: request.kms_key_id.clone(),
                volume_type: request.volume_type.clone(),
                iops: request.iops,
                throughput: request.throughput,
                size_gib: request.size_gib,
                state: "available".into(),
                attachments: vec![],
                tags: request.tags.clone(),
            },
        );
        Ok(id)
    }

    fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        self.record("CreateTags", Call::CreateTags(resource_id.into(), tags.to_vec()))?;
        if let Some(volume) = self.volumes.borrow_mut().get_mut(resource_id) {
            for tag in tags {
                volume.tags.retain(|t| t.key != tag.key);
                volume.tags.push(tag.clone());
            }
        }
        Ok(())
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        self.record(
            "AttachVolume",
            Call::Attach {
                volume_id: volume_id.into(),
                device: device.into(),
            },
        )?;
        let mut volumes = self.volumes.borrow_mut();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found("AttachVolume", volume_id))?;
        volume.state = "in-use".into();
        volume.attachments = vec![VolumeAttachment {
            instance_id: instance_id.into(),
            device: device.into(),
            state: "attached".into(),
        }];
        self.instance
            .borrow_mut()
            .block_devices
            .push(BlockDeviceMapping {
                device_name: device.into(),
                volume_id: Some(volume_id.into()),
            });
        Ok(())
    }

    fn detach_volume(
        &self,
        volume_id: &str,
        _instance_id: &str,
        device: &str,
        force: bool,
    ) -> Result<(), CloudError> {
        self.record(
            "DetachVolume",
            Call::Detach {
                volume_id: volume_id.into(),
                device: device.into(),
                force,
            },
        )?;
        let mut volumes = self.volumes.borrow_mut();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| Self::not_found("DetachVolume", volume_id))?;
        volume.state = self.detach_state.borrow().clone();
        volume.attachments.clear();
        self.instance
            .borrow_mut()
            .block_devices
            .retain(|m| m.device_name != device);
        Ok(())
    }
}

/// Host with a set of existing paths and a log of the commands it was asked to run.
pub struct FakeHost {
    pub existing: RefCell<HashSet<PathBuf>>,
    pub used_bytes: Cell<u64>,
    pub commands: RefCell<Vec<String>>,
    /// Commands whose display form starts with this prefix exit non-zero.
    pub fail_prefix: RefCell<Option<&'static str>>,
}

impl FakeHost {
    pub fn with_paths(paths: &[&str]) -> Self {
        Self {
            existing: RefCell::new(paths.iter().map(PathBuf::from).collect()),
            used_bytes: Cell::new(10 * 1024 * 1024 * 1024),
            commands: RefCell::new(Vec::new()),
            fail_prefix: RefCell::new(None),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Host for FakeHost {
    fn path_exists(&self, path: &Path) -> bool {
        self.existing.borrow().contains(path)
    }

    fn used_bytes(&self, _path: &Path) -> Result<u64, HostError> {
        Ok(self.used_bytes.get())
    }

    fn run(&self, command: &HostCommand) -> Result<CommandOutput, HostError> {
        let line = command.to_string();
        self.commands.borrow_mut().push(line.clone());

        if let Some(prefix) = *self.fail_prefix.borrow() {
            if line.starts_with(prefix) {
                return Err(HostError::CommandFailed {
                    command: line,
                    status: "exit status: 1".into(),
                    stderr: "injected failure".into(),
                });
            }
        }

        let last = command.args().last().map(PathBuf::from);
        match (command.program(), last) {
            ("mkdir", Some(path)) => {
                self.existing.borrow_mut().insert(path);
            }
            ("rm", Some(path)) => {
                self.existing.borrow_mut().remove(&path);
            }
            _ => {}
        }
        Ok(CommandOutput::default())
    }
}

pub struct Identity(pub &'static str);

impl InstanceIdentity for Identity {
    fn instance_id(&self) -> Result<String, ImdsError> {
        Ok(self.0.to_string())
    }
}

/// One device per `(source, replacement, data_dir, staging_dir, size)` with
/// millisecond polling so waits finish quickly.
pub fn config(devices: &[(&str, &str, &str, &str, u32)]) -> Config {
    let devices: Vec<String> = devices
        .iter()
        .map(|(source, replacement, data, staging, size)| {
            format!(
                r#"{{ "source_device": "{source}", "replacement_device": "{replacement}",
                     "data_dir": "{data}", "staging_dir": "{staging}", "new_size_gib": {size} }}"#
            )
        })
        .collect();
    let raw = format!(
        r#"{{
            "instance_id": "{INSTANCE}",
            "region": "us-east-1",
            "wait": {{ "initial_interval_secs": 0.001, "max_interval_secs": 0.004,
                       "snapshot_deadline_secs": 2, "volume_deadline_secs": 2,
                       "attach_deadline_secs": 2, "detach_deadline_secs": 2 }},
            "devices": [{}]
        }}"#,
        devices.join(",")
    );
    Config::from_json(&raw).unwrap()
}

pub fn standard_config() -> Config {
    config(&[("/dev/sdf", "/dev/sdg", "/data", "/mnt/tmp", 50)])
}

/// Host where `/data` exists and the replacement device node appears at `/dev/sdg`.
pub fn standard_host() -> FakeHost {
    FakeHost::with_paths(&["/data", "/dev/sdg"])
}
