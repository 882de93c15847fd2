use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::wait::Backoff;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Instance the run is allowed to mutate. Must match the host's own identity.
    pub instance_id: String,

    /// EC2 region. Looked up from instance metadata when omitted.
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub eligibility: Eligibility,

    /// Filesystem passed to `mkfs -t`.
    #[serde(default = "default_filesystem")]
    pub filesystem: String,

    #[serde(default)]
    pub copy: CopySettings,

    #[serde(default)]
    pub wait: WaitSettings,

    pub devices: Vec<DeviceMigration>,
}

/// One device to move onto a freshly sized volume.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceMigration {
    /// Device name the current volume is attached at (e.g. `/dev/sdf`).
    pub source_device: String,
    /// Free device name the replacement volume gets attached at.
    pub replacement_device: String,
    /// Current mount point of the source volume.
    pub data_dir: PathBuf,
    /// Temporary mount point for the replacement while data is copied.
    pub staging_dir: PathBuf,
    pub new_size_gib: u32,
}

/// Instance tag that marks the host as out of production rotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Eligibility {
    pub key: String,
    pub value: String,
}

impl Default for Eligibility {
    fn default() -> Self {
        Self {
            key: "in_service".to_string(),
            value: "No".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyConsistency {
    /// Copy while the source stays mounted and writable. Files written during
    /// the copy may land in the replacement in an inconsistent state.
    #[default]
    Live,
    /// Freeze the source filesystem for the duration of the copy. Writers
    /// resume at unfreeze; anything written between then and `umount` of the
    /// data directory lands only on the old volume.
    Frozen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopySettings {
    #[serde(default)]
    pub consistency: CopyConsistency,
}

/// Polling limits, in seconds. Fractions are allowed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitSettings {
    pub initial_interval_secs: f64,
    pub max_interval_secs: f64,
    pub snapshot_deadline_secs: f64,
    pub volume_deadline_secs: f64,
    pub attach_deadline_secs: f64,
    pub detach_deadline_secs: f64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            initial_interval_secs: 5.0,
            max_interval_secs: 60.0,
            snapshot_deadline_secs: 6.0 * 60.0 * 60.0,
            volume_deadline_secs: 30.0 * 60.0,
            attach_deadline_secs: 10.0 * 60.0,
            detach_deadline_secs: 10.0 * 60.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl WaitSettings {
    fn backoff(&self, deadline_secs: f64) -> Backoff {
        Backoff::new(
            secs(self.initial_interval_secs),
            secs(self.max_interval_secs),
            secs(deadline_secs),
        )
    }

    pub fn snapshot(&self) -> Backoff {
        self.backoff(self.snapshot_deadline_secs)
    }

    pub fn volume(&self) -> Backoff {
        self.backoff(self.volume_deadline_secs)
    }

    pub fn attach(&self) -> Backoff {
        self.backoff(self.attach_deadline_secs)
    }

    pub fn detach(&self) -> Backoff {
        self.backoff(self.detach_deadline_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("initial_interval_secs", self.initial_interval_secs),
            ("max_interval_secs", self.max_interval_secs),
            ("snapshot_deadline_secs", self.snapshot_deadline_secs),
            ("volume_deadline_secs", self.volume_deadline_secs),
            ("attach_deadline_secs", self.attach_deadline_secs),
            ("detach_deadline_secs", self.detach_deadline_secs),
        ];
        for (name, value) in all {
            if !value.is_finite() || value <= 0.0 || value > 1e9 {
                return Err(ConfigError::Invalid(format!(
                    "wait.{name} must be a positive number of seconds"
                )));
            }
        }
        Ok(())
    }
}

fn default_filesystem() -> String {
    "ext4".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not touch the host. Path safety is checked per
    /// device at run time so one bad entry only skips that entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id is empty".into()));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".into()));
        }
        if self.filesystem.trim().is_empty() {
            return Err(ConfigError::Invalid("filesystem is empty".into()));
        }
        self.wait.validate()?;

        let mut sources = HashSet::new();
        let mut replacements = HashSet::new();
        for device in &self.devices {
            if device.new_size_gib == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: new_size_gib must be at least 1",
                    device.source_device
                )));
            }
            if device.source_device == device.replacement_device {
                return Err(ConfigError::Invalid(format!(
                    "{}: replacement_device must differ from source_device",
                    device.source_device
                )));
            }
            if !sources.insert(device.source_device.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "{} is listed more than once",
                    device.source_device
                )));
            }
            if !replacements.insert(device.replacement_device.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "replacement device {} is listed more than once",
                    device.replacement_device
                )));
            }
        }
        Ok(())
    }
}
