// Non-zero exit is an error carrying the command line and stderr.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to stat filesystem at {path}: {source}")]
    Statvfs { path: PathBuf, source: nix::Error },
}

/// A program and its arguments, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait Host {
    fn path_exists(&self, path: &Path) -> bool;

    /// Bytes in use on the filesystem that holds `path`.
    fn used_bytes(&self, path: &Path) -> Result<u64, HostError>;

    fn run(&self, command: &HostCommand) -> Result<CommandOutput, HostError>;
}

/// The machine this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHost;

impl Host for LocalHost {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn used_bytes(&self, path: &Path) -> Result<u64, HostError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|source| HostError::Statvfs {
            path: path.to_path_buf(),
            source,
        })?;
        let fragment = stat.fragment_size() as u64;
        let used_blocks = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64);
        Ok(used_blocks.saturating_mul(fragment))
    }

    fn run(&self, command: &HostCommand) -> Result<CommandOutput, HostError> {
        debug!(command = %command, "running");

        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .map_err(|source| HostError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            error!(command = %command, status = %output.status, stderr = %stderr.trim(), "command failed");
            return Err(HostError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        debug!(command = %command, stdout = %stdout.trim(), "command finished");
        Ok(CommandOutput { stdout, stderr })
    }
}

pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Device node udev creates for an EBS volume exposed as NVMe. On Nitro
/// instances the requested device name (`/dev/sdg`) may never appear.
pub fn nvme_alias(volume_id: &str) -> PathBuf {
    PathBuf::from(format!(
        "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_{}",
        volume_id.replace('-', "")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let cmd = HostCommand::new("mkfs").arg("-t").arg("ext4").arg("/dev/sdg");
        assert_eq!(cmd.to_string(), "mkfs -t ext4 /dev/sdg");
        assert_eq!(cmd.program(), "mkfs");
        assert_eq!(cmd.args(), ["-t", "ext4", "/dev/sdg"]);
    }

    #[test]
    fn successful_command_captures_stdout() {
        let out = LocalHost
            .run(&HostCommand::new("sh").arg("-c").arg("echo hello"))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_is_an_error_with_stderr() {
        let err = LocalHost
            .run(&HostCommand::new("sh").arg("-c").arg("echo boom >&2; exit 3"))
            .unwrap_err();
        match err {
            HostError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert!(command.starts_with("sh -c"));
                assert!(status.contains('3'));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = LocalHost
            .run(&HostCommand::new("definitely-not-a-real-program-xyz"))
            .unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }

    #[test]
    fn path_checks_and_usage_on_real_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalHost.path_exists(dir.path()));
        assert!(!LocalHost.path_exists(&dir.path().join("absent")));
        assert!(LocalHost.used_bytes(dir.path()).is_ok());
        assert!(LocalHost.used_bytes(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn nvme_alias_strips_dash() {
        assert_eq!(
            nvme_alias("vol-0abc123"),
            PathBuf::from("/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_vol0abc123")
        );
    }
}
