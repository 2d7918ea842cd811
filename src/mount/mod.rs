//! Local formatting, mounting and unmounting of attached devices.
//!
//! Every operation shells out to a configurable binary through a
//! [`CommandRunner`]; a non-zero exit becomes
//! [`MountError::ExternalToolFailure`] carrying the tool's combined output.

mod runner;

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::allocator::DeviceProbe;
use crate::request::FilesystemType;

pub use runner::{CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner};

/// Read-ahead applied to throughput-oriented volumes, in 512-byte sectors.
pub const DEFAULT_READ_AHEAD_SECTORS: u32 = 2048;

/// Errors raised by the mount executor.
#[derive(Debug, Error)]
pub enum MountError {
    /// The device node is missing.
    #[error("device {device} is not attached")]
    DeviceNotAttached {
        /// Device path checked.
        device: String,
    },
    /// The tool could not be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Error reported by the OS.
        message: String,
    },
    /// The tool ran and reported failure.
    #[error("{command} failed with {status}: {output}")]
    ExternalToolFailure {
        /// Command line that was run.
        command: String,
        /// Exit status description.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },
    /// The mount point directory could not be created.
    #[error("failed to create mount point {path}: {source}")]
    Io {
        /// Directory being created.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl MountError {
    /// Stable label for the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DeviceNotAttached { .. } => "device_not_attached",
            Self::Spawn { .. } => "spawn",
            Self::ExternalToolFailure { .. } => "external_tool_failure",
            Self::Io { .. } => "io",
        }
    }
}

/// Binaries used by the executor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountTools {
    /// Filesystem creation tool.
    pub mkfs: String,
    /// Mount tool.
    pub mount: String,
    /// Unmount tool.
    pub umount: String,
    /// Block device tuning tool.
    pub blockdev: String,
}

impl Default for MountTools {
    fn default() -> Self {
        Self {
            mkfs: String::from("mkfs"),
            mount: String::from("mount"),
            umount: String::from("umount"),
            blockdev: String::from("blockdev"),
        }
    }
}

/// Formats, mounts and unmounts devices on the local host.
pub struct LocalMountExecutor<R> {
    runner: R,
    tools: MountTools,
    probe: Arc<dyn DeviceProbe>,
}

impl<R> LocalMountExecutor<R>
where
    R: CommandRunner,
{
    /// Creates an executor.
    #[must_use]
    pub fn new(runner: R, tools: MountTools, probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            runner,
            tools,
            probe,
        }
    }

    /// Returns the command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Creates a filesystem on `device` and mounts it at `mount_point` with
    /// `noatime`, creating the mount point directory tree first.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::DeviceNotAttached`] when the device node is
    /// missing, [`MountError::Io`] when the mount point cannot be created,
    /// and [`MountError::ExternalToolFailure`] or [`MountError::Spawn`] when
    /// a tool fails.
    pub async fn format_and_mount(
        &self,
        device: &Utf8Path,
        filesystem: FilesystemType,
        mount_point: &Utf8Path,
    ) -> Result<(), MountError> {
        if !self.probe.exists(device) {
            return Err(MountError::DeviceNotAttached {
                device: device.to_string(),
            });
        }

        self.run_tool(
            &self.tools.mkfs,
            &[
                OsString::from("-t"),
                OsString::from(filesystem.as_str()),
                OsString::from(device.as_str()),
            ],
        )
        .await?;

        tokio::fs::create_dir_all(mount_point)
            .await
            .map_err(|source| MountError::Io {
                path: mount_point.to_string(),
                source,
            })?;

        self.run_tool(
            &self.tools.mount,
            &[
                OsString::from("-o"),
                OsString::from("noatime"),
                OsString::from("-t"),
                OsString::from(filesystem.as_str()),
                OsString::from(device.as_str()),
                OsString::from(mount_point.as_str()),
            ],
        )
        .await?;

        info!(%device, %mount_point, %filesystem, "volume formatted and mounted");
        Ok(())
    }

    /// Unmounts `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::ExternalToolFailure`] or [`MountError::Spawn`]
    /// when the unmount tool fails.
    pub async fn unmount(&self, mount_point: &Utf8Path) -> Result<(), MountError> {
        self.run_tool(&self.tools.umount, &[OsString::from(mount_point.as_str())])
            .await?;
        info!(%mount_point, "unmounted");
        Ok(())
    }

    /// Sets the read-ahead window of `device` to `sectors`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::ExternalToolFailure`] or [`MountError::Spawn`]
    /// when the tool fails.
    pub async fn set_read_ahead(&self, device: &Utf8Path, sectors: u32) -> Result<(), MountError> {
        self.run_tool(
            &self.tools.blockdev,
            &[
                OsString::from("--setra"),
                OsString::from(sectors.to_string()),
                OsString::from(device.as_str()),
            ],
        )
        .await
    }

    async fn run_tool(&self, program: &str, args: &[OsString]) -> Result<(), MountError> {
        let command = render_command(program, args);
        debug!(%command, "running tool");
        let output = self.runner.run(program, args).await?;
        if output.is_success() {
            return Ok(());
        }
        Err(MountError::ExternalToolFailure {
            command,
            status: output.status_text(),
            output: output.combined(),
        })
    }
}

fn render_command(program: &str, args: &[OsString]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_owned());
    parts.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(test)]
mod tests;
