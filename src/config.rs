//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::allocator::{AllocatorPolicy, DEFAULT_DEVICE_PREFIX};
use crate::lifecycle::LifecycleSettings;
use crate::metadata::DEFAULT_METADATA_ENDPOINT;
use crate::mount::MountTools;
use crate::poller::PollPolicy;

/// Tuning and endpoint settings merged from defaults, `ebsmount.toml` and
/// `EBSMOUNT_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "EBSMOUNT",
    discovery(
        app_name = "ebsmount",
        env_var = "EBSMOUNT_CONFIG_PATH",
        config_file_name = "ebsmount.toml",
        dotfile_name = ".ebsmount.toml",
        project_file_name = "ebsmount.toml"
    )
)]
pub struct EbsmountConfig {
    /// EC2 endpoint override, for example a local emulator. Defaults to the
    /// regional endpoint.
    pub ec2_endpoint: Option<String>,
    /// Region override. Defaults to the region reported by the metadata
    /// service.
    pub region: Option<String>,
    /// Instance metadata service base URL.
    #[ortho_config(default = DEFAULT_METADATA_ENDPOINT.to_owned())]
    pub metadata_endpoint: String,
    /// Maximum describe attempts per state wait.
    #[ortho_config(default = 60)]
    pub poll_max_attempts: u32,
    /// Base delay between describe attempts in milliseconds.
    #[ortho_config(default = 5_000)]
    pub poll_interval_ms: u64,
    /// Jitter applied either side of the poll interval in milliseconds.
    #[ortho_config(default = 1_000)]
    pub poll_jitter_ms: u64,
    /// Upper bound of the backoff after a contended slot in milliseconds.
    #[ortho_config(default = 500)]
    pub attach_backoff_ms: u64,
    /// Checks for the device node after an attachment is confirmed.
    #[ortho_config(default = 30)]
    pub device_wait_checks: u32,
    /// Delay between device node checks in milliseconds.
    #[ortho_config(default = 1_000)]
    pub device_wait_interval_ms: u64,
    /// Retries for throttled or failed detach calls.
    #[ortho_config(default = 10)]
    pub detach_retries: u32,
    /// Delay between detach retries in milliseconds.
    #[ortho_config(default = 1_000)]
    pub detach_retry_delay_ms: u64,
    /// Device path prefix joined with the slot letter.
    #[ortho_config(default = DEFAULT_DEVICE_PREFIX.to_owned())]
    pub device_prefix: String,
    /// Read-ahead in 512-byte sectors for `st1` and `sc1` volumes.
    #[ortho_config(default = 2_048)]
    pub read_ahead_sectors: u32,
    /// Filesystem creation binary.
    #[ortho_config(default = "mkfs".to_owned())]
    pub mkfs_bin: String,
    /// Mount binary.
    #[ortho_config(default = "mount".to_owned())]
    pub mount_bin: String,
    /// Unmount binary.
    #[ortho_config(default = "umount".to_owned())]
    pub umount_bin: String,
    /// Block device tuning binary.
    #[ortho_config(default = "blockdev".to_owned())]
    pub blockdev_bin: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to ebsmount.toml",
            self.env_var, self.toml_key
        )
    }
}

impl EbsmountConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u32, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be at least 1: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("ebsmount")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required string is
    /// empty and [`ConfigError::Invalid`] when a count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.metadata_endpoint,
            &FieldMetadata::new(
                "metadata endpoint",
                "EBSMOUNT_METADATA_ENDPOINT",
                "metadata_endpoint",
            ),
        )?;
        Self::require_field(
            &self.device_prefix,
            &FieldMetadata::new(
                "device prefix",
                "EBSMOUNT_DEVICE_PREFIX",
                "device_prefix",
            ),
        )?;
        for (value, metadata) in [
            (
                &self.mkfs_bin,
                FieldMetadata::new("mkfs binary", "EBSMOUNT_MKFS_BIN", "mkfs_bin"),
            ),
            (
                &self.mount_bin,
                FieldMetadata::new("mount binary", "EBSMOUNT_MOUNT_BIN", "mount_bin"),
            ),
            (
                &self.umount_bin,
                FieldMetadata::new("umount binary", "EBSMOUNT_UMOUNT_BIN", "umount_bin"),
            ),
            (
                &self.blockdev_bin,
                FieldMetadata::new("blockdev binary", "EBSMOUNT_BLOCKDEV_BIN", "blockdev_bin"),
            ),
        ] {
            Self::require_field(value, &metadata)?;
        }
        Self::require_positive(
            self.poll_max_attempts,
            &FieldMetadata::new(
                "poll attempts",
                "EBSMOUNT_POLL_MAX_ATTEMPTS",
                "poll_max_attempts",
            ),
        )?;
        Self::require_positive(
            self.device_wait_checks,
            &FieldMetadata::new(
                "device wait checks",
                "EBSMOUNT_DEVICE_WAIT_CHECKS",
                "device_wait_checks",
            ),
        )?;
        Ok(())
    }

    /// Builds lifecycle settings from the configured tuning values.
    #[must_use]
    pub fn settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            poll: PollPolicy {
                max_attempts: self.poll_max_attempts,
                interval: Duration::from_millis(self.poll_interval_ms),
                jitter: Duration::from_millis(self.poll_jitter_ms),
            },
            allocator: AllocatorPolicy {
                device_prefix: self.device_prefix.clone(),
                max_backoff: Duration::from_millis(self.attach_backoff_ms),
                device_wait_checks: self.device_wait_checks,
                device_wait_interval: Duration::from_millis(self.device_wait_interval_ms),
                start_offset: None,
            },
            detach_retries: self.detach_retries,
            detach_retry_delay: Duration::from_millis(self.detach_retry_delay_ms),
            read_ahead_sectors: self.read_ahead_sectors,
        }
    }

    /// Returns the external tool binaries to invoke.
    #[must_use]
    pub fn mount_tools(&self) -> MountTools {
        MountTools {
            mkfs: self.mkfs_bin.clone(),
            mount: self.mount_bin.clone(),
            umount: self.umount_bin.clone(),
            blockdev: self.blockdev_bin.clone(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
