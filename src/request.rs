//! Volume requests accepted by the CLI and the service, and their validation.
//!
//! Front doors deserialise or parse loosely typed [`MountRequest`] and
//! [`UnmountRequest`] values and validate them into [`VolumeSpec`] and
//! [`UnmountTarget`]. Validation collects every problem so callers can report
//! them together.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default volume size in GiB.
pub const DEFAULT_SIZE_GB: i64 = 200;

/// Largest volume size EBS accepts, in GiB.
pub const MAX_SIZE_GB: u32 = 16_384;

/// Lowest provisioned IOPS value accepted.
pub const MIN_IOPS: u32 = 100;

/// Highest provisioned IOPS value accepted.
pub const MAX_IOPS: u32 = 20_000;

/// Ceiling on provisioned IOPS per GiB of volume size.
pub const MAX_IOPS_PER_GB: u32 = 50;

/// IOPS per GiB used when deriving a provisioned IOPS value.
pub const DERIVED_IOPS_PER_GB: u32 = 45;

/// Smallest provisioned IOPS volume, in GiB. Below it the derived and
/// clamped IOPS values would fall under [`MIN_IOPS`].
pub const MIN_IO1_SIZE_GB: u32 = 4;

/// EBS volume classes supported by the tool.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum VolumeClass {
    /// General purpose SSD (`gp2`).
    #[default]
    #[serde(rename = "gp2")]
    GeneralPurpose,
    /// Provisioned IOPS SSD (`io1`).
    #[serde(rename = "io1")]
    ProvisionedIops,
    /// Throughput optimised HDD (`st1`).
    #[serde(rename = "st1")]
    ThroughputOptimized,
    /// Cold HDD (`sc1`).
    #[serde(rename = "sc1")]
    Cold,
    /// Previous generation magnetic (`standard`).
    #[serde(rename = "standard")]
    Standard,
}

impl VolumeClass {
    /// All classes in the order they are presented to users.
    pub const ALL: [Self; 5] = [
        Self::GeneralPurpose,
        Self::ProvisionedIops,
        Self::ThroughputOptimized,
        Self::Cold,
        Self::Standard,
    ];

    /// Provider name for the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GeneralPurpose => "gp2",
            Self::ProvisionedIops => "io1",
            Self::ThroughputOptimized => "st1",
            Self::Cold => "sc1",
            Self::Standard => "standard",
        }
    }

    /// Returns `true` for the HDD classes that benefit from a larger
    /// read-ahead window.
    #[must_use]
    pub const fn is_throughput_oriented(self) -> bool {
        matches!(self, Self::ThroughputOptimized | Self::Cold)
    }
}

impl fmt::Display for VolumeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeClass {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == value.trim())
            .ok_or_else(|| UnknownVariant::new("volume_type", value, &Self::ALL.map(Self::as_str)))
    }
}

/// Filesystems the tool will create on a new volume.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    /// ext4.
    #[default]
    Ext4,
    /// ext3.
    Ext3,
    /// ext2.
    Ext2,
}

impl FilesystemType {
    /// All supported filesystems.
    pub const ALL: [Self; 3] = [Self::Ext4, Self::Ext3, Self::Ext2];

    /// Name passed to `mkfs -t` and `mount -t`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Ext3 => "ext3",
            Self::Ext2 => "ext2",
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|fs| fs.as_str() == value.trim())
            .ok_or_else(|| UnknownVariant::new("fs_type", value, &Self::ALL.map(Self::as_str)))
    }
}

/// Raised when a string does not name a supported enum variant.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid {field} '{value}'; must be one of [ {expected} ]")]
pub struct UnknownVariant {
    field: &'static str,
    value: String,
    expected: String,
}

impl UnknownVariant {
    fn new(field: &'static str, value: &str, expected: &[&str]) -> Self {
        Self {
            field,
            value: value.to_owned(),
            expected: expected.join(", "),
        }
    }
}

/// Raised when a request fails validation. Every problem found is listed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("request validation failed: {}", .problems.join("; "))]
pub struct ValidationError {
    /// Human readable descriptions of each problem.
    pub problems: Vec<String>,
}

impl ValidationError {
    fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }
}

/// Loosely typed mount request as received from the CLI or the service.
///
/// Missing JSON fields take the same defaults as the CLI flags.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountRequest {
    /// Requested size in GiB.
    pub size: i64,
    /// Absolute directory on which to mount the volume.
    pub mount_point: String,
    /// Volume class name (`gp2`, `io1`, `st1`, `sc1`, `standard`).
    pub volume_type: String,
    /// Filesystem name (`ext4`, `ext3`, `ext2`).
    pub fs_type: String,
    /// Provisioned IOPS; zero or absent means "derive from size".
    pub iops: Option<i64>,
    /// Keep the volume when the instance terminates.
    pub keep: bool,
}

impl Default for MountRequest {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE_GB,
            mount_point: String::new(),
            volume_type: VolumeClass::default().as_str().to_owned(),
            fs_type: FilesystemType::default().as_str().to_owned(),
            iops: None,
            keep: false,
        }
    }
}

impl MountRequest {
    /// Validates the request and converts it into a [`VolumeSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] listing every invalid field.
    pub fn validate(&self) -> Result<VolumeSpec, ValidationError> {
        let mut problems = Vec::new();

        let size_gb = match u32::try_from(self.size) {
            Ok(size) if size > 0 && size <= MAX_SIZE_GB => Some(size),
            _ => {
                problems.push(format!(
                    "invalid size {}; must be a positive integer no greater than {MAX_SIZE_GB}",
                    self.size
                ));
                None
            }
        };

        let mount_point = validate_mount_point(&self.mount_point, true, &mut problems);

        let class = match self.volume_type.parse::<VolumeClass>() {
            Ok(class) => Some(class),
            Err(err) => {
                problems.push(err.to_string());
                None
            }
        };

        let filesystem = match self.fs_type.parse::<FilesystemType>() {
            Ok(fs) => Some(fs),
            Err(err) => {
                problems.push(err.to_string());
                None
            }
        };

        let iops = match self.iops {
            None | Some(0) => None,
            Some(value) => match u32::try_from(value) {
                Ok(iops) if (MIN_IOPS..=MAX_IOPS).contains(&iops) => Some(iops),
                _ => {
                    problems.push(format!(
                        "invalid iops {value}; range is {MIN_IOPS} to {MAX_IOPS} and <= {MAX_IOPS_PER_GB}*size of volume"
                    ));
                    None
                }
            },
        };

        if class == Some(VolumeClass::ProvisionedIops)
            && size_gb.is_some_and(|size| size < MIN_IO1_SIZE_GB)
        {
            problems.push(format!(
                "invalid size {} for io1; provisioned IOPS volumes need at least {MIN_IO1_SIZE_GB} GiB",
                self.size
            ));
        }

        match (size_gb, mount_point, class, filesystem) {
            (Some(size_gb), Some(mount_point), Some(class), Some(filesystem))
                if problems.is_empty() =>
            {
                Ok(VolumeSpec {
                    size_gb,
                    class,
                    iops,
                    filesystem,
                    keep: self.keep,
                    mount_point,
                })
            }
            _ => Err(ValidationError::new(problems)),
        }
    }
}

/// Validated parameters for one create-and-mount operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Size in GiB.
    pub size_gb: u32,
    /// Volume class.
    pub class: VolumeClass,
    /// Requested IOPS; only honoured for [`VolumeClass::ProvisionedIops`].
    pub iops: Option<u32>,
    /// Filesystem to create.
    pub filesystem: FilesystemType,
    /// Skip configuring delete-on-termination when set.
    pub keep: bool,
    /// Absolute mount point.
    pub mount_point: Utf8PathBuf,
}

impl VolumeSpec {
    /// Returns the IOPS value to send with the create call.
    ///
    /// Only provisioned IOPS volumes carry a value. An absent request derives
    /// `min(45 * size, 20000)`; a request above `50 * size` is replaced by the
    /// derived value rather than rejected.
    #[must_use]
    pub fn normalized_iops(&self) -> Option<u32> {
        if self.class != VolumeClass::ProvisionedIops {
            return None;
        }
        let ceiling = u64::from(self.size_gb) * u64::from(MAX_IOPS_PER_GB);
        match self.iops {
            Some(requested) if u64::from(requested) <= ceiling => Some(requested),
            _ => Some(derived_iops(self.size_gb)),
        }
    }
}

/// Computes `min(45 * size_gb, 20000)`.
#[must_use]
pub fn derived_iops(size_gb: u32) -> u32 {
    let derived = (u64::from(size_gb) * u64::from(DERIVED_IOPS_PER_GB)).min(u64::from(MAX_IOPS));
    u32::try_from(derived).unwrap_or(MAX_IOPS)
}

/// Loosely typed unmount request as received from the CLI or the service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct UnmountRequest {
    /// Identifier of the volume to tear down.
    pub volume_id: String,
    /// Directory to unmount before detaching, if any.
    pub mount_point: Option<String>,
}

impl UnmountRequest {
    /// Validates the request and converts it into an [`UnmountTarget`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the volume id is missing or the mount
    /// point is not absolute.
    pub fn validate(&self) -> Result<UnmountTarget, ValidationError> {
        let mut problems = Vec::new();
        let volume_id = self.volume_id.trim();
        if volume_id.is_empty() {
            problems.push(String::from("volume_id is required"));
        }

        let mount_point = match self.mount_point.as_deref() {
            Some(raw) if !raw.trim().is_empty() => validate_mount_point(raw, false, &mut problems),
            _ => None,
        };

        if problems.is_empty() {
            Ok(UnmountTarget {
                volume_id: volume_id.to_owned(),
                mount_point,
            })
        } else {
            Err(ValidationError::new(problems))
        }
    }
}

/// Validated parameters for one unmount-detach-delete operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnmountTarget {
    /// Volume to tear down.
    pub volume_id: String,
    /// Directory to unmount first, if any.
    pub mount_point: Option<Utf8PathBuf>,
}

fn validate_mount_point(
    raw: &str,
    required: bool,
    problems: &mut Vec<String>,
) -> Option<Utf8PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        if required {
            problems.push(String::from("mount_point is required"));
        }
        return None;
    }
    let path = Utf8PathBuf::from(trimmed);
    if path.is_absolute() {
        Some(path)
    } else {
        problems.push(format!(
            "invalid mount_point '{trimmed}'; must be an absolute path"
        ));
        None
    }
}
