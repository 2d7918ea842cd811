//! Backend abstraction over the block-storage provider's volume API.
//!
//! The lifecycle manager only talks to the provider through
//! [`VolumeBackend`], which lets tests substitute a scripted cloud and keeps
//! the EC2 wire details inside [`crate::ec2`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use serde::Serialize;

use crate::request::VolumeClass;

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Provider-reported volume state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    /// The volume is being provisioned.
    Creating,
    /// The volume exists and is not attached.
    Available,
    /// The volume is attached to an instance.
    InUse,
    /// The volume is being removed.
    Deleting,
    /// The volume has been removed.
    Deleted,
    /// The provider failed the volume.
    Error,
}

impl VolumeState {
    /// Provider spelling of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }

    /// Parses the provider spelling, returning `None` for unknown states.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creating" => Some(Self::Creating),
            "available" => Some(Self::Available),
            "in-use" => Some(Self::InUse),
            "deleting" => Some(Self::Deleting),
            "deleted" => Some(Self::Deleted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns `true` when no further transition can reach a usable state.
    #[must_use]
    pub const fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Error | Self::Deleting | Self::Deleted)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a volume as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider-assigned identifier (for example `vol-0abc`).
    pub id: String,
    /// Current state.
    pub state: VolumeState,
    /// Availability zone hosting the volume.
    pub availability_zone: String,
    /// Volume class.
    pub class: VolumeClass,
    /// Size in GiB.
    pub size_gb: u32,
    /// Provisioned IOPS when reported.
    pub iops: Option<u32>,
}

/// Key/value tag applied to a new volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Parameters for a create-volume call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Zone in which to create the volume; must match the instance's zone.
    pub availability_zone: String,
    /// Size in GiB.
    pub size_gb: u32,
    /// Volume class.
    pub class: VolumeClass,
    /// Provisioned IOPS, sent only for provisioned-IOPS volumes.
    pub iops: Option<u32>,
    /// Tags applied at creation time.
    pub tags: Vec<Tag>,
    /// Idempotency token so a retried create cannot produce two volumes.
    pub client_token: String,
}

/// Coarse classification of a provider failure that callers branch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteFault {
    /// The requested device name is already taken on the instance.
    DeviceInUse,
    /// A detach was requested for a volume that is already detached.
    AlreadyDetached,
    /// The volume does not exist.
    NotFound,
    /// Throttling, network, or server-side failure worth retrying.
    Transient,
    /// Anything else.
    Other,
}

/// Lets generic callers classify backend errors without knowing the
/// provider's error codes.
pub trait ClassifyFault {
    /// Returns the coarse classification for this error.
    fn fault(&self) -> RemoteFault;
}

/// Volume operations required by the lifecycle manager.
///
/// Every method issues a single provider call; waiting and retrying live in
/// [`crate::poller`], [`crate::allocator`], and [`crate::lifecycle`].
pub trait VolumeBackend: Send + Sync {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + ClassifyFault + Send + Sync + 'static;

    /// Creates a volume and returns its initial description.
    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, Volume, Self::Error>;

    /// Describes a single volume.
    fn describe_volume<'a>(&'a self, volume_id: &'a str)
    -> BackendFuture<'a, Volume, Self::Error>;

    /// Requests attachment of a volume to an instance under a device name.
    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Marks the volume attached at `device` for deletion when the instance
    /// terminates.
    fn set_delete_on_termination<'a>(
        &'a self,
        instance_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Requests detachment of a volume, optionally forcing it.
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        force: bool,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("creating", VolumeState::Creating)]
    #[case("available", VolumeState::Available)]
    #[case("in-use", VolumeState::InUse)]
    #[case("deleting", VolumeState::Deleting)]
    #[case("deleted", VolumeState::Deleted)]
    #[case("error", VolumeState::Error)]
    fn volume_state_parses_provider_spelling(#[case] raw: &str, #[case] expected: VolumeState) {
        assert_eq!(VolumeState::parse(raw), Some(expected));
        assert_eq!(expected.as_str(), raw);
    }

    #[test]
    fn unknown_volume_state_is_rejected() {
        assert_eq!(VolumeState::parse("optimizing"), None);
    }
}
