//! Error types for lifecycle operations.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::allocator::AllocationError;
use crate::backend::{ClassifyFault, RemoteFault};
use crate::mount::MountError;
use crate::poller::PollError;
use crate::workload::WorkloadError;

/// Errors surfaced by [`super::VolumeLifecycleManager`].
///
/// Variants that follow a compensation attempt carry a `message` with any
/// compensation failure appended, while `source` keeps the root cause.
#[derive(Debug, Error)]
pub enum LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// The create call failed; nothing exists remotely.
    #[error("failed to create volume: {0}")]
    Create(#[source] E),
    /// The new volume never became available. It is left in place for the
    /// operator to reconcile.
    #[error("volume {volume_id} did not become available: {source}")]
    WaitAvailable {
        /// Volume created by this operation.
        volume_id: String,
        /// Poll failure.
        #[source]
        source: PollError<E>,
    },
    /// Device allocation failed and the volume was compensated.
    #[error("device allocation failed: {message}")]
    Allocate {
        /// Volume created by this operation.
        volume_id: String,
        /// Failure with any compensation failure appended.
        message: String,
        /// Allocation failure.
        #[source]
        source: AllocationError<E>,
    },
    /// Enabling delete-on-termination failed and the volume was compensated.
    #[error("failed to enable delete-on-termination for {device}: {message}")]
    DeleteOnTermination {
        /// Volume created by this operation.
        volume_id: String,
        /// Device the volume is attached under.
        device: Utf8PathBuf,
        /// Failure with any compensation failure appended.
        message: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Formatting or mounting failed and the volume was compensated.
    #[error("failed to format and mount volume {volume_id}: {message}")]
    Mount {
        /// Volume created by this operation.
        volume_id: String,
        /// Failure with any compensation failure appended.
        message: String,
        /// Mount failure.
        #[source]
        source: MountError,
    },
    /// The caller cancelled the operation.
    #[error("operation cancelled: {message}")]
    Cancelled {
        /// Where the cancellation was observed, with any compensation
        /// failure appended.
        message: String,
    },
    /// Unmounting failed; the volume was not detached.
    #[error("failed to unmount {mount_point}: {source}")]
    Unmount {
        /// Mount point that could not be unmounted.
        mount_point: Utf8PathBuf,
        /// Mount failure.
        #[source]
        source: MountError,
    },
    /// The detach call failed with a non-retryable error or retries ran out.
    #[error("failed to detach volume {volume_id}: {source}")]
    Detach {
        /// Volume being detached.
        volume_id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The volume did not return to `available` after detaching.
    #[error("volume {volume_id} did not finish detaching: {source}")]
    WaitDetached {
        /// Volume being detached.
        volume_id: String,
        /// Poll failure.
        #[source]
        source: PollError<E>,
    },
    /// The delete call failed; the volume is left for manual cleanup.
    #[error("failed to delete volume {volume_id}: {source}")]
    Delete {
        /// Volume being deleted.
        volume_id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The workload run against a mounted volume failed.
    #[error("workload failed: {message}")]
    Workload {
        /// Failure with any teardown failure appended.
        message: String,
        /// Workload failure.
        #[source]
        source: WorkloadError,
    },
}

impl<E> LifecycleError<E>
where
    E: std::error::Error + ClassifyFault + 'static,
{
    /// Stable machine-readable label for the error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(source)
            | Self::DeleteOnTermination { source, .. }
            | Self::Detach { source, .. }
            | Self::Delete { source, .. } => remote_kind(source),
            Self::WaitAvailable { source, .. } | Self::WaitDetached { source, .. } => {
                source.kind()
            }
            Self::Allocate { source, .. } => source.kind(),
            Self::Mount { source, .. } | Self::Unmount { source, .. } => source.kind(),
            Self::Cancelled { .. } => "cancelled",
            Self::Workload { .. } => "workload",
        }
    }

    /// Volume created or targeted by the failed operation, when known.
    #[must_use]
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            Self::WaitAvailable { volume_id, .. }
            | Self::Allocate { volume_id, .. }
            | Self::DeleteOnTermination { volume_id, .. }
            | Self::Mount { volume_id, .. }
            | Self::Detach { volume_id, .. }
            | Self::WaitDetached { volume_id, .. }
            | Self::Delete { volume_id, .. } => Some(volume_id),
            Self::Create(_) | Self::Cancelled { .. } | Self::Unmount { .. } | Self::Workload { .. } => {
                None
            }
        }
    }
}

fn remote_kind<E: ClassifyFault>(source: &E) -> &'static str {
    match source.fault() {
        RemoteFault::NotFound => "not_found",
        RemoteFault::DeviceInUse
        | RemoteFault::AlreadyDetached
        | RemoteFault::Transient
        | RemoteFault::Other => "remote_api",
    }
}
