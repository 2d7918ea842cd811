//! Run a workload against a volume that is always torn down afterwards.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::VolumeBackend;
use crate::mount::CommandRunner;
use crate::request::VolumeSpec;
use crate::workload::WorkloadError;

use super::{LifecycleError, MountResult, VolumeLifecycleManager, append_teardown_note};

impl<B, R> VolumeLifecycleManager<B, R>
where
    B: VolumeBackend,
    R: CommandRunner,
{
    /// Creates and mounts a volume, runs `workload` against it, then
    /// unmounts, detaches and deletes the volume.
    ///
    /// Teardown is attempted whether the workload succeeds, fails or is
    /// cancelled, and runs with its own cancellation token. The `keep` flag
    /// only affects delete-on-termination; the volume is still removed.
    ///
    /// # Errors
    ///
    /// Returns the create-and-mount error unchanged, a
    /// [`LifecycleError::Workload`] with any teardown failure appended to its
    /// message, or the teardown error when only teardown failed.
    pub async fn with_mounted_volume<F, Fut, T>(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
        workload: F,
    ) -> Result<T, LifecycleError<B::Error>>
    where
        F: FnOnce(MountResult) -> Fut,
        Fut: Future<Output = Result<T, WorkloadError>>,
    {
        let mounted = self.create_and_mount(spec, cancel).await?;
        let volume_id = mounted.volume_id.clone();
        let mount_point = mounted.mount_point.clone();

        let outcome = workload(mounted).await;

        let settle = CancellationToken::new();
        let teardown = self
            .unmount_detach_delete(&volume_id, Some(&mount_point), &settle)
            .await;
        match &teardown {
            Ok(()) => info!(%volume_id, "scoped volume torn down"),
            Err(err) => warn!(%volume_id, error = %err, "scoped volume teardown failed"),
        }

        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(source), cleanup) => Err(LifecycleError::Workload {
                message: append_teardown_note(source.to_string(), cleanup.err().as_ref()),
                source,
            }),
        }
    }
}
