//! Unmount, detach and delete.

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ClassifyFault, RemoteFault, VolumeBackend, VolumeState};
use crate::mount::CommandRunner;
use crate::poller::PauseKind;

use super::{LifecycleError, VolumeLifecycleManager};

impl<B, R> VolumeLifecycleManager<B, R>
where
    B: VolumeBackend,
    R: CommandRunner,
{
    /// Unmounts `mount_point` when given, then force-detaches and deletes
    /// the volume.
    ///
    /// An unmount failure aborts the teardown so a busy filesystem is never
    /// detached underneath live I/O. A detach rejected because the volume is
    /// already available counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Unmount`], [`LifecycleError::Detach`],
    /// [`LifecycleError::WaitDetached`], [`LifecycleError::Delete`] or
    /// [`LifecycleError::Cancelled`]. A volume that no longer exists is
    /// reported as a not-found [`LifecycleError::Detach`].
    pub async fn unmount_detach_delete(
        &self,
        volume_id: &str,
        mount_point: Option<&Utf8Path>,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError<B::Error>> {
        if let Some(target) = mount_point {
            self.executor
                .unmount(target)
                .await
                .map_err(|source| LifecycleError::Unmount {
                    mount_point: target.to_path_buf(),
                    source,
                })?;
        }
        self.detach_and_delete(volume_id, cancel).await
    }

    pub(super) async fn detach_and_delete(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError<B::Error>> {
        self.detach(volume_id, cancel).await?;
        self.delete_when_available(volume_id, cancel).await
    }

    pub(super) async fn delete_when_available(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError<B::Error>> {
        self.poller()
            .await_state(volume_id, VolumeState::Available, cancel)
            .await
            .map_err(|source| LifecycleError::WaitDetached {
                volume_id: volume_id.to_owned(),
                source,
            })?;

        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled {
                message: format!("before deleting volume {volume_id}"),
            });
        }

        self.backend
            .delete_volume(volume_id)
            .await
            .map_err(|source| LifecycleError::Delete {
                volume_id: volume_id.to_owned(),
                source,
            })?;
        info!(volume_id, "volume deleted");
        Ok(())
    }

    async fn detach(
        &self,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError<B::Error>> {
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled {
                    message: format!("before detaching volume {volume_id}"),
                });
            }

            let Err(err) = self.backend.detach_volume(volume_id, true).await else {
                info!(volume_id, "detach requested");
                return Ok(());
            };

            match err.fault() {
                RemoteFault::AlreadyDetached => {
                    info!(volume_id, "volume already detached");
                    return Ok(());
                }
                RemoteFault::Transient if retries < self.settings.detach_retries => {
                    retries += 1;
                    warn!(volume_id, retry = retries, error = %err, "transient detach failure; retrying");
                    self.sleeper
                        .pause(PauseKind::DetachRetry, self.settings.detach_retry_delay)
                        .await;
                }
                RemoteFault::DeviceInUse
                | RemoteFault::NotFound
                | RemoteFault::Transient
                | RemoteFault::Other => {
                    return Err(LifecycleError::Detach {
                        volume_id: volume_id.to_owned(),
                        source: err,
                    });
                }
            }
        }
    }
}
