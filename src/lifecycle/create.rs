//! Create, attach and mount.

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::AllocationError;
use crate::backend::{CreateVolumeRequest, Tag, VolumeBackend, VolumeState};
use crate::mount::CommandRunner;
use crate::poller::PollError;
use crate::request::{VolumeClass, VolumeSpec};

use super::{LifecycleError, MountResult, VolumeLifecycleManager, append_teardown_note};

/// Tag key carrying the owning instance id.
pub const INSTANCE_TAG_KEY: &str = "ebsmount:instance";

impl<B, R> VolumeLifecycleManager<B, R>
where
    B: VolumeBackend,
    R: CommandRunner,
{
    /// Creates a volume, attaches it to a free slot, formats and mounts it.
    ///
    /// Once the volume exists, a failed or cancelled step triggers one
    /// compensating detach and delete before the error is returned. Any
    /// allocation failure detaches, since the provider may have applied an
    /// attach whose response was lost. The one
    /// exception is a wait for `available` that times out or fails: the
    /// volume is left in place and its id is reported in the error.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] describing the first failing step, with
    /// any compensation failure appended to its message.
    pub async fn create_and_mount(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> Result<MountResult, LifecycleError<B::Error>> {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled {
                message: String::from("before creating volume"),
            });
        }

        let request = self.create_request(spec);
        let volume = self
            .backend
            .create_volume(&request)
            .await
            .map_err(LifecycleError::Create)?;
        let volume_id = volume.id;
        info!(
            %volume_id,
            size_gb = spec.size_gb,
            class = %spec.class,
            zone = %request.availability_zone,
            "volume created"
        );

        if let Err(err) = self
            .poller()
            .await_state(&volume_id, VolumeState::Available, cancel)
            .await
        {
            return Err(match err {
                PollError::Cancelled { .. } => LifecycleError::Cancelled {
                    message: self.compensate_with_note(&volume_id, false, err.to_string()).await,
                },
                other => LifecycleError::WaitAvailable {
                    volume_id,
                    source: other,
                },
            });
        }

        let attachment = match self
            .allocator()
            .allocate(&self.context, &volume_id, cancel)
            .await
        {
            Ok(attachment) => attachment,
            Err(err) => {
                // A lost attach response may still have attached the volume.
                // Detaching an available volume counts as success.
                if let Some(device) = err.attached_device() {
                    warn!(%volume_id, %device, "attachment not confirmed; compensating");
                }
                let message = self
                    .compensate_with_note(&volume_id, true, err.to_string())
                    .await;
                return Err(if matches!(err, AllocationError::Cancelled { .. }) {
                    LifecycleError::Cancelled { message }
                } else {
                    LifecycleError::Allocate {
                        volume_id,
                        message,
                        source: err,
                    }
                });
            }
        };
        let device = attachment.device;

        if spec.keep {
            info!(%volume_id, "keep requested; delete-on-termination not set");
        } else {
            self.check_cancel_attached(&volume_id, &device, cancel).await?;
            if let Err(err) = self
                .backend
                .set_delete_on_termination(&self.context.instance_id, &device)
                .await
            {
                let message = self
                    .compensate_with_note(&volume_id, true, err.to_string())
                    .await;
                return Err(LifecycleError::DeleteOnTermination {
                    volume_id,
                    device,
                    message,
                    source: err,
                });
            }
        }

        self.check_cancel_attached(&volume_id, &device, cancel).await?;
        if let Err(err) = self
            .executor
            .format_and_mount(&device, spec.filesystem, &spec.mount_point)
            .await
        {
            let message = self
                .compensate_with_note(&volume_id, true, err.to_string())
                .await;
            return Err(LifecycleError::Mount {
                volume_id,
                message,
                source: err,
            });
        }

        if spec.class.is_throughput_oriented() {
            let sectors = self.settings.read_ahead_sectors;
            if let Err(err) = self.executor.set_read_ahead(&device, sectors).await {
                warn!(%device, sectors, error = %err, "failed to set read-ahead");
            }
        }

        info!(%volume_id, %device, mount_point = %spec.mount_point, "volume mounted");
        Ok(MountResult {
            device,
            volume_id,
            mount_point: spec.mount_point.clone(),
        })
    }

    fn create_request(&self, spec: &VolumeSpec) -> CreateVolumeRequest {
        let iops = spec.normalized_iops();
        match (spec.class, spec.iops) {
            (VolumeClass::ProvisionedIops, Some(requested)) if iops != Some(requested) => {
                warn!(
                    requested,
                    applied = iops,
                    size_gb = spec.size_gb,
                    "requested iops exceed 50 per GiB; using derived value"
                );
            }
            (class, Some(requested)) if class != VolumeClass::ProvisionedIops => {
                warn!(requested, %class, "iops only apply to io1 volumes; ignoring");
            }
            _ => {}
        }

        let instance_id = &self.context.instance_id;
        CreateVolumeRequest {
            availability_zone: self.context.availability_zone.clone(),
            size_gb: spec.size_gb,
            class: spec.class,
            iops,
            tags: vec![
                Tag::new("Name", format!("ebsmount-{instance_id}")),
                Tag::new(INSTANCE_TAG_KEY, instance_id.clone()),
            ],
            client_token: Uuid::new_v4().to_string(),
        }
    }

    async fn check_cancel_attached(
        &self,
        volume_id: &str,
        device: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError<B::Error>> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        let note = format!("after attaching volume {volume_id} at {device}");
        Err(LifecycleError::Cancelled {
            message: self.compensate_with_note(volume_id, true, note).await,
        })
    }

    async fn compensate_with_note(
        &self,
        volume_id: &str,
        attached: bool,
        message: String,
    ) -> String {
        let settle = CancellationToken::new();
        let outcome = if attached {
            self.detach_and_delete(volume_id, &settle).await
        } else {
            self.delete_when_available(volume_id, &settle).await
        };
        let failure = match outcome {
            Ok(()) => {
                info!(volume_id, "compensation removed volume");
                None
            }
            Err(teardown) => {
                warn!(volume_id, error = %teardown, "compensation failed; volume may be orphaned");
                Some(teardown)
            }
        };
        append_teardown_note(message, failure.as_ref())
    }
}
