//! Device-slot selection and attachment under contention.
//!
//! Two processes on the same host can both see a slot as free and race to
//! attach to it. The provider's "already in use" rejection is the
//! authoritative signal; the allocator backs off briefly and moves on to the
//! next slot instead of failing.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ClassifyFault, RemoteFault, VolumeBackend, VolumeState};
use crate::metadata::InstanceContext;
use crate::poller::{PauseKind, PollError, PollPolicy, Sleeper, StatusPoller};

/// Slot suffixes reserved for data volumes; `a` to `e` are left to boot and
/// root devices.
pub const DEVICE_SLOTS: [char; 11] = ['f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p'];

/// Default device path prefix.
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/sd";
/// Default upper bound of the randomised backoff after a contended slot.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);
/// Default number of checks for the local device node after attachment.
pub const DEFAULT_DEVICE_WAIT_CHECKS: u32 = 30;
/// Default delay between device node checks.
pub const DEFAULT_DEVICE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Checks whether a device node is present on the local host.
pub trait DeviceProbe: Send + Sync {
    /// Returns `true` when `device` exists.
    fn exists(&self, device: &Utf8Path) -> bool;
}

/// [`DeviceProbe`] backed by the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsProbe;

impl DeviceProbe for FsProbe {
    fn exists(&self, device: &Utf8Path) -> bool {
        device.exists()
    }
}

/// Tuning for slot selection and device visibility waits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocatorPolicy {
    /// Prefix joined with a slot suffix to form the device path.
    pub device_prefix: String,
    /// Exclusive upper bound of the backoff after a contended slot.
    pub max_backoff: Duration,
    /// Number of checks for the device node after attachment.
    pub device_wait_checks: u32,
    /// Delay between device node checks.
    pub device_wait_interval: Duration,
    /// Fixed starting slot index; `None` picks one at random.
    pub start_offset: Option<usize>,
}

impl Default for AllocatorPolicy {
    fn default() -> Self {
        Self {
            device_prefix: DEFAULT_DEVICE_PREFIX.to_owned(),
            max_backoff: DEFAULT_MAX_BACKOFF,
            device_wait_checks: DEFAULT_DEVICE_WAIT_CHECKS,
            device_wait_interval: DEFAULT_DEVICE_WAIT_INTERVAL,
            start_offset: None,
        }
    }
}

impl AllocatorPolicy {
    fn backoff(&self) -> Duration {
        let bound = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }

    fn start(&self) -> usize {
        self.start_offset
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..DEVICE_SLOTS.len()))
    }
}

/// Binding of a volume to a local device path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Device path the volume is attached under.
    pub device: Utf8PathBuf,
    /// Attached volume.
    pub volume_id: String,
}

/// Errors raised while allocating a device slot.
#[derive(Debug, Error)]
pub enum AllocationError<E>
where
    E: std::error::Error + 'static,
{
    /// Every candidate slot was either present locally or contended.
    #[error("no free device slot for volume {volume_id}; contended slots: [{}]", join_paths(.tried))]
    AttachExhausted {
        /// Volume being attached.
        volume_id: String,
        /// Slots rejected by the provider as already in use.
        tried: Vec<Utf8PathBuf>,
    },
    /// The provider reported the attachment but the device node never
    /// appeared.
    #[error("volume {volume_id} attached at {device} but the device node never appeared")]
    DeviceNotVisible {
        /// Volume being attached.
        volume_id: String,
        /// Device path requested.
        device: Utf8PathBuf,
    },
    /// The attach call failed with a non-contention error.
    #[error("failed to attach volume {volume_id} at {device}: {source}")]
    Remote {
        /// Volume being attached.
        volume_id: String,
        /// Device path requested.
        device: Utf8PathBuf,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Waiting for the volume to report `in-use` failed.
    #[error("attach of volume {volume_id} at {device} not confirmed: {source}")]
    Poll {
        /// Volume being attached.
        volume_id: String,
        /// Device path requested.
        device: Utf8PathBuf,
        /// Poll failure.
        #[source]
        source: PollError<E>,
    },
    /// The caller cancelled before an attach call was issued.
    #[error("cancelled before attaching volume {volume_id}")]
    Cancelled {
        /// Volume being attached.
        volume_id: String,
    },
}

impl<E> AllocationError<E>
where
    E: std::error::Error + 'static,
{
    /// Device path the provider accepted, when the failure happened after
    /// the attach call succeeded.
    #[must_use]
    pub fn attached_device(&self) -> Option<&Utf8Path> {
        match self {
            Self::DeviceNotVisible { device, .. } | Self::Poll { device, .. } => Some(device),
            Self::AttachExhausted { .. } | Self::Remote { .. } | Self::Cancelled { .. } => None,
        }
    }

    /// Stable label for the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AttachExhausted { .. } => "attach_exhausted",
            Self::DeviceNotVisible { .. } => "device_not_visible",
            Self::Remote { .. } => "remote_api",
            Self::Poll { source, .. } => source.kind(),
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(Utf8PathBuf::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Chooses a device slot for a volume and attaches it.
pub struct DeviceAllocator<'a, B> {
    backend: &'a B,
    probe: &'a dyn DeviceProbe,
    sleeper: &'a dyn Sleeper,
    policy: &'a AllocatorPolicy,
    poll: PollPolicy,
}

impl<'a, B> DeviceAllocator<'a, B>
where
    B: VolumeBackend,
{
    /// Creates an allocator borrowing its collaborators.
    #[must_use]
    pub const fn new(
        backend: &'a B,
        probe: &'a dyn DeviceProbe,
        sleeper: &'a dyn Sleeper,
        policy: &'a AllocatorPolicy,
        poll: PollPolicy,
    ) -> Self {
        Self {
            backend,
            probe,
            sleeper,
            policy,
            poll,
        }
    }

    /// Attaches `volume_id` to the first free slot, starting at a random
    /// offset and visiting each slot at most once.
    ///
    /// Cancellation is only observed before a new attach call. Once the
    /// provider has accepted an attachment the wait runs to completion so
    /// the caller always learns the device path.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::AttachExhausted`] when no slot could be
    /// used, [`AllocationError::Remote`] for non-contention attach errors,
    /// [`AllocationError::Poll`] or [`AllocationError::DeviceNotVisible`]
    /// when the attachment is not confirmed, and
    /// [`AllocationError::Cancelled`] when the token fires first.
    pub async fn allocate(
        &self,
        context: &InstanceContext,
        volume_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Attachment, AllocationError<B::Error>> {
        let start = self.policy.start();
        let mut tried = Vec::new();

        for suffix in DEVICE_SLOTS
            .iter()
            .cycle()
            .skip(start)
            .take(DEVICE_SLOTS.len())
        {
            let device = Utf8PathBuf::from(format!("{}{suffix}", self.policy.device_prefix));
            if self.probe.exists(&device) {
                debug!(%device, "device node already present; skipping slot");
                continue;
            }
            if cancel.is_cancelled() {
                return Err(AllocationError::Cancelled {
                    volume_id: volume_id.to_owned(),
                });
            }

            match self
                .backend
                .attach_volume(&context.instance_id, volume_id, &device)
                .await
            {
                Ok(()) => {
                    info!(volume_id, %device, "attach accepted");
                    return self.confirm(volume_id, device).await;
                }
                Err(err) if err.fault() == RemoteFault::DeviceInUse => {
                    let backoff = self.policy.backoff();
                    warn!(
                        volume_id,
                        %device,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "device slot contended; trying next slot"
                    );
                    tried.push(device);
                    self.sleeper.pause(PauseKind::AttachBackoff, backoff).await;
                }
                Err(source) => {
                    return Err(AllocationError::Remote {
                        volume_id: volume_id.to_owned(),
                        device,
                        source,
                    });
                }
            }
        }

        Err(AllocationError::AttachExhausted {
            volume_id: volume_id.to_owned(),
            tried,
        })
    }

    async fn confirm(
        &self,
        volume_id: &str,
        device: Utf8PathBuf,
    ) -> Result<Attachment, AllocationError<B::Error>> {
        let settle = CancellationToken::new();
        let poller = StatusPoller::new(self.backend, self.sleeper, self.poll);
        if let Err(source) = poller
            .await_state(volume_id, VolumeState::InUse, &settle)
            .await
        {
            return Err(AllocationError::Poll {
                volume_id: volume_id.to_owned(),
                device,
                source,
            });
        }

        let checks = self.policy.device_wait_checks.max(1);
        for check in 1..=checks {
            if self.probe.exists(&device) {
                debug!(volume_id, %device, check, "device node visible");
                return Ok(Attachment {
                    device,
                    volume_id: volume_id.to_owned(),
                });
            }
            if check < checks {
                self.sleeper
                    .pause(PauseKind::DeviceWait, self.policy.device_wait_interval)
                    .await;
            }
        }

        Err(AllocationError::DeviceNotVisible {
            volume_id: volume_id.to_owned(),
            device,
        })
    }
}
