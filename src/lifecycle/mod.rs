//! Volume lifecycle orchestration.
//!
//! [`VolumeLifecycleManager`] sequences create, attach, delete-on-termination
//! and mount, and the inverse unmount, detach and delete. When a step fails
//! after the volume exists, the manager compensates by removing the volume
//! before returning the original error. Compensation always runs with its
//! own cancellation token so a cancelled caller cannot strand a paid
//! resource.

mod create;
mod error;
mod scoped;
mod teardown;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::allocator::{AllocatorPolicy, DeviceAllocator, DeviceProbe};
use crate::backend::VolumeBackend;
use crate::metadata::InstanceContext;
use crate::mount::{CommandRunner, DEFAULT_READ_AHEAD_SECTORS, LocalMountExecutor};
use crate::poller::{PollPolicy, Sleeper, StatusPoller, TokioSleeper};

pub use error::LifecycleError;

/// Default number of retries for transient detach failures.
pub const DEFAULT_DETACH_RETRIES: u32 = 10;
/// Default delay between detach retries.
pub const DEFAULT_DETACH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a successful create-and-mount.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MountResult {
    /// Device path the volume is attached under.
    pub device: Utf8PathBuf,
    /// Volume identifier; the caller's handle for later teardown.
    pub volume_id: String,
    /// Directory the volume is mounted on.
    pub mount_point: Utf8PathBuf,
}

/// Retry and pacing settings for lifecycle operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Bounds for every state wait.
    pub poll: PollPolicy,
    /// Slot selection and device visibility tuning.
    pub allocator: AllocatorPolicy,
    /// Retries for transient detach failures.
    pub detach_retries: u32,
    /// Delay between detach retries.
    pub detach_retry_delay: Duration,
    /// Read-ahead applied to throughput-oriented volumes.
    pub read_ahead_sectors: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            allocator: AllocatorPolicy::default(),
            detach_retries: DEFAULT_DETACH_RETRIES,
            detach_retry_delay: DEFAULT_DETACH_RETRY_DELAY,
            read_ahead_sectors: DEFAULT_READ_AHEAD_SECTORS,
        }
    }
}

/// Creates, mounts and tears down volumes for one instance.
///
/// The manager holds no per-operation state, so a shared reference can
/// serve any number of concurrent operations.
pub struct VolumeLifecycleManager<B, R> {
    backend: B,
    executor: LocalMountExecutor<R>,
    context: Arc<InstanceContext>,
    probe: Arc<dyn DeviceProbe>,
    sleeper: Arc<dyn Sleeper>,
    settings: LifecycleSettings,
}

impl<B, R> VolumeLifecycleManager<B, R>
where
    B: VolumeBackend,
    R: CommandRunner,
{
    /// Creates a manager that sleeps on the tokio timer.
    #[must_use]
    pub fn new(
        backend: B,
        executor: LocalMountExecutor<R>,
        context: Arc<InstanceContext>,
        probe: Arc<dyn DeviceProbe>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            executor,
            context,
            probe,
            sleeper: Arc::new(TokioSleeper),
            settings,
        }
    }

    /// Replaces the sleeper.
    ///
    /// This is primarily used by tests to observe delays without waiting.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the instance context shared by every operation.
    #[must_use]
    pub fn context(&self) -> &InstanceContext {
        &self.context
    }

    /// Returns the settings in use.
    #[must_use]
    pub const fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn poller(&self) -> StatusPoller<'_, B> {
        StatusPoller::new(&self.backend, self.sleeper.as_ref(), self.settings.poll)
    }

    fn allocator(&self) -> DeviceAllocator<'_, B> {
        DeviceAllocator::new(
            &self.backend,
            self.probe.as_ref(),
            self.sleeper.as_ref(),
            &self.settings.allocator,
            self.settings.poll,
        )
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}
