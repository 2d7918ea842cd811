//! Bounded, jittered and cancellable polling of remote volume state.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ClassifyFault, RemoteFault, Volume, VolumeBackend, VolumeState};

/// Future returned by [`Sleeper::pause`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Reason a lifecycle operation is pausing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PauseKind {
    /// Delay between two describe calls.
    Poll,
    /// Randomised backoff after a contended device slot.
    AttachBackoff,
    /// Delay between checks for the local device node.
    DeviceWait,
    /// Delay between transient detach retries.
    DetachRetry,
}

/// Abstraction over timer sleeps so tests can observe delays without waiting.
pub trait Sleeper: Send + Sync {
    /// Suspends the caller for `duration`.
    fn pause(&self, kind: PauseKind, duration: Duration) -> SleepFuture<'_>;
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn pause(&self, _kind: PauseKind, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Default number of describe attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
/// Default base delay between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default jitter applied around the base delay.
pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(1);

/// Bounds and pacing for a state wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Maximum number of describe calls.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub interval: Duration,
    /// Maximum deviation from the base delay in either direction.
    pub jitter: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_POLL_JITTER,
        }
    }
}

impl PollPolicy {
    /// Returns a delay drawn uniformly from `interval ± jitter`, floored at
    /// zero.
    #[must_use]
    pub fn jittered(&self) -> Duration {
        let jitter_ms = millis(self.jitter);
        if jitter_ms == 0 {
            return self.interval;
        }
        let base_ms = millis(self.interval);
        let offset = rand::thread_rng().gen_range(0..=jitter_ms.saturating_mul(2));
        Duration::from_millis(base_ms.saturating_add(offset).saturating_sub(jitter_ms))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Errors raised while waiting for a volume state.
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempts were exhausted before the target state was observed.
    #[error(
        "timed out waiting for volume {volume_id} to become {target} after {attempts} attempts (last state: {})",
        .last_state.map_or("unknown", VolumeState::as_str)
    )]
    Timeout {
        /// Volume being waited on.
        volume_id: String,
        /// State the caller wanted.
        target: VolumeState,
        /// Last state reported by the provider, if any describe succeeded.
        last_state: Option<VolumeState>,
        /// Number of describe calls made.
        attempts: u32,
    },
    /// The provider no longer knows the volume.
    #[error("volume {volume_id} not found")]
    NotFound {
        /// Volume being waited on.
        volume_id: String,
    },
    /// The volume entered a state from which the target is unreachable.
    #[error("volume {volume_id} entered state {state} while waiting for {target}")]
    Failed {
        /// Volume being waited on.
        volume_id: String,
        /// State the caller wanted.
        target: VolumeState,
        /// State that ended the wait.
        state: VolumeState,
    },
    /// A describe call failed with a non-retryable error.
    #[error("failed to describe volume {volume_id}: {source}")]
    Remote {
        /// Volume being waited on.
        volume_id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The caller cancelled the wait.
    #[error("cancelled while waiting for volume {volume_id}")]
    Cancelled {
        /// Volume being waited on.
        volume_id: String,
    },
}

impl<E> PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Stable label for the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::Failed { .. } => "volume_failed",
            Self::Remote { .. } => "remote_api",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Waits for volumes to reach a target state.
pub struct StatusPoller<'a, B> {
    backend: &'a B,
    sleeper: &'a dyn Sleeper,
    policy: PollPolicy,
}

impl<'a, B> StatusPoller<'a, B>
where
    B: VolumeBackend,
{
    /// Creates a poller borrowing the backend and sleeper.
    #[must_use]
    pub const fn new(backend: &'a B, sleeper: &'a dyn Sleeper, policy: PollPolicy) -> Self {
        Self {
            backend,
            sleeper,
            policy,
        }
    }

    /// Describes `volume_id` until it reports `target`.
    ///
    /// The token is checked before every describe call and raced against
    /// every sleep. Transient describe failures consume an attempt and are
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::NotFound`] when the volume disappears,
    /// [`PollError::Timeout`] when attempts run out, [`PollError::Failed`]
    /// when the volume reaches a failed state, [`PollError::Remote`] for
    /// other provider errors, and [`PollError::Cancelled`] when the token
    /// fires.
    pub async fn await_state(
        &self,
        volume_id: &str,
        target: VolumeState,
        cancel: &CancellationToken,
    ) -> Result<Volume, PollError<B::Error>> {
        let mut last_state = None;
        let mut attempts = 0;

        while attempts < self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    volume_id: volume_id.to_owned(),
                });
            }

            attempts += 1;
            match self.backend.describe_volume(volume_id).await {
                Ok(volume) if volume.state == target => return Ok(volume),
                Ok(volume) => {
                    if volume.state.is_terminal_failure() && target != VolumeState::Deleted {
                        return Err(PollError::Failed {
                            volume_id: volume_id.to_owned(),
                            target,
                            state: volume.state,
                        });
                    }
                    debug!(
                        volume_id,
                        state = %volume.state,
                        %target,
                        attempt = attempts,
                        "volume not yet in target state"
                    );
                    last_state = Some(volume.state);
                }
                Err(err) => match err.fault() {
                    RemoteFault::NotFound => {
                        return Err(PollError::NotFound {
                            volume_id: volume_id.to_owned(),
                        });
                    }
                    RemoteFault::Transient => {
                        warn!(volume_id, attempt = attempts, error = %err, "transient describe failure");
                    }
                    RemoteFault::DeviceInUse | RemoteFault::AlreadyDetached | RemoteFault::Other => {
                        return Err(PollError::Remote {
                            volume_id: volume_id.to_owned(),
                            source: err,
                        });
                    }
                },
            }

            if attempts < self.policy.max_attempts {
                let delay = self.policy.jittered();
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(PollError::Cancelled {
                            volume_id: volume_id.to_owned(),
                        });
                    }
                    () = self.sleeper.pause(PauseKind::Poll, delay) => {}
                }
            }
        }

        Err(PollError::Timeout {
            volume_id: volume_id.to_owned(),
            target,
            last_state,
            attempts,
        })
    }
}
