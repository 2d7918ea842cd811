//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedCloud`] is an in-memory volume provider whose failures can be
//! scripted, [`ScriptedRunner`] records tool invocations, and
//! [`RecordingSleeper`] records pauses without waiting.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::allocator::{AllocatorPolicy, DeviceProbe};
use crate::backend::{
    BackendFuture, ClassifyFault, CreateVolumeRequest, RemoteFault, Volume, VolumeBackend,
    VolumeState,
};
use crate::lifecycle::{LifecycleSettings, VolumeLifecycleManager};
use crate::metadata::InstanceContext;
use crate::mount::{CommandFuture, CommandOutput, CommandRunner, LocalMountExecutor, MountTools};
use crate::poller::{PauseKind, PollPolicy, Sleeper, SleepFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the context used by scripted tests.
#[must_use]
pub fn fixed_context() -> InstanceContext {
    InstanceContext::new("i-0123456789abcdef0", "us-east-1", "us-east-1a")
}

/// Error returned by [`ScriptedCloud`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ScriptedCloudError {
    /// Classification reported to callers.
    pub fault: RemoteFault,
    /// Provider-style message.
    pub message: String,
}

impl ScriptedCloudError {
    fn new(fault: RemoteFault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }

    fn not_found(volume_id: &str) -> Self {
        Self::new(
            RemoteFault::NotFound,
            format!("InvalidVolume.NotFound: The volume '{volume_id}' does not exist."),
        )
    }
}

impl ClassifyFault for ScriptedCloudError {
    fn fault(&self) -> RemoteFault {
        self.fault
    }
}

/// Provider call recorded by [`ScriptedCloud`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloudCall {
    /// `create_volume`.
    Create(CreateVolumeRequest),
    /// `describe_volume`.
    Describe(String),
    /// `attach_volume`.
    Attach {
        /// Volume attached.
        volume_id: String,
        /// Device requested.
        device: Utf8PathBuf,
    },
    /// `set_delete_on_termination`.
    DeleteOnTermination {
        /// Device configured.
        device: Utf8PathBuf,
    },
    /// `detach_volume`.
    Detach {
        /// Volume detached.
        volume_id: String,
        /// Force flag.
        force: bool,
    },
    /// `delete_volume`.
    Delete(String),
}

#[derive(Debug, Default)]
struct Script {
    contended_attaches: u32,
    transient_detaches: u32,
    create_failure: Option<String>,
    attach_failure: Option<String>,
    delete_on_termination_failure: Option<String>,
    detach_failure: Option<String>,
    delete_failure: Option<String>,
    stuck_creating: bool,
    hide_devices: bool,
    lose_attach_responses: bool,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u32,
    volumes: BTreeMap<String, Volume>,
    attachments: BTreeMap<String, Utf8PathBuf>,
    devices: BTreeSet<Utf8PathBuf>,
    calls: Vec<CloudCall>,
    script: Script,
}

/// In-memory volume provider with scriptable failures.
///
/// Volumes are numbered `vol-1`, `vol-2`, ... and become available
/// immediately unless [`ScriptedCloud::stay_creating`] is set.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCloud {
    inner: Arc<Mutex<CloudState>>,
}

impl ScriptedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a probe that sees the device nodes created by attachments.
    #[must_use]
    pub fn probe(&self) -> ScriptedProbe {
        ScriptedProbe {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.inner).calls.clone()
    }

    /// Returns the volume ids passed to `delete_volume`.
    #[must_use]
    pub fn delete_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CloudCall::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Returns the devices passed to `attach_volume`, in order.
    #[must_use]
    pub fn attach_devices(&self) -> Vec<Utf8PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CloudCall::Attach { device, .. } => Some(device),
                _ => None,
            })
            .collect()
    }

    /// Returns the create requests received.
    #[must_use]
    pub fn create_requests(&self) -> Vec<CreateVolumeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CloudCall::Create(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of recorded calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&CloudCall) -> bool) -> usize {
        lock(&self.inner).calls.iter().filter(|call| predicate(call)).count()
    }

    /// Returns the current state of a volume, if it exists.
    #[must_use]
    pub fn volume_state(&self, volume_id: &str) -> Option<VolumeState> {
        lock(&self.inner)
            .volumes
            .get(volume_id)
            .map(|volume| volume.state)
    }

    /// Rejects the next `count` attach calls as "already in use".
    pub fn contend_attaches(&self, count: u32) {
        lock(&self.inner).script.contended_attaches = count;
    }

    /// Fails the next `count` detach calls with a throttling error.
    pub fn throttle_detaches(&self, count: u32) {
        lock(&self.inner).script.transient_detaches = count;
    }

    /// Fails every create call with `message`.
    pub fn fail_create(&self, message: impl Into<String>) {
        lock(&self.inner).script.create_failure = Some(message.into());
    }

    /// Fails every attach call with a non-contention error.
    pub fn fail_attach(&self, message: impl Into<String>) {
        lock(&self.inner).script.attach_failure = Some(message.into());
    }

    /// Fails every delete-on-termination call.
    pub fn fail_delete_on_termination(&self, message: impl Into<String>) {
        lock(&self.inner).script.delete_on_termination_failure = Some(message.into());
    }

    /// Fails every detach call with a non-retryable error.
    pub fn fail_detach(&self, message: impl Into<String>) {
        lock(&self.inner).script.detach_failure = Some(message.into());
    }

    /// Fails every delete call.
    pub fn fail_delete(&self, message: impl Into<String>) {
        lock(&self.inner).script.delete_failure = Some(message.into());
    }

    /// Keeps new volumes in the `creating` state forever.
    pub fn stay_creating(&self) {
        lock(&self.inner).script.stuck_creating = true;
    }

    /// Accepts attachments without creating device nodes.
    pub fn hide_devices(&self) {
        lock(&self.inner).script.hide_devices = true;
    }

    /// Applies every attach and then reports a dropped connection, as when
    /// the response to an accepted call is lost in transit.
    pub fn lose_attach_responses(&self) {
        lock(&self.inner).script.lose_attach_responses = true;
    }

    /// Inserts an unattached, available volume.
    pub fn seed_available(&self, volume_id: &str) {
        lock(&self.inner).volumes.insert(
            volume_id.to_owned(),
            scripted_volume(volume_id, VolumeState::Available),
        );
    }

    /// Inserts a volume that is already attached at `device`.
    pub fn seed_attached(&self, volume_id: &str, device: &Utf8Path) {
        let mut state = lock(&self.inner);
        state.volumes.insert(
            volume_id.to_owned(),
            scripted_volume(volume_id, VolumeState::InUse),
        );
        state
            .attachments
            .insert(volume_id.to_owned(), device.to_path_buf());
        state.devices.insert(device.to_path_buf());
    }

    fn handle_create(&self, request: &CreateVolumeRequest) -> Result<Volume, ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::Create(request.clone()));
        if let Some(message) = state.script.create_failure.clone() {
            return Err(ScriptedCloudError::new(RemoteFault::Other, message));
        }
        state.next_id += 1;
        let id = format!("vol-{}", state.next_id);
        let settled = if state.script.stuck_creating {
            VolumeState::Creating
        } else {
            VolumeState::Available
        };
        let mut volume = Volume {
            id: id.clone(),
            state: settled,
            availability_zone: request.availability_zone.clone(),
            class: request.class,
            size_gb: request.size_gb,
            iops: request.iops,
        };
        state.volumes.insert(id, volume.clone());
        volume.state = VolumeState::Creating;
        Ok(volume)
    }

    fn handle_describe(&self, volume_id: &str) -> Result<Volume, ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::Describe(volume_id.to_owned()));
        state
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| ScriptedCloudError::not_found(volume_id))
    }

    fn handle_attach(&self, volume_id: &str, device: &Utf8Path) -> Result<(), ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::Attach {
            volume_id: volume_id.to_owned(),
            device: device.to_path_buf(),
        });
        if state.script.contended_attaches > 0 {
            state.script.contended_attaches -= 1;
            return Err(ScriptedCloudError::new(
                RemoteFault::DeviceInUse,
                format!("InvalidParameterValue: Attachment point {device} is already in use"),
            ));
        }
        if let Some(message) = state.script.attach_failure.clone() {
            return Err(ScriptedCloudError::new(RemoteFault::Other, message));
        }
        let hide = state.script.hide_devices;
        let Some(volume) = state.volumes.get_mut(volume_id) else {
            return Err(ScriptedCloudError::not_found(volume_id));
        };
        volume.state = VolumeState::InUse;
        state
            .attachments
            .insert(volume_id.to_owned(), device.to_path_buf());
        if !hide {
            state.devices.insert(device.to_path_buf());
        }
        if state.script.lose_attach_responses {
            return Err(ScriptedCloudError::new(
                RemoteFault::Transient,
                "dispatch failure: connection reset by peer",
            ));
        }
        Ok(())
    }

    fn handle_delete_on_termination(&self, device: &Utf8Path) -> Result<(), ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::DeleteOnTermination {
            device: device.to_path_buf(),
        });
        state
            .script
            .delete_on_termination_failure
            .clone()
            .map_or(Ok(()), |message| {
                Err(ScriptedCloudError::new(RemoteFault::Other, message))
            })
    }

    fn handle_detach(&self, volume_id: &str, force: bool) -> Result<(), ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::Detach {
            volume_id: volume_id.to_owned(),
            force,
        });
        if state.script.transient_detaches > 0 {
            state.script.transient_detaches -= 1;
            return Err(ScriptedCloudError::new(
                RemoteFault::Transient,
                "RequestLimitExceeded: Request limit exceeded.",
            ));
        }
        if let Some(message) = state.script.detach_failure.clone() {
            return Err(ScriptedCloudError::new(RemoteFault::Other, message));
        }
        let Some(volume) = state.volumes.get_mut(volume_id) else {
            return Err(ScriptedCloudError::not_found(volume_id));
        };
        if volume.state == VolumeState::Available {
            return Err(ScriptedCloudError::new(
                RemoteFault::AlreadyDetached,
                format!("IncorrectState: Volume '{volume_id}' is in the 'available' state."),
            ));
        }
        volume.state = VolumeState::Available;
        if let Some(device) = state.attachments.remove(volume_id) {
            state.devices.remove(&device);
        }
        Ok(())
    }

    fn handle_delete(&self, volume_id: &str) -> Result<(), ScriptedCloudError> {
        let mut state = lock(&self.inner);
        state.calls.push(CloudCall::Delete(volume_id.to_owned()));
        if let Some(message) = state.script.delete_failure.clone() {
            return Err(ScriptedCloudError::new(RemoteFault::Other, message));
        }
        state
            .volumes
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| ScriptedCloudError::not_found(volume_id))
    }
}

fn scripted_volume(volume_id: &str, state: VolumeState) -> Volume {
    Volume {
        id: volume_id.to_owned(),
        state,
        availability_zone: fixed_context().availability_zone,
        class: crate::request::VolumeClass::GeneralPurpose,
        size_gb: 200,
        iops: None,
    }
}

impl VolumeBackend for ScriptedCloud {
    type Error = ScriptedCloudError;

    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, Volume, Self::Error> {
        Box::pin(async move { self.handle_create(request) })
    }

    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, Volume, Self::Error> {
        Box::pin(async move { self.handle_describe(volume_id) })
    }

    fn attach_volume<'a>(
        &'a self,
        _instance_id: &'a str,
        volume_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.handle_attach(volume_id, device) })
    }

    fn set_delete_on_termination<'a>(
        &'a self,
        _instance_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.handle_delete_on_termination(device) })
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        force: bool,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.handle_detach(volume_id, force) })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.handle_delete(volume_id) })
    }
}

/// Device probe sharing state with a [`ScriptedCloud`].
#[derive(Clone, Debug)]
pub struct ScriptedProbe {
    inner: Arc<Mutex<CloudState>>,
}

impl ScriptedProbe {
    /// Marks a device node as present, as if another process held it.
    pub fn occupy(&self, device: impl Into<Utf8PathBuf>) {
        lock(&self.inner).devices.insert(device.into());
    }
}

impl DeviceProbe for ScriptedProbe {
    fn exists(&self, device: &Utf8Path) -> bool {
        lock(&self.inner).devices.contains(device)
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order and
/// succeeds once the queue is empty.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns the invocations rendered as command strings.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let output = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            });
        Box::pin(async move { Ok(output) })
    }
}

/// Sleeper that records every pause and returns immediately.
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    pauses: Arc<Mutex<Vec<(PauseKind, Duration)>>>,
}

impl RecordingSleeper {
    /// Creates a sleeper with no recorded pauses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded pause.
    #[must_use]
    pub fn pauses(&self) -> Vec<(PauseKind, Duration)> {
        lock(&self.pauses).clone()
    }

    /// Returns the durations recorded for `kind`.
    #[must_use]
    pub fn durations(&self, kind: PauseKind) -> Vec<Duration> {
        self.pauses()
            .into_iter()
            .filter(|(recorded, _)| *recorded == kind)
            .map(|(_, duration)| duration)
            .collect()
    }

    /// Returns the number of pauses recorded for `kind`.
    #[must_use]
    pub fn count(&self, kind: PauseKind) -> usize {
        self.durations(kind).len()
    }
}

impl Sleeper for RecordingSleeper {
    fn pause(&self, kind: PauseKind, duration: Duration) -> SleepFuture<'_> {
        lock(&self.pauses).push((kind, duration));
        Box::pin(async {})
    }
}

/// Settings with small, deterministic bounds for scripted tests.
#[must_use]
pub fn test_settings() -> LifecycleSettings {
    LifecycleSettings {
        poll: PollPolicy {
            max_attempts: 5,
            interval: Duration::from_millis(10),
            jitter: Duration::ZERO,
        },
        allocator: AllocatorPolicy {
            start_offset: Some(0),
            device_wait_checks: 3,
            device_wait_interval: Duration::from_millis(10),
            ..AllocatorPolicy::default()
        },
        ..LifecycleSettings::default()
    }
}

/// Lifecycle manager wired to scripted collaborators.
pub type ScriptedManager = VolumeLifecycleManager<ScriptedCloud, ScriptedRunner>;

/// Scripted collaborators plus a manager built from them.
#[derive(Clone)]
pub struct Harness {
    /// Scripted provider.
    pub cloud: ScriptedCloud,
    /// Scripted command runner used by the mount executor.
    pub runner: ScriptedRunner,
    /// Recording sleeper.
    pub sleeper: RecordingSleeper,
    /// Manager under test.
    pub manager: Arc<ScriptedManager>,
}

impl Harness {
    /// Builds a harness with [`test_settings`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    /// Builds a harness with the given settings.
    #[must_use]
    pub fn with_settings(settings: LifecycleSettings) -> Self {
        let cloud = ScriptedCloud::new();
        Self::with_cloud(cloud, settings)
    }

    /// Builds a harness around an existing cloud.
    #[must_use]
    pub fn with_cloud(cloud: ScriptedCloud, settings: LifecycleSettings) -> Self {
        let runner = ScriptedRunner::new();
        let sleeper = RecordingSleeper::new();
        let probe: Arc<dyn DeviceProbe> = Arc::new(cloud.probe());
        let executor =
            LocalMountExecutor::new(runner.clone(), MountTools::default(), Arc::clone(&probe));
        let manager = VolumeLifecycleManager::new(
            cloud.clone(),
            executor,
            Arc::new(fixed_context()),
            probe,
            settings,
        )
        .with_sleeper(Arc::new(sleeper.clone()));

        Self {
            cloud,
            runner,
            sleeper,
            manager: Arc::new(manager),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables while holding the global mutex.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
