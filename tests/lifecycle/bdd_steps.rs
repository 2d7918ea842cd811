//! BDD step definitions for the volume lifecycle.

use camino::Utf8Path;
use ebsmount::poller::PauseKind;
use ebsmount::{FilesystemType, VolumeClass, VolumeSpec, WorkloadError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{LifecycleContext, LifecycleOutcome, LifecycleTestError};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LifecycleTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn volume_spec(
    context: &LifecycleContext,
    volume_type: &str,
    size_gb: u32,
) -> Result<VolumeSpec, StepError> {
    let class = volume_type
        .parse::<VolumeClass>()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    Ok(VolumeSpec {
        size_gb,
        class,
        iops: None,
        filesystem: FilesystemType::Ext4,
        keep: false,
        mount_point: context.mount_point.clone(),
    })
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

#[given("a ready lifecycle manager")]
fn ready_manager(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("the next \"{count}\" attach attempts are contended")]
fn contended_attaches(lifecycle_context: LifecycleContext, count: u32) -> LifecycleContext {
    lifecycle_context.harness.cloud.contend_attaches(count);
    lifecycle_context
}

#[given("formatting fails with \"{stderr}\"")]
fn formatting_fails(lifecycle_context: LifecycleContext, stderr: String) -> LifecycleContext {
    lifecycle_context.harness.runner.push_failure(1, stderr);
    lifecycle_context
}

#[given("volume deletion fails with \"{message}\"")]
fn deletion_fails(lifecycle_context: LifecycleContext, message: String) -> LifecycleContext {
    lifecycle_context.harness.cloud.fail_delete(message);
    lifecycle_context
}

#[given("an attached volume \"{volume_id}\" under \"{device}\"")]
fn attached_volume(
    lifecycle_context: LifecycleContext,
    volume_id: String,
    device: String,
) -> LifecycleContext {
    lifecycle_context
        .harness
        .cloud
        .seed_attached(&volume_id, Utf8Path::new(&device));
    lifecycle_context
}

#[when("I create and mount a \"{volume_type}\" volume of \"{size_gb}\" GiB")]
fn create_and_mount(
    mut lifecycle_context: LifecycleContext,
    volume_type: String,
    size_gb: u32,
) -> Result<LifecycleContext, StepError> {
    let spec = volume_spec(&lifecycle_context, &volume_type, size_gb)?;
    let manager = lifecycle_context.harness.manager.clone();
    let result = runtime()?.block_on(async move {
        manager
            .create_and_mount(&spec, &CancellationToken::new())
            .await
    });

    lifecycle_context.outcome = Some(match result {
        Ok(mounted) => LifecycleOutcome::Mounted(mounted),
        Err(err) => LifecycleOutcome::Failed {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        },
    });
    Ok(lifecycle_context)
}

#[when("I tear down volume \"{volume_id}\"")]
fn tear_down(
    mut lifecycle_context: LifecycleContext,
    volume_id: String,
) -> Result<LifecycleContext, StepError> {
    let manager = lifecycle_context.harness.manager.clone();
    let result = runtime()?.block_on(async move {
        manager
            .unmount_detach_delete(&volume_id, None, &CancellationToken::new())
            .await
    });

    lifecycle_context.outcome = Some(match result {
        Ok(()) => LifecycleOutcome::TornDown,
        Err(err) => LifecycleOutcome::Failed {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        },
    });
    Ok(lifecycle_context)
}

#[when("I run a failing workload against a \"{volume_type}\" volume of \"{size_gb}\" GiB")]
fn run_failing_workload(
    mut lifecycle_context: LifecycleContext,
    volume_type: String,
    size_gb: u32,
) -> Result<LifecycleContext, StepError> {
    let spec = volume_spec(&lifecycle_context, &volume_type, size_gb)?;
    let manager = lifecycle_context.harness.manager.clone();
    let result = runtime()?.block_on(async move {
        manager
            .with_mounted_volume(&spec, &CancellationToken::new(), |mounted| async move {
                Err::<(), _>(WorkloadError::Signalled {
                    command: format!("ls {}", mounted.mount_point),
                })
            })
            .await
    });

    lifecycle_context.outcome = Some(match result {
        Ok(()) => LifecycleOutcome::TornDown,
        Err(err) => LifecycleOutcome::Failed {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        },
    });
    Ok(lifecycle_context)
}

#[then("the volume \"{volume_id}\" is mounted under \"{device}\"")]
fn mounted_under(
    lifecycle_context: &LifecycleContext,
    volume_id: String,
    device: String,
) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleOutcome::Mounted(mounted))
            if mounted.volume_id == volume_id && mounted.device.as_str() == device =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected {volume_id} mounted under {device}, got {other:?}"
        ))),
    }
}

#[then("the tool run \"{command}\" was invoked")]
fn tool_invoked(lifecycle_context: &LifecycleContext, command: String) -> Result<(), StepError> {
    let commands = lifecycle_context.harness.runner.command_strings();
    if commands.contains(&command) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected '{command}' among {commands:?}"
        )))
    }
}

#[then("the volume \"{volume_id}\" was deleted exactly once")]
fn deleted_once(lifecycle_context: &LifecycleContext, volume_id: String) -> Result<(), StepError> {
    let deletes = lifecycle_context.harness.cloud.delete_calls();
    let matching = deletes.iter().filter(|id| **id == volume_id).count();
    if matching == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one delete of {volume_id}, got {deletes:?}"
        )))
    }
}

#[then("the volume was created with \"{iops}\" IOPS")]
fn created_with_iops(lifecycle_context: &LifecycleContext, iops: u32) -> Result<(), StepError> {
    let requests = lifecycle_context.harness.cloud.create_requests();
    match requests.as_slice() {
        [request] if request.iops == Some(iops) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one create request with {iops} IOPS, got {other:?}"
        ))),
    }
}

#[then("\"{count}\" attach backoffs were taken")]
fn attach_backoffs(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let taken = lifecycle_context
        .harness
        .sleeper
        .count(PauseKind::AttachBackoff);
    if taken == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} attach backoffs, got {taken}"
        )))
    }
}

#[then("the operation fails with kind \"{kind}\"")]
fn fails_with_kind(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleOutcome::Failed { kind: actual, .. }) if *actual == kind => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure of kind {kind}, got {other:?}"
        ))),
    }
}

#[then("the failure mentions \"{text}\"")]
fn failure_mentions(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleOutcome::Failed { message, .. }) if message.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning '{text}', got {other:?}"
        ))),
    }
}
