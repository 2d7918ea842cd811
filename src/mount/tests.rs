//! Unit tests for the local mount executor.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{ScriptedCloud, ScriptedProbe, ScriptedRunner};

struct Rig {
    runner: ScriptedRunner,
    probe: ScriptedProbe,
    executor: LocalMountExecutor<ScriptedRunner>,
    scratch: TempDir,
}

impl Rig {
    fn mount_point(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.scratch.path().join("nested/data"))
            .unwrap_or_else(|path| panic!("non-UTF-8 temp path: {}", path.display()))
    }
}

#[fixture]
fn rig() -> Rig {
    let runner = ScriptedRunner::new();
    let probe = ScriptedCloud::new().probe();
    probe.occupy("/dev/sdf");
    let executor = LocalMountExecutor::new(
        runner.clone(),
        MountTools::default(),
        Arc::new(probe.clone()),
    );
    Rig {
        runner,
        probe,
        executor,
        scratch: TempDir::new().expect("temp dir"),
    }
}

#[rstest]
#[tokio::test]
async fn format_and_mount_runs_mkfs_then_mount_with_noatime(rig: Rig) {
    let mount_point = rig.mount_point();

    rig.executor
        .format_and_mount(Utf8Path::new("/dev/sdf"), FilesystemType::Ext3, &mount_point)
        .await
        .unwrap_or_else(|err| panic!("mount should succeed: {err}"));

    assert_eq!(
        rig.runner.command_strings(),
        vec![
            String::from("mkfs -t ext3 /dev/sdf"),
            format!("mount -o noatime -t ext3 /dev/sdf {mount_point}"),
        ]
    );
    assert!(mount_point.is_dir(), "mount point tree should be created");
}

#[rstest]
#[tokio::test]
async fn missing_device_fails_before_running_tools(rig: Rig) {
    let mount_point = rig.mount_point();

    let err = rig
        .executor
        .format_and_mount(Utf8Path::new("/dev/sdg"), FilesystemType::Ext4, &mount_point)
        .await
        .expect_err("device missing");

    assert!(matches!(err, MountError::DeviceNotAttached { .. }), "{err}");
    assert!(rig.runner.invocations().is_empty());
    assert!(!rig.probe.exists(Utf8Path::new("/dev/sdg")));
}

#[rstest]
#[tokio::test]
async fn tool_failure_carries_combined_output(rig: Rig) {
    rig.runner
        .push_output(Some(1), "mke2fs 1.47.0", "/dev/sdf is apparently in use");
    let mount_point = rig.mount_point();

    let err = rig
        .executor
        .format_and_mount(Utf8Path::new("/dev/sdf"), FilesystemType::Ext4, &mount_point)
        .await
        .expect_err("mkfs fails");

    let MountError::ExternalToolFailure {
        command,
        status,
        output,
    } = &err
    else {
        panic!("expected ExternalToolFailure, got {err}");
    };
    assert_eq!(command, "mkfs -t ext4 /dev/sdf");
    assert_eq!(status, "exit status 1");
    assert_eq!(output, "mke2fs 1.47.0\n/dev/sdf is apparently in use");
    assert_eq!(rig.runner.invocations().len(), 1, "mount must not run");
    assert_eq!(err.kind(), "external_tool_failure");
}

#[rstest]
#[tokio::test]
async fn unmount_failure_is_wrapped(rig: Rig) {
    rig.runner.push_failure(32, "umount: /data: target is busy.");

    let err = rig
        .executor
        .unmount(Utf8Path::new("/data"))
        .await
        .expect_err("umount fails");

    assert!(err.to_string().contains("target is busy"), "{err}");
    assert_eq!(rig.runner.command_strings(), vec![String::from("umount /data")]);
}

#[rstest]
#[tokio::test]
async fn read_ahead_uses_blockdev(rig: Rig) {
    rig.executor
        .set_read_ahead(Utf8Path::new("/dev/sdf"), 2048)
        .await
        .unwrap_or_else(|err| panic!("blockdev should succeed: {err}"));

    assert_eq!(
        rig.runner.command_strings(),
        vec![String::from("blockdev --setra 2048 /dev/sdf")]
    );
}

#[rstest]
#[case(Some(0), true)]
#[case(Some(1), false)]
#[case(None, false)]
fn command_output_success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
    let output = CommandOutput {
        code,
        stdout: String::new(),
        stderr: String::new(),
    };
    assert_eq!(output.is_success(), expected);
}

#[test]
fn signal_termination_is_described() {
    let output = CommandOutput {
        code: None,
        stdout: String::new(),
        stderr: String::from("killed"),
    };
    assert_eq!(output.status_text(), "terminated by signal");
    assert_eq!(output.combined(), "killed");
}
