//! Child process executed against a mounted volume by the `run` command.
//!
//! The workload's stdout and stderr both go to this process's stderr so
//! stdout stays reserved for machine-readable output. Its exit code is
//! returned as-is; only a failure to start, a signal, or cancellation is an
//! error.

use std::io;
use std::process::Stdio;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised while running a workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The command line was rejected before running.
    #[error("invalid command: {0}")]
    Invalid(String),
    /// The process could not be started.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Waiting for the process failed.
    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        /// Rendered command line.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The process was terminated by a signal.
    #[error("`{command}` terminated without an exit status")]
    Signalled {
        /// Rendered command line.
        command: String,
    },
    /// The caller cancelled and the process was killed.
    #[error("`{command}` was cancelled")]
    Cancelled {
        /// Rendered command line.
        command: String,
    },
}

/// Validated argv for a workload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Workload {
    argv: Vec<String>,
}

impl Workload {
    /// Validates `argv`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::Invalid`] when `argv` is empty or any
    /// argument contains a NUL byte, which no process argument can carry.
    /// Other control characters such as newlines and tabs pass through
    /// unchanged.
    pub fn new(argv: Vec<String>) -> Result<Self, WorkloadError> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(WorkloadError::Invalid(String::from(
                "a command to run is required",
            )));
        }
        if argv.iter().any(|arg| arg.contains('\0')) {
            return Err(WorkloadError::Invalid(String::from(
                "command arguments must not contain NUL bytes",
            )));
        }
        Ok(Self { argv })
    }

    /// Returns the shell-escaped command line, for messages.
    #[must_use]
    pub fn render(&self) -> String {
        self.argv
            .iter()
            .map(|arg| escape(arg.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the workload and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::Spawn`] or [`WorkloadError::Wait`] on IO
    /// failures, [`WorkloadError::Signalled`] when no exit code is available,
    /// and [`WorkloadError::Cancelled`] after killing the process when
    /// `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<i32, WorkloadError> {
        let command = self.render();
        let Some((program, args)) = self.argv.split_first() else {
            return Err(WorkloadError::Invalid(String::from(
                "a command to run is required",
            )));
        };

        debug!(%command, "starting workload");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::from(io::stderr()))
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkloadError::Spawn {
                command: command.clone(),
                source,
            })?;

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let Some(waited) = outcome else {
            if let Err(err) = child.kill().await {
                warn!(%command, error = %err, "failed to kill cancelled workload");
            }
            return Err(WorkloadError::Cancelled { command });
        };
        let status = waited.map_err(|source| WorkloadError::Wait {
            command: command.clone(),
            source,
        })?;

        status
            .code()
            .ok_or(WorkloadError::Signalled { command })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![])]
    #[case(vec![String::new()])]
    fn empty_command_is_rejected(#[case] argv: Vec<String>) {
        let err = Workload::new(argv).expect_err("empty command");
        assert!(matches!(err, WorkloadError::Invalid(_)), "{err}");
    }

    #[rstest]
    #[case::program(vec![String::from("ec\u{0}ho")])]
    #[case::argument(vec![String::from("echo"), String::from("nul\u{0}")])]
    fn nul_bytes_are_rejected(#[case] argv: Vec<String>) {
        let err = Workload::new(argv).expect_err("NUL rejected");
        assert!(err.to_string().contains("NUL"), "{err}");
    }

    #[rstest]
    #[case::newline("line one\nline two")]
    #[case::tab("col\tcol")]
    #[case::escape("\u{1b}[1m")]
    fn other_control_characters_pass_through(#[case] arg: &str) {
        let result = Workload::new(vec![String::from("printf"), arg.to_owned()]);
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn multi_line_scripts_run_unchanged() {
        let workload = Workload::new(vec![
            String::from("sh"),
            String::from("-c"),
            String::from("true\nexit 3"),
        ])
        .expect("multi-line script is valid");
        let code = workload
            .run(&CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("workload should run: {err}"));
        assert_eq!(code, 3);
    }

    #[test]
    fn render_escapes_arguments() {
        let workload = Workload::new(vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ])
        .expect("valid workload");
        assert_eq!(workload.render(), "echo 'a b' 'c'\\''d'");
    }

    #[tokio::test]
    async fn exit_code_is_preserved() {
        let workload = Workload::new(vec![
            String::from("sh"),
            String::from("-c"),
            String::from("exit 7"),
        ])
        .expect("valid workload");
        let code = workload
            .run(&CancellationToken::new())
            .await
            .unwrap_or_else(|err| panic!("workload should run: {err}"));
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let workload = Workload::new(vec![String::from("/nonexistent/ebsmount-test-binary")])
            .expect("valid workload");
        let err = workload
            .run(&CancellationToken::new())
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, WorkloadError::Spawn { .. }), "{err}");
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let workload = Workload::new(vec![String::from("sleep"), String::from("30")])
            .expect("valid workload");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = workload.run(&cancel).await.expect_err("cancelled");
        assert!(matches!(err, WorkloadError::Cancelled { .. }), "{err}");
    }
}
