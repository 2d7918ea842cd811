//! Binary entry point for the `ebsmount` CLI.

use std::error::Error as _;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser};
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ebsmount::{
    ConfigError, ContextError, ContextResolver, DeviceProbe, EbsmountConfig, Ec2Backend,
    Ec2BackendError, FsProbe, ImdsClient, LifecycleError, LocalMountExecutor, MountRequest,
    ProcessCommandRunner, ServerError, Transport, UnmountRequest, ValidationError,
    VolumeLifecycleManager, Workload, WorkloadError, server,
};

mod cli;

use cli::{Cli, Command, RunCommand, ServerArgs, UnmountArgs, VolumeArgs};

type Manager = VolumeLifecycleManager<Ec2Backend, ProcessCommandRunner>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("backend error: {0}")]
    Backend(#[from] Ec2BackendError),
    #[error(transparent)]
    Lifecycle(Box<LifecycleError<Ec2BackendError>>),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

impl From<LifecycleError<Ec2BackendError>> for CliError {
    fn from(err: LifecycleError<Ec2BackendError>) -> Self {
        Self::Lifecycle(Box::new(err))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .ok();
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    match command {
        Command::Mount(args) => mount_command(&args).await,
        Command::Unmount(args) => unmount_command(&args).await,
        Command::Run(args) => run_command(args).await,
        Command::Server(args) => server_command(&args).await,
    }
}

fn mount_request(args: &VolumeArgs) -> MountRequest {
    MountRequest {
        size: args.size,
        mount_point: args.mount_point.clone(),
        volume_type: args.volume_type.clone(),
        fs_type: args.fs_type.clone(),
        iops: args.iops,
        keep: args.keep,
    }
}

async fn mount_command(args: &VolumeArgs) -> Result<i32, CliError> {
    let spec = mount_request(args).validate()?;
    let manager = build_manager().await?;
    let cancel = cancel_on_interrupt();

    let mounted = manager.create_and_mount(&spec, &cancel).await?;
    let json = serde_json::to_string(&mounted)
        .map_err(|err| CliError::Output(io::Error::other(err)))?;
    writeln!(io::stdout(), "{json}").map_err(CliError::Output)?;
    Ok(0)
}

async fn unmount_command(args: &UnmountArgs) -> Result<i32, CliError> {
    let target = UnmountRequest {
        volume_id: args.volume_id.clone(),
        mount_point: args.mount_point.clone(),
    }
    .validate()?;
    let manager = build_manager().await?;
    let cancel = cancel_on_interrupt();

    manager
        .unmount_detach_delete(&target.volume_id, target.mount_point.as_deref(), &cancel)
        .await?;
    info!(volume_id = %target.volume_id, "volume removed");
    Ok(0)
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let spec = mount_request(&args.volume).validate()?;
    let workload = Workload::new(args.command)?;
    let manager = build_manager().await?;
    let cancel = cancel_on_interrupt();

    let token = cancel.clone();
    let code = manager
        .with_mounted_volume(&spec, &cancel, move |mounted| async move {
            info!(
                volume_id = %mounted.volume_id,
                mount_point = %mounted.mount_point,
                command = %workload.render(),
                "running workload"
            );
            workload.run(&token).await
        })
        .await?;
    Ok(code)
}

async fn server_command(args: &ServerArgs) -> Result<i32, CliError> {
    let manager = build_manager().await?;
    let transport = args.listen.map_or_else(
        || Transport::Unix(Utf8PathBuf::from(&args.socket)),
        Transport::Tcp,
    );
    server::serve(Arc::new(manager), transport, shutdown_signal()).await?;
    Ok(0)
}

async fn build_manager() -> Result<Manager, CliError> {
    let config = EbsmountConfig::load_without_cli_args()?;
    config.validate()?;

    let imds = ImdsClient::new(config.metadata_endpoint.clone())?;
    let context = imds.resolve().await?;
    let region = config
        .region
        .clone()
        .unwrap_or_else(|| context.region.clone());
    info!(
        instance_id = %context.instance_id,
        zone = %context.availability_zone,
        %region,
        "resolved instance context"
    );

    let backend = Ec2Backend::load(&region, config.ec2_endpoint.as_deref()).await?;
    let probe: Arc<dyn DeviceProbe> = Arc::new(FsProbe);
    let executor =
        LocalMountExecutor::new(ProcessCommandRunner, config.mount_tools(), Arc::clone(&probe));
    Ok(VolumeLifecycleManager::new(
        backend,
        executor,
        Arc::new(context),
        probe,
        config.settings(),
    ))
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling and cleaning up");
            token.cancel();
        }
    });
    cancel
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    if let CliError::Validation(validation) = err {
        for problem in &validation.problems {
            writeln!(target, "error: {problem}").ok();
        }
        writeln!(target, "{}", Cli::command().render_usage()).ok();
        return;
    }

    let message = err.to_string();
    writeln!(target, "error: {message}").ok();
    let mut cause = err.source();
    while let Some(inner) = cause {
        let text = inner.to_string();
        if !message.contains(&text) {
            writeln!(target, "  caused by: {text}").ok();
        }
        cause = inner.source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebsmount::VolumeClass;

    fn volume_args(mount_point: &str) -> VolumeArgs {
        VolumeArgs {
            size: 100,
            mount_point: mount_point.to_owned(),
            volume_type: String::from("io1"),
            fs_type: String::from("ext3"),
            iops: Some(0),
            keep: true,
        }
    }

    fn render(err: &CliError) -> String {
        let mut buffer = Vec::new();
        write_error(&mut buffer, err);
        String::from_utf8(buffer).expect("utf-8 output")
    }

    #[test]
    fn volume_args_map_onto_a_mount_request() {
        let spec = mount_request(&volume_args("/scratch"))
            .validate()
            .expect("valid request");

        assert_eq!(spec.class, VolumeClass::ProvisionedIops);
        assert_eq!(spec.size_gb, 100);
        assert_eq!(spec.iops, None);
        assert!(spec.keep);
        assert_eq!(spec.normalized_iops(), Some(4_500));
    }

    #[test]
    fn validation_errors_list_every_problem_with_usage() {
        let mut args = volume_args("relative");
        args.size = -5;
        let err = CliError::from(
            mount_request(&args)
                .validate()
                .expect_err("invalid request"),
        );

        let output = render(&err);

        assert!(output.contains("error: invalid size -5"), "{output}");
        assert!(output.contains("absolute path"), "{output}");
        assert!(output.contains("Usage:"), "{output}");
    }

    #[test]
    fn lifecycle_errors_print_one_line_per_new_cause() {
        let err = CliError::Workload(WorkloadError::Spawn {
            command: String::from("missing-binary"),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        });

        let output = render(&err);

        assert!(output.starts_with("error: failed to start `missing-binary`"), "{output}");
        assert!(!output.contains("caused by"), "{output}");
    }

    #[test]
    fn cli_parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "ebsmount", "run", "-m", "/data", "-v", "st1", "--", "ls", "-la",
        ])
        .expect("parse run");

        let Command::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.volume.volume_type, "st1");
        assert_eq!(run.command, vec![String::from("ls"), String::from("-la")]);
    }

    #[test]
    fn cli_defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["ebsmount", "server"]).expect("parse server");

        assert_eq!(cli.log_level, "info");
        let Command::Server(server) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(server.socket, "./ebsmount.sock");
        assert_eq!(server.listen, None);
    }
}
