//! Command-line interface definitions for the `ebsmount` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `ebsmount` binary.
#[derive(Debug, Parser)]
#[command(
    name = "ebsmount",
    about = "Create, attach, format and mount EBS volumes on this instance",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log filter used when `RUST_LOG` is unset (for example `debug`).
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub(crate) log_level: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands accepted by `ebsmount`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create, attach, format and mount a volume, then print it as JSON.
    #[command(name = "mount", about = "Create and mount a volume, printing the result as JSON")]
    Mount(VolumeArgs),
    /// Unmount, detach and delete a volume.
    #[command(name = "unmount", about = "Unmount, detach and delete a volume")]
    Unmount(UnmountArgs),
    /// Mount a volume, run a command against it, then tear it down.
    #[command(name = "run", about = "Mount a volume, run a command, then remove the volume")]
    Run(RunCommand),
    /// Serve mount and unmount requests over HTTP.
    #[command(name = "server", about = "Serve mount and unmount requests over HTTP")]
    Server(ServerArgs),
}

/// Volume parameters shared by `mount` and `run`.
#[derive(Clone, Debug, Args)]
pub(crate) struct VolumeArgs {
    /// Volume size in GiB.
    #[arg(
        short = 's',
        long,
        value_name = "GIB",
        default_value_t = 200,
        allow_negative_numbers = true
    )]
    pub(crate) size: i64,
    /// Absolute directory to mount the volume on.
    #[arg(short = 'm', long, value_name = "PATH", default_value = "")]
    pub(crate) mount_point: String,
    /// Volume class: gp2, io1, st1, sc1 or standard.
    #[arg(short = 'v', long, value_name = "TYPE", default_value = "gp2")]
    pub(crate) volume_type: String,
    /// Filesystem: ext4, ext3 or ext2.
    #[arg(short = 't', long, value_name = "FS", default_value = "ext4")]
    pub(crate) fs_type: String,
    /// Provisioned IOPS for io1 volumes; derived from the size when omitted.
    #[arg(short = 'i', long, value_name = "IOPS", allow_negative_numbers = true)]
    pub(crate) iops: Option<i64>,
    /// Keep the volume when the instance terminates.
    #[arg(short = 'k', long)]
    pub(crate) keep: bool,
}

/// Arguments for the `ebsmount unmount` subcommand.
#[derive(Debug, Args)]
pub(crate) struct UnmountArgs {
    /// Identifier of the volume to remove.
    #[arg(short = 'v', long, value_name = "ID", default_value = "")]
    pub(crate) volume_id: String,
    /// Directory to unmount before detaching.
    #[arg(short = 'm', long, value_name = "PATH")]
    pub(crate) mount_point: Option<String>,
}

/// Arguments for the `ebsmount run` subcommand.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Volume to create for the duration of the command.
    #[command(flatten)]
    pub(crate) volume: VolumeArgs,
    /// Command to execute once the volume is mounted (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `ebsmount server` subcommand.
#[derive(Debug, Args)]
pub(crate) struct ServerArgs {
    /// Unix socket to listen on.
    #[arg(short = 's', long, value_name = "PATH", default_value = "./ebsmount.sock")]
    pub(crate) socket: String,
    /// TCP address to listen on instead of the unix socket.
    #[arg(long, value_name = "ADDR")]
    pub(crate) listen: Option<SocketAddr>,
}
