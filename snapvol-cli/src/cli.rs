// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "snapvol", version)]
#[command(about = "Download block-storage volumes into sparse images and mount them")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/snapvol/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Snapshot a volume and reconstruct it as a local sparse image
    Download(DownloadArgs),
    /// Attach an image, mount its filesystem and run a command inside it
    Mount(MountArgs),
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    pub volume_id: String,

    /// Destination image file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Root of the local block store
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    #[arg(long)]
    pub region: Option<String>,

    /// Snapshot volumes attached to an instance without asking
    #[arg(long)]
    pub force: bool,

    /// Download an existing snapshot instead of creating one
    #[arg(long, value_name = "ID")]
    pub snapshot_id: Option<String>,

    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Replace an existing output file without asking
    #[arg(long)]
    pub overwrite: bool,

    /// Reserve the whole image on disk instead of leaving holes
    #[arg(long)]
    pub full_allocation: bool,
}

#[derive(Debug, Args)]
pub struct MountArgs {
    pub image: PathBuf,

    /// Partition number to mount (1-based); skips logical volume discovery
    #[arg(long, value_name = "N")]
    pub partition: Option<u32>,

    /// Print partitions and logical volumes without mounting
    #[arg(long, conflicts_with_all = ["partition", "mount_point", "command"])]
    pub list: bool,

    #[arg(long, value_name = "DIR")]
    pub mount_point: Option<PathBuf>,

    #[arg(long)]
    pub read_only: bool,

    /// Command to run in the mounted filesystem (default: interactive shell)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}
