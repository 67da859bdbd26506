// SPDX-License-Identifier: GPL-3.0-only

use std::fmt::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snapvol_mount::{
    Inventory, MountSession, MountedFilesystem, Resolution, ResolveOptions, Resolver,
    SessionCommand, SessionEnd,
};
use snapvol_sys::SystemHost;
use snapvol_types::format_bytes;

use crate::cli::MountArgs;
use crate::config::Config;

pub async fn run(
    args: MountArgs,
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    ensure_root()?;

    let options = build_options(&args, config);
    let image = args.image.clone();

    // Loop, LVM and mount tools block; keep them off the runtime threads.
    let (resolver, resolution) = tokio::task::spawn_blocking(move || {
        let host = Arc::new(SystemHost::new().context("required host tools are missing")?);
        let mut resolver = Resolver::new(host, &image, options)
            .with_context(|| format!("cannot open image {}", image.display()))?;
        let resolution = resolver
            .resolve()
            .with_context(|| format!("failed to mount {}", image.display()))?;
        anyhow::Ok((resolver, resolution))
    })
    .await
    .context("mount worker panicked")??;

    for warning in resolver.warnings() {
        warn!("{warning}");
    }

    let mounted = match resolution {
        Resolution::Listed(inventory) => {
            print!("{}", render_inventory(&inventory));
            return Ok(ExitCode::SUCCESS);
        }
        Resolution::Mounted(mounted) => mounted,
    };

    println!("{}", describe_mount(&mounted));

    let mut session = MountSession::new(resolver)?;
    let command = SessionCommand::from_argv(&args.command, &config.mount.shell());
    let outcome = session.run(&command, &cancel).await;

    let report = tokio::task::spawn_blocking(move || session.close())
        .await
        .context("teardown worker panicked")?;
    for step in &report.completed {
        info!(step = %step, "released");
    }

    let end = outcome.context("session command failed")?;
    if !report.is_clean() {
        bail!("teardown incomplete: {}", report.failures.join("; "));
    }

    match end {
        SessionEnd::Exited(status) if !status.success() => {
            warn!(%status, "session command failed");
            let code = status.code().unwrap_or(1).clamp(1, 255);
            Ok(ExitCode::from(code as u8))
        }
        SessionEnd::Exited(_) => Ok(ExitCode::SUCCESS),
        SessionEnd::Cancelled => {
            info!("session cancelled, image released");
            Ok(ExitCode::from(130))
        }
    }
}

fn ensure_root() -> anyhow::Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("attaching and mounting images requires root privileges (run with sudo)");
    }
    Ok(())
}

fn build_options(args: &MountArgs, config: &Config) -> ResolveOptions {
    let mut options = ResolveOptions::new(&args.image, &config.mount.mount_root);
    options.partition = args.partition;
    options.list_only = args.list;
    if let Some(mount_point) = &args.mount_point {
        options.mount_point = mount_point.clone();
    }
    options.read_only = args.read_only || config.mount.read_only;
    options
}

fn describe_mount(mounted: &MountedFilesystem) -> String {
    let source = match (&mounted.logical_volume, mounted.partition) {
        (Some(lv), _) => format!("logical volume {}", lv.display_name()),
        (None, Some(index)) => format!("partition {index}"),
        (None, None) => "whole device".to_string(),
    };
    format!(
        "Mounted {source} ({}, {}) at {}",
        mounted.device,
        mounted.fs_type,
        mounted.mount_point.display()
    )
}

fn render_inventory(inventory: &Inventory) -> String {
    let mut out = String::new();
    let table = &inventory.partitions;

    let kind = table.table_type.map(|t| t.as_str()).unwrap_or("none");
    let _ = writeln!(out, "Partition table: {kind}");
    if table.is_empty() {
        let _ = writeln!(out, "  (no partitions)");
    } else {
        let _ = writeln!(
            out,
            "  {:>3}  {:>12}  {:>6}  {:>14}  {:>10}  TYPE",
            "#", "START", "SECTOR", "OFFSET", "SIZE"
        );
        for entry in &table.entries {
            let _ = writeln!(
                out,
                "  {:>3}  {:>12}  {:>6}  {:>14}  {:>10}  {}",
                entry.index,
                entry.start_sector,
                entry.sector_size,
                entry.offset_bytes(),
                format_bytes(entry.size_bytes()),
                entry.type_id
            );
        }
    }

    let _ = writeln!(out, "Logical volumes:");
    if inventory.logical_volumes.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for lv in &inventory.logical_volumes {
        let _ = writeln!(out, "  {}  {}", lv.display_name(), lv.device_path);
    }
    out
}
