// SPDX-License-Identifier: GPL-3.0-only

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snapvol_fetch::{
    DownloadReport, DownloadRequest, ForceInUse, InUseGate, LocalStore, VolumeDownload,
};
use snapvol_sys::Allocation;
use snapvol_types::format_bytes;

use crate::cli::DownloadArgs;
use crate::config::Config;
use crate::prompt::PromptInUse;
use crate::reporter;

/// Asks before replacing an existing image. Runs before any signal handler is
/// installed so Ctrl-C at the question ends the process right away.
pub fn keeps_existing_output(args: &DownloadArgs, ask: impl FnOnce(&str) -> bool) -> bool {
    if !args.output.exists() || args.overwrite {
        return false;
    }
    let overwrite = ask(&format!(
        "File {} already exists. Overwrite?",
        args.output.display()
    ));
    if !overwrite {
        info!(output = %args.output.display(), "keeping existing file, nothing downloaded");
    }
    !overwrite
}

pub async fn run(
    args: DownloadArgs,
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    let store_dir = args
        .store
        .clone()
        .or_else(|| config.source.store.clone())
        .context("no block store configured; pass --store or set [source] store")?;
    let region = args.region.clone().or_else(|| config.source.region.clone());
    let store = Arc::new(
        LocalStore::new(store_dir)
            .with_block_size(config.download.block_size)
            .with_region(region),
    );

    let request = build_request(&args, config);
    let gate: Box<dyn InUseGate> = if args.force {
        Box::new(ForceInUse)
    } else {
        Box::new(PromptInUse)
    };

    let download = VolumeDownload::new(store.clone(), store);
    let stop = CancellationToken::new();
    let reporter = reporter::spawn(
        download.progress(),
        config.download.progress_interval(),
        stop.clone(),
    );

    info!(
        volume = %request.volume_id,
        output = %request.output.display(),
        concurrency = request.download.concurrency,
        "starting download"
    );
    let result = download.run(&request, gate.as_ref(), &cancel).await;

    stop.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "progress reporter ended abnormally");
    }

    let report = result.with_context(|| format!("failed to download volume {}", args.volume_id))?;
    summarize(&report);
    Ok(ExitCode::SUCCESS)
}

fn build_request(args: &DownloadArgs, config: &Config) -> DownloadRequest {
    let mut request = DownloadRequest::new(&args.volume_id, &args.output);
    request.snapshot_id = args.snapshot_id.clone();
    request.block_size = config.download.block_size;
    request.allocation = if args.full_allocation {
        Allocation::Full
    } else {
        Allocation::Sparse
    };
    request.download = config
        .download
        .download_config(args.concurrency, args.max_retries);
    request.readiness = config.download.readiness_policy();
    request
}

fn summarize(report: &DownloadReport) {
    if report.captured_while_in_use {
        warn!(
            volume = %report.volume.id,
            "snapshot was taken while the volume was attached; the image may be inconsistent"
        );
    }
    if report.stats.duplicates_skipped > 0 {
        warn!(
            duplicates = report.stats.duplicates_skipped,
            "the listing repeated some blocks; they were written once"
        );
    }
    info!(
        volume = %report.volume.id,
        snapshot = %report.snapshot_id,
        image = %report.image.path.display(),
        size = %format_bytes(report.image.size_bytes),
        written = %format_bytes(report.image.bytes_written),
        blocks = report.image.blocks_written,
        retries = report.stats.retries,
        "download complete"
    );
    if let Some(path) = &report.metadata_path {
        info!(metadata = %path.display(), "wrote image metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use snapvol_fetch::VolumeRecord;
    use snapvol_types::VolumeState;

    use crate::cli::{Cli, Command};

    fn parse(argv: &[&str]) -> DownloadArgs {
        match Cli::parse_from(argv).command {
            Command::Download(args) => args,
            Command::Mount(_) => panic!("expected download"),
        }
    }

    #[test]
    fn request_carries_flags_and_config() {
        let args = parse(&[
            "snapvol",
            "download",
            "vol-1",
            "-o",
            "/tmp/out.img",
            "--snapshot-id",
            "snap-1",
            "--max-retries",
            "9",
            "--full-allocation",
        ]);
        let mut config = Config::default();
        config.download.concurrency = 3;

        let request = build_request(&args, &config);
        assert_eq!(request.volume_id, "vol-1");
        assert_eq!(request.snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(request.download.concurrency, 3);
        assert_eq!(request.download.retry.max_retries, 9);
        assert_eq!(request.allocation, Allocation::Full);
    }

    #[test]
    fn existing_output_is_kept_unless_confirmed() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("out.img");
        let path = output.to_str().unwrap();

        let fresh = parse(&["snapvol", "download", "vol-1", "-o", path]);
        assert!(!keeps_existing_output(&fresh, |_| panic!("nothing to overwrite")));

        std::fs::write(&output, b"old").unwrap();
        let existing = parse(&["snapvol", "download", "vol-1", "-o", path]);
        assert!(keeps_existing_output(&existing, |_| false));
        assert!(!keeps_existing_output(&existing, |question| {
            assert!(question.contains("already exists"));
            true
        }));

        let forced = parse(&["snapvol", "download", "vol-1", "-o", path, "--overwrite"]);
        assert!(!keeps_existing_output(&forced, |_| panic!("--overwrite skips the question")));
    }

    #[tokio::test]
    async fn missing_store_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("out.img");
        let args = parse(&[
            "snapvol",
            "download",
            "vol-1",
            "-o",
            output.to_str().unwrap(),
            "--force",
        ]);
        let err = run(args, &Config::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("no block store configured"));
    }

    #[tokio::test]
    async fn downloads_from_local_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        let source = dir.path().join("source.img");
        let mut content = vec![0u8; 4 * 4096];
        content[4096..8192].fill(0x5a);
        std::fs::write(&source, &content).unwrap();

        LocalStore::new(&store_dir)
            .with_block_size(4096)
            .import_volume(
                "vol-1",
                &VolumeRecord {
                    name: None,
                    state: VolumeState::Available,
                    attached_instance: None,
                },
                &source,
            )
            .await
            .unwrap();

        let output = dir.path().join("out.img");
        let mut config = Config::default();
        config.download.block_size = 4096;
        config.source.store = Some(store_dir);
        config.download.poll_initial_ms = 1;

        let args = parse(&[
            "snapvol",
            "download",
            "vol-1",
            "-o",
            output.to_str().unwrap(),
            "--force",
        ]);
        run(args, &config, CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), content);
    }
}
