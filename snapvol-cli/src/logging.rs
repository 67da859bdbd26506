// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogSection, LoggingLevel};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_LOG_PREFIX: &str = "snapvol.log";
const KEEP_DAYS: u64 = 7;

/// Crates whose events follow the configured level; everything else stays at `warn`.
const OWN_CRATES: [&str; 6] = [
    "snapvol",
    "snapvol_types",
    "snapvol_sys",
    "snapvol_fetch",
    "snapvol_mount",
    "snapvol_cli",
];

pub fn init(config: &LogSection, verbose: bool) {
    let level = if verbose {
        LoggingLevel::Debug
    } else {
        config.level
    };

    // RUST_LOG wins when set and valid.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    // Progress and diagnostics go to stderr so stdout stays usable for listings.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    if !config.to_disk {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return;
    }

    match file_writer(config.dir.as_deref()) {
        Ok((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_timer(tracing_subscriber::fmt::time::SystemTime)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            // Flushes buffered lines at exit.
            let _ = LOG_GUARD.set(guard);
        }
        Err(e) => {
            eprintln!("snapvol: failed to initialize file logging: {e:#}");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
        }
    }
}

fn default_filter(level: LoggingLevel) -> EnvFilter {
    let mut filter = EnvFilter::new("warn");
    for krate in OWN_CRATES {
        match format!("{krate}={}", level.as_directive()).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("snapvol: ignoring log directive for {krate}: {e}"),
        }
    }
    filter
}

fn file_writer(
    configured: Option<&Path>,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = resolve_log_dir(configured);
    let prefix = OsString::from(DEFAULT_LOG_PREFIX);

    if let Err(e) = fs::create_dir_all(&dir) {
        return Err(anyhow::anyhow!(
            "create log directory failed: {} ({})",
            dir.display(),
            e
        ));
    }

    cleanup_old_logs(&dir, &prefix);

    let appender = tracing_appender::rolling::daily(&dir, &prefix);
    Ok(tracing_appender::non_blocking(appender))
}

fn resolve_log_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = std::env::var_os("SNAPVOL_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    default_log_dir()
}

fn default_log_dir() -> PathBuf {
    if let Some(xdg_state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(xdg_state).join("snapvol").join("logs");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("snapvol")
            .join("logs");
    }

    PathBuf::from("/tmp").join("snapvol").join("logs")
}

fn cleanup_old_logs(dir: &Path, prefix: &OsString) {
    let cutoff = SystemTime::now().checked_sub(Duration::from_secs(KEEP_DAYS * 24 * 60 * 60));
    let Some(cutoff) = cutoff else { return };

    let prefix = prefix.to_string_lossy();

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        // Only files produced by the rolling appender.
        if !entry.file_name().to_string_lossy().starts_with(prefix.as_ref()) {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff {
            let _ = fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let ours = dir.path().join("snapvol.log.2026-10-17");
        let foreign = dir.path().join("other.log");
        fs::write(&ours, "recent").unwrap();
        fs::write(&foreign, "untouched").unwrap();

        cleanup_old_logs(dir.path(), &OsString::from(DEFAULT_LOG_PREFIX));

        assert!(ours.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn configured_dir_is_used_without_override() {
        if std::env::var_os("SNAPVOL_LOG_DIR").is_some() {
            return;
        }
        let dir = PathBuf::from("/var/log/snapvol");
        assert_eq!(resolve_log_dir(Some(dir.as_path())), dir);
    }

    #[test]
    fn default_filter_accepts_every_level() {
        for level in [
            LoggingLevel::Error,
            LoggingLevel::Warn,
            LoggingLevel::Info,
            LoggingLevel::Debug,
            LoggingLevel::Trace,
        ] {
            let rendered = default_filter(level).to_string();
            assert!(rendered.contains(&format!("snapvol_fetch={}", level.as_directive())));
        }
    }
}
