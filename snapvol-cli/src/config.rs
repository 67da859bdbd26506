// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use snapvol_fetch::{DownloadConfig, ReadinessPolicy, RetryPolicy};
use snapvol_types::DEFAULT_BLOCK_SIZE;

pub const CONFIG_ENV: &str = "SNAPVOL_CONFIG";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub download: DownloadSection,
    pub source: SourceSection,
    pub mount: MountSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadSection {
    pub concurrency: usize,
    pub max_retries: u32,
    pub block_size: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub snapshot_timeout_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            concurrency: 16,
            max_retries: 3,
            block_size: DEFAULT_BLOCK_SIZE,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            snapshot_timeout_secs: 3600,
            poll_initial_ms: 2000,
            poll_max_ms: 30_000,
            progress_interval_ms: 2000,
        }
    }
}

impl DownloadSection {
    /// Scheduler settings, with command-line overrides applied
    pub fn download_config(&self, concurrency: Option<usize>, max_retries: Option<u32>) -> DownloadConfig {
        DownloadConfig {
            concurrency: concurrency.unwrap_or(self.concurrency).max(1),
            retry: RetryPolicy {
                max_retries: max_retries.unwrap_or(self.max_retries),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_millis(self.poll_initial_ms),
            max_delay: Duration::from_millis(self.poll_max_ms),
            timeout: Duration::from_secs(self.snapshot_timeout_secs),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(100))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    /// Root directory of the local block store
    pub store: Option<PathBuf>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountSection {
    pub mount_root: PathBuf,
    pub read_only: bool,
    pub shell: Option<PathBuf>,
}

impl Default for MountSection {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/snapvol"),
            read_only: false,
            shell: None,
        }
    }
}

impl MountSection {
    /// Configured shell, else `$SHELL`, else `/bin/sh`
    pub fn shell(&self) -> OsString {
        self.shell
            .as_ref()
            .map(|shell| shell.as_os_str().to_os_string())
            .or_else(|| std::env::var_os("SHELL").filter(|s| !s.is_empty()))
            .unwrap_or_else(|| OsString::from("/bin/sh"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: LoggingLevel,
    pub to_disk: bool,
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid configuration")
    }

    /// Load the configuration file.
    ///
    /// An explicit path (flag or `SNAPVOL_CONFIG`) must exist; the default
    /// location may be absent, in which case defaults apply.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let path = match explicit {
            Some(path) => path,
            None => match default_config_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("in {}", path.display()))
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("snapvol").join("config.toml"));
    }
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("snapvol")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.download.concurrency, 16);
        assert_eq!(config.download.block_size, 512 * 1024);
        assert_eq!(config.mount.mount_root, PathBuf::from("/mnt/snapvol"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [download]
            concurrency = 4
            max_retries = 5

            [source]
            store = "/srv/volumes"
            region = "eu-west-1"

            [log]
            level = "debug"
            to_disk = true
            "#,
        )
        .unwrap();

        assert_eq!(config.download.concurrency, 4);
        assert_eq!(config.download.poll_initial_ms, 2000);
        assert_eq!(config.source.store, Some(PathBuf::from("/srv/volumes")));
        assert_eq!(config.log.level, LoggingLevel::Debug);
        assert!(config.log.to_disk);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("[download]\nthreads = 3\n").is_err());
    }

    #[test]
    fn flags_override_scheduler_settings() {
        let section = DownloadSection::default();
        let config = section.download_config(Some(0), Some(7));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(200));

        let readiness = section.readiness_policy();
        assert_eq!(readiness.timeout, Duration::from_secs(3600));
        assert_eq!(readiness.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Config::load(Some(dir.path().join("missing.toml").as_path())).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "[mount]\nread_only = true\n").unwrap();
        assert!(Config::load(Some(path.as_path())).unwrap().mount.read_only);
    }
}
