// SPDX-License-Identifier: GPL-3.0-only

//! Mount session: run a command against a mounted image, then tear down.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ResolveError, Result};
use crate::resolver::Resolver;
use crate::state::{MountedFilesystem, ResolveState, TeardownReport};

/// Environment variable carrying the mount point to the session command
pub const MOUNT_ENV: &str = "SNAPVOL_MOUNT";

/// What the session runs inside the mount point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl SessionCommand {
    /// `argv[0]` with its arguments, or `shell` when `argv` is empty
    pub fn from_argv(argv: &[OsString], shell: &OsString) -> Self {
        match argv.split_first() {
            Some((program, args)) => Self {
                program: program.clone(),
                args: args.to_vec(),
            },
            None => Self {
                program: shell.clone(),
                args: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The command exited on its own
    Exited(ExitStatus),
    /// Cancellation killed the command
    Cancelled,
}

impl SessionEnd {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

/// Owns a mounted resolver until teardown
pub struct MountSession {
    resolver: Resolver,
    mounted: MountedFilesystem,
    closed: bool,
}

impl MountSession {
    /// Take over a resolver whose filesystem is mounted.
    pub fn new(resolver: Resolver) -> Result<Self> {
        let mounted = match resolver.state() {
            ResolveState::Mounted(mounted) => mounted.clone(),
            other => {
                return Err(ResolveError::InvalidState {
                    state: other.name(),
                    action: "open a session",
                });
            }
        };
        Ok(Self {
            resolver,
            mounted,
            closed: false,
        })
    }

    pub fn mounted(&self) -> &MountedFilesystem {
        &self.mounted
    }

    /// Run `command` in the mount point with inherited stdio until it exits or
    /// `cancel` fires, in which case the command is killed.
    pub async fn run(
        &mut self,
        command: &SessionCommand,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let program = command.program.to_string_lossy().into_owned();
        info!(
            program = %program,
            mount_point = %self.mounted.mount_point.display(),
            "starting session"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.mounted.mount_point)
            .env(MOUNT_ENV, &self.mounted.mount_point)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ResolveError::Spawn {
                program: program.clone(),
                source,
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| ResolveError::Spawn { program, source })?;
                info!(%status, "session command exited");
                Ok(SessionEnd::Exited(status))
            }
            _ = cancel.cancelled() => {
                warn!("session cancelled, stopping command");
                if let Err(e) = child.kill().await {
                    warn!("failed to kill session command: {e}");
                }
                Ok(SessionEnd::Cancelled)
            }
        }
    }

    /// Unmount and release the image.
    pub fn close(mut self) -> TeardownReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> TeardownReport {
        self.closed = true;
        let report = self.resolver.teardown();
        if report.is_clean() {
            info!(image = %self.resolver.image().display(), "session torn down");
        } else {
            warn!(
                failures = report.failures.len(),
                "session teardown incomplete"
            );
        }
        report
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown();
        }
    }
}
