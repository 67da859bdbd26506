// SPDX-License-Identifier: GPL-3.0-only

//! Thin wrapper around `std::process::Command` for host tools

use std::ffi::OsStr;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, SysError};

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
}

pub fn render<S: AsRef<OsStr>>(command: &str, args: &[S]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.as_ref().to_string_lossy().into_owned())
            .collect();
        format!("{} {}", command, args.join(" "))
    }
}

/// Run a command to completion; a non-zero exit status is an error carrying stderr.
pub fn run<S: AsRef<OsStr>>(command: &str, args: &[S]) -> Result<CommandOutcome> {
    let rendered = render(command, args);
    debug!(command = %rendered, "running host command");

    let output = Command::new(command).args(args).output().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            SysError::ToolMissing(command.to_string())
        } else {
            SysError::CommandFailed {
                command: rendered.clone(),
                stderr: error.to_string(),
            }
        }
    })?;

    if !output.status.success() {
        return Err(SysError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(CommandOutcome {
        command: rendered,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_context() {
        let args = ["--find", "--show", "--partscan", "disk.img"];
        let rendered = render("losetup", &args);
        assert_eq!(rendered, "losetup --find --show --partscan disk.img");
    }

    #[test]
    fn missing_binary_is_reported_as_missing_tool() {
        let result = run("snapvol-definitely-not-a-binary", &["--help"]);
        assert!(matches!(result, Err(SysError::ToolMissing(_))));
    }

    #[test]
    fn failing_command_carries_stderr() {
        let result = run("sh", &["-c", "echo boom >&2; exit 3"]);
        match result {
            Err(SysError::CommandFailed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
