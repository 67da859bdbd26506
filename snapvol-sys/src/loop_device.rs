// SPDX-License-Identifier: GPL-3.0-only

//! Loop device attachment via `losetup`

use std::ffi::OsStr;
use std::path::Path;

use tracing::{debug, info};

use crate::cmd::run;
use crate::error::{Result, SysError};

/// Attach `image` to the first free loop device, scanning its partitions.
///
/// Returns the loop device path (e.g., "/dev/loop3").
pub fn attach(image: &Path) -> Result<String> {
    let args = [
        OsStr::new("--find"),
        OsStr::new("--show"),
        OsStr::new("--partscan"),
        image.as_os_str(),
    ];
    let outcome = run("losetup", &args)?;

    let device = outcome.stdout.trim().to_string();
    if !device.starts_with("/dev/") {
        return Err(SysError::Parse {
            what: "losetup output".to_string(),
            reason: format!("unexpected device path {device:?}"),
        });
    }

    info!(image = %image.display(), device = %device, "Attached loop device");
    Ok(device)
}

pub fn detach(device: &str) -> Result<()> {
    run("losetup", &["-d", device])?;
    info!(device = %device, "Detached loop device");
    Ok(())
}

/// Loop devices currently backed by `image`.
pub fn attachments(image: &Path) -> Result<Vec<String>> {
    let outcome = run("losetup", &[OsStr::new("-j"), image.as_os_str()])?;
    let devices = parse_attachments(&outcome.stdout);
    debug!(image = %image.display(), count = devices.len(), "Queried loop attachments");
    Ok(devices)
}

fn parse_attachments(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (device, _) = line.trim().split_once(':')?;
            device.starts_with("/dev/").then(|| device.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_attachments;

    #[test]
    fn parses_losetup_associations() {
        let output = "/dev/loop0: [2049]:131 (/srv/vol.img)\n/dev/loop7: [2049]:131 (/srv/vol.img), offset 1048576\n";
        assert_eq!(parse_attachments(output), vec!["/dev/loop0", "/dev/loop7"]);
        assert!(parse_attachments("").is_empty());
    }
}
