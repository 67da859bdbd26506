// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem mount and unmount through the host's mount facility

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use snapvol_types::FilesystemType;

use crate::cmd::run;
use crate::error::Result;

/// One mount attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Block device to mount (loop device or logical volume)
    pub source: String,

    pub target: PathBuf,

    pub fs_type: FilesystemType,

    /// Byte offset of the filesystem inside `source`
    pub offset: u64,

    pub read_only: bool,
}

impl MountRequest {
    fn options(&self) -> Vec<String> {
        let mut options = Vec::new();
        if self.read_only {
            options.push("ro".to_string());
        }
        if self.offset > 0 {
            options.push("loop".to_string());
            options.push(format!("offset={}", self.offset));
        }
        options
    }

    /// Arguments passed to `mount`
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(fs_type) = self.fs_type.mount_type() {
            args.push(OsString::from("-t"));
            args.push(OsString::from(fs_type));
        }
        let options = self.options();
        if !options.is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(options.join(",")));
        }
        args.push(OsString::from(&self.source));
        args.push(self.target.as_os_str().to_os_string());
        args
    }
}

pub fn mount(request: &MountRequest) -> Result<()> {
    run("mount", &request.args())?;
    info!(
        source = %request.source,
        target = %request.target.display(),
        fs_type = %request.fs_type,
        offset = request.offset,
        "Mounted filesystem"
    );
    Ok(())
}

pub fn unmount(target: &Path) -> Result<()> {
    run("umount", &[target.as_os_str()])?;
    info!(target = %target.display(), "Unmounted filesystem");
    Ok(())
}

/// Check if a path is currently a mount point
pub fn is_mounted(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    let mounted = run("mountpoint", &[OsString::from("-q"), path.as_os_str().to_os_string()]).is_ok();
    debug!(path = %path.display(), mounted, "Checked mount point");
    mounted
}
