// SPDX-License-Identifier: GPL-3.0-only

//! Host operation seam used by the mount resolver

use std::path::Path;

use snapvol_types::{LogicalVolume, PartitionTable, PhysicalVolume};

use crate::error::{Result, SysError};
use crate::mount::MountRequest;
use crate::{logical, loop_device, mount, partition};

/// Every host operation the mount resolver performs.
///
/// `SystemHost` runs the real tools; tests substitute a scripted host.
pub trait HostTools: Send + Sync {
    fn attach_loop(&self, image: &Path) -> Result<String>;

    fn detach_loop(&self, device: &str) -> Result<()>;

    /// Loop devices already backed by `image`
    fn loop_attachments(&self, image: &Path) -> Result<Vec<String>>;

    fn read_partition_table(&self, device: &str) -> Result<PartitionTable>;

    fn scan_physical_volumes(&self) -> Result<Vec<PhysicalVolume>>;

    fn activate_volume_group(&self, vg_name: &str) -> Result<()>;

    fn deactivate_volume_group(&self, vg_name: &str) -> Result<()>;

    fn list_logical_volumes(&self, vg_name: &str) -> Result<Vec<LogicalVolume>>;

    fn mount(&self, request: &MountRequest) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    fn is_mounted(&self, path: &Path) -> bool;
}

/// Host tools backed by util-linux and LVM binaries
#[derive(Debug, Clone, Default)]
pub struct SystemHost;

impl SystemHost {
    /// Create a host, failing when a mandatory tool is not installed
    pub fn new() -> Result<Self> {
        for tool in ["losetup", "sfdisk", "mount", "umount"] {
            which::which(tool).map_err(|_| SysError::ToolMissing(tool.to_string()))?;
        }
        Ok(Self)
    }
}

impl HostTools for SystemHost {
    fn attach_loop(&self, image: &Path) -> Result<String> {
        loop_device::attach(image)
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        loop_device::detach(device)
    }

    fn loop_attachments(&self, image: &Path) -> Result<Vec<String>> {
        loop_device::attachments(image)
    }

    fn read_partition_table(&self, device: &str) -> Result<PartitionTable> {
        partition::probe(device)
    }

    fn scan_physical_volumes(&self) -> Result<Vec<PhysicalVolume>> {
        logical::lvm_tools::scan_physical_volumes()
    }

    fn activate_volume_group(&self, vg_name: &str) -> Result<()> {
        logical::lvm_tools::activate_volume_group(vg_name)
    }

    fn deactivate_volume_group(&self, vg_name: &str) -> Result<()> {
        logical::lvm_tools::deactivate_volume_group(vg_name)
    }

    fn list_logical_volumes(&self, vg_name: &str) -> Result<Vec<LogicalVolume>> {
        logical::lvm_tools::list_logical_volumes(vg_name)
    }

    fn mount(&self, request: &MountRequest) -> Result<()> {
        mount::mount(request)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        mount::unmount(target)
    }

    fn is_mounted(&self, path: &Path) -> bool {
        mount::is_mounted(path)
    }
}
