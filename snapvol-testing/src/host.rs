// SPDX-License-Identifier: GPL-3.0-only

//! Scripted host for exercising the mount resolver without root

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use snapvol_sys::{HostTools, MountRequest, Result, SysError};
use snapvol_types::{FilesystemType, LogicalVolume, PartitionTable, PhysicalVolume};

/// One call made against the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    AttachLoop(PathBuf),
    DetachLoop(String),
    LoopAttachments(PathBuf),
    ReadPartitionTable(String),
    ScanPhysicalVolumes,
    ActivateVolumeGroup(String),
    DeactivateVolumeGroup(String),
    ListLogicalVolumes(String),
    Mount(MountRequest),
    Unmount(PathBuf),
}

/// A filesystem the fake host agrees to mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountable {
    pub source: String,
    pub offset: u64,
    pub fs_type: FilesystemType,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<HostCall>,
    attached: Option<String>,
    active_groups: BTreeSet<String>,
    mounted: BTreeSet<PathBuf>,
}

pub struct FakeHost {
    loop_device: String,
    attach_fails: bool,
    other_attachments: Vec<String>,
    table: PartitionTable,
    physical_volumes: Option<Vec<PhysicalVolume>>,
    logical_volumes: HashMap<String, Vec<LogicalVolume>>,
    mountable: Vec<Mountable>,
    premounted: Vec<PathBuf>,
    unmount_fails: bool,
    deactivate_fails: bool,
    state: Mutex<State>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            loop_device: "/dev/loop7".to_string(),
            attach_fails: false,
            other_attachments: Vec::new(),
            table: PartitionTable::empty(),
            physical_volumes: Some(Vec::new()),
            logical_volumes: HashMap::new(),
            mountable: Vec::new(),
            premounted: Vec::new(),
            unmount_fails: false,
            deactivate_fails: false,
            state: Mutex::new(State::default()),
        }
    }

    pub fn loop_device(&self) -> &str {
        &self.loop_device
    }

    pub fn with_partition_table(mut self, table: PartitionTable) -> Self {
        self.table = table;
        self
    }

    /// A volume group on partition `partition` of the loop device holding `lvs`.
    pub fn with_volume_group(mut self, vg: &str, partition: u32, lvs: &[&str]) -> Self {
        let device = format!("{}p{partition}", self.loop_device);
        self.physical_volumes
            .get_or_insert_with(Vec::new)
            .push(PhysicalVolume {
                device,
                vg_name: Some(vg.to_string()),
            });
        self.logical_volumes.insert(
            vg.to_string(),
            lvs.iter()
                .map(|lv| LogicalVolume {
                    vg_name: vg.to_string(),
                    name: lv.to_string(),
                    device_path: format!("/dev/{vg}/{lv}"),
                })
                .collect(),
        );
        self
    }

    /// A physical volume that belongs to some other disk of the host.
    pub fn with_foreign_physical_volume(mut self, device: &str, vg: &str) -> Self {
        self.physical_volumes
            .get_or_insert_with(Vec::new)
            .push(PhysicalVolume {
                device: device.to_string(),
                vg_name: Some(vg.to_string()),
            });
        self
    }

    pub fn without_lvm_tools(mut self) -> Self {
        self.physical_volumes = None;
        self
    }

    pub fn with_mountable(mut self, source: &str, offset: u64, fs_type: FilesystemType) -> Self {
        self.mountable.push(Mountable {
            source: source.to_string(),
            offset,
            fs_type,
        });
        self
    }

    pub fn with_attach_failure(mut self) -> Self {
        self.attach_fails = true;
        self
    }

    pub fn with_other_attachment(mut self, device: &str) -> Self {
        self.other_attachments.push(device.to_string());
        self
    }

    pub fn with_premounted(mut self, path: &Path) -> Self {
        self.premounted.push(path.to_path_buf());
        self
    }

    pub fn with_unmount_failure(mut self) -> Self {
        self.unmount_fails = true;
        self
    }

    pub fn with_deactivate_failure(mut self) -> Self {
        self.deactivate_fails = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: HostCall) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    pub fn mount_calls(&self) -> Vec<MountRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Mount(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached.is_some()
    }

    pub fn active_groups(&self) -> Vec<String> {
        self.lock().active_groups.iter().cloned().collect()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.lock().mounted.iter().cloned().collect()
    }

    /// True when nothing acquired through this host is still held
    pub fn is_clean(&self) -> bool {
        let state = self.lock();
        state.attached.is_none() && state.active_groups.is_empty() && state.mounted.is_empty()
    }
}

fn failed(command: &str, stderr: &str) -> SysError {
    SysError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.to_string(),
    }
}

impl HostTools for FakeHost {
    fn attach_loop(&self, image: &Path) -> Result<String> {
        self.record(HostCall::AttachLoop(image.to_path_buf()));
        if self.attach_fails {
            return Err(failed("losetup", "failed to set up loop device"));
        }
        self.lock().attached = Some(self.loop_device.clone());
        Ok(self.loop_device.clone())
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        self.record(HostCall::DetachLoop(device.to_string()));
        let mut state = self.lock();
        if state.attached.as_deref() != Some(device) {
            return Err(SysError::DeviceNotFound(device.to_string()));
        }
        state.attached = None;
        Ok(())
    }

    fn loop_attachments(&self, image: &Path) -> Result<Vec<String>> {
        self.record(HostCall::LoopAttachments(image.to_path_buf()));
        Ok(self.other_attachments.clone())
    }

    fn read_partition_table(&self, device: &str) -> Result<PartitionTable> {
        self.record(HostCall::ReadPartitionTable(device.to_string()));
        Ok(self.table.clone())
    }

    fn scan_physical_volumes(&self) -> Result<Vec<PhysicalVolume>> {
        self.record(HostCall::ScanPhysicalVolumes);
        self.physical_volumes
            .clone()
            .ok_or_else(|| SysError::ToolMissing("pvs".to_string()))
    }

    fn activate_volume_group(&self, vg_name: &str) -> Result<()> {
        self.record(HostCall::ActivateVolumeGroup(vg_name.to_string()));
        self.lock().active_groups.insert(vg_name.to_string());
        Ok(())
    }

    fn deactivate_volume_group(&self, vg_name: &str) -> Result<()> {
        self.record(HostCall::DeactivateVolumeGroup(vg_name.to_string()));
        if self.deactivate_fails {
            return Err(failed("vgchange", "logical volume in use"));
        }
        self.lock().active_groups.remove(vg_name);
        Ok(())
    }

    fn list_logical_volumes(&self, vg_name: &str) -> Result<Vec<LogicalVolume>> {
        self.record(HostCall::ListLogicalVolumes(vg_name.to_string()));
        if !self.lock().active_groups.contains(vg_name) {
            return Ok(Vec::new());
        }
        Ok(self.logical_volumes.get(vg_name).cloned().unwrap_or_default())
    }

    fn mount(&self, request: &MountRequest) -> Result<()> {
        self.record(HostCall::Mount(request.clone()));
        let accepted = self.mountable.iter().any(|m| {
            m.source == request.source
                && m.offset == request.offset
                && (m.fs_type == request.fs_type || request.fs_type == FilesystemType::Auto)
        });
        if !accepted {
            return Err(failed("mount", "wrong fs type, bad option, bad superblock"));
        }
        self.lock().mounted.insert(request.target.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(HostCall::Unmount(target.to_path_buf()));
        if self.unmount_fails {
            return Err(failed("umount", "target is busy"));
        }
        if !self.lock().mounted.remove(target) {
            return Err(failed("umount", "not mounted"));
        }
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> bool {
        self.premounted.iter().any(|p| p == path) || self.lock().mounted.contains(path)
    }
}
