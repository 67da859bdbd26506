// SPDX-License-Identifier: GPL-3.0-only

//! Partition / LVM resolution
//!
//! [`Resolver::step`] performs exactly one transition of [`ResolveState`].
//! Host resources acquired along the way (loop device, activated volume
//! groups, mount, mount point directory) are tracked separately from the
//! state so that teardown can release whatever exists, in reverse order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use snapvol_sys::{HostTools, ImageLock, MountRequest, SysError};
use snapvol_types::{FILESYSTEM_CANDIDATES, FilesystemType, LogicalVolume, PartitionTable};

use crate::error::{ResolveError, Result};
use crate::state::{Inventory, MountInUseWarning, MountedFilesystem, ResolveState, TeardownReport};

/// Partition tried when none is requested
pub const DEFAULT_PARTITION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Explicit partition; disables logical volume selection
    pub partition: Option<u32>,
    pub list_only: bool,
    pub mount_point: PathBuf,
    pub read_only: bool,
}

impl ResolveOptions {
    /// Options mounting `image` at `<mount_root>/<image file stem>`
    pub fn new(image: &Path, mount_root: &Path) -> Self {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "image".to_string());
        Self {
            partition: None,
            list_only: false,
            mount_point: mount_root.join(stem),
            read_only: false,
        }
    }
}

/// Outcome of a completed resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Mounted(MountedFilesystem),
    Listed(Inventory),
}

#[derive(Debug, Default)]
struct Held {
    loop_device: Option<String>,
    volume_groups: Vec<String>,
    mounted_at: Option<PathBuf>,
    created_dir: Option<PathBuf>,
}

pub struct Resolver {
    host: Arc<dyn HostTools>,
    image: PathBuf,
    options: ResolveOptions,
    state: ResolveState,
    held: Held,
    warnings: Vec<MountInUseWarning>,
    /// Logical volume that failed to mount before the partition fallback
    lv_attempt: Option<String>,
    _lock: ImageLock,
}

impl Resolver {
    /// Prepare resolution of `image`, taking the image lock.
    pub fn new(host: Arc<dyn HostTools>, image: &Path, options: ResolveOptions) -> Result<Self> {
        if !image.is_file() {
            return Err(ResolveError::ImageNotFound(image.to_path_buf()));
        }
        let lock = ImageLock::acquire(image).map_err(|e| match e {
            SysError::Locked(path) => ResolveError::Locked(path),
            other => ResolveError::Host(other),
        })?;

        Ok(Self {
            host,
            image: image.to_path_buf(),
            options,
            state: ResolveState::Init,
            held: Held::default(),
            warnings: Vec::new(),
            lv_attempt: None,
            _lock: lock,
        })
    }

    pub fn state(&self) -> &ResolveState {
        &self.state
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    pub fn warnings(&self) -> &[MountInUseWarning] {
        &self.warnings
    }

    /// Loop device currently held, if any
    pub fn loop_device(&self) -> Option<&str> {
        self.held.loop_device.as_deref()
    }

    /// Step until the image is mounted or listed.
    pub fn resolve(&mut self) -> Result<Resolution> {
        loop {
            match self.step()? {
                ResolveState::Mounted(mounted) => return Ok(Resolution::Mounted(mounted.clone())),
                ResolveState::Listed(inventory) => return Ok(Resolution::Listed(inventory.clone())),
                state if state.is_terminal() => {
                    return Err(ResolveError::InvalidState {
                        state: state.name(),
                        action: "resolve",
                    });
                }
                _ => {}
            }
        }
    }

    /// Perform one transition.
    ///
    /// On failure after the loop device was attached, held resources are
    /// released before the error is returned.
    pub fn step(&mut self) -> Result<&ResolveState> {
        let current = std::mem::replace(&mut self.state, ResolveState::Init);
        let from = current.name();

        let next = match current {
            ResolveState::Init => self.attach(),
            ResolveState::Attached => self.probe(),
            ResolveState::Probed(table) => Ok(self.discover(table)),
            ResolveState::LvPath { table, volume } => Ok(self.mount_logical_volume(table, &volume)),
            ResolveState::PartitionPath(table) => self.mount_partition(&table),
            state @ (ResolveState::Mounted(_)
            | ResolveState::Unmounting
            | ResolveState::Cleaned
            | ResolveState::Listed(_)
            | ResolveState::Unmountable) => {
                self.state = state;
                return Err(ResolveError::InvalidState {
                    state: from,
                    action: "step",
                });
            }
        };

        match next {
            Ok(state) => {
                debug!(from, to = state.name(), "resolver transition");
                self.state = state;
                if matches!(self.state, ResolveState::Listed(_)) {
                    self.release();
                }
                Ok(&self.state)
            }
            Err(e) => {
                let unmountable = matches!(e, ResolveError::NoMountableFilesystem { .. });
                self.release();
                self.state = if unmountable {
                    ResolveState::Unmountable
                } else if from == "init" {
                    ResolveState::Init
                } else {
                    ResolveState::Cleaned
                };
                Err(e)
            }
        }
    }

    /// Unmount, deactivate volume groups and detach the loop device.
    pub fn teardown(&mut self) -> TeardownReport {
        self.state = ResolveState::Unmounting;
        let report = self.release();
        self.state = ResolveState::Cleaned;
        report
    }

    fn attach(&mut self) -> Result<ResolveState> {
        match self.host.loop_attachments(&self.image) {
            Ok(devices) if !devices.is_empty() => {
                self.warn(MountInUseWarning::ImageAttached { devices });
            }
            Ok(_) => {}
            Err(e) => debug!("could not list existing loop attachments: {e}"),
        }

        let device = self
            .host
            .attach_loop(&self.image)
            .map_err(|e| ResolveError::LoopAttachFailed {
                image: self.image.clone(),
                reason: e.to_string(),
            })?;
        info!(image = %self.image.display(), device = %device, "attached image");
        self.held.loop_device = Some(device);
        Ok(ResolveState::Attached)
    }

    fn probe(&mut self) -> Result<ResolveState> {
        let device = self.device()?;
        let table = self.host.read_partition_table(&device)?;
        info!(
            device = %device,
            table = table.table_type.map_or("none", |t| t.as_str()),
            partitions = table.entries.len(),
            "read partition table"
        );

        if !self.options.list_only {
            return Ok(ResolveState::Probed(table));
        }

        let logical_volumes = self.activate_logical_volumes(&device);
        Ok(ResolveState::Listed(Inventory {
            partitions: table,
            logical_volumes,
        }))
    }

    fn discover(&mut self, table: PartitionTable) -> ResolveState {
        if let Some(index) = self.options.partition {
            debug!(partition = index, "explicit partition requested, skipping LVM");
            return ResolveState::PartitionPath(table);
        }

        let device = match self.device() {
            Ok(device) => device,
            Err(_) => return ResolveState::PartitionPath(table),
        };
        match self.activate_logical_volumes(&device).into_iter().next() {
            Some(volume) => {
                info!(volume = %volume.display_name(), "selected logical volume");
                ResolveState::LvPath { table, volume }
            }
            None => ResolveState::PartitionPath(table),
        }
    }

    fn mount_logical_volume(&mut self, table: PartitionTable, volume: &LogicalVolume) -> ResolveState {
        match self.try_mount(&volume.device_path, 0) {
            Ok(fs_type) => ResolveState::Mounted(MountedFilesystem {
                device: volume.device_path.clone(),
                mount_point: self.options.mount_point.clone(),
                fs_type,
                offset: 0,
                logical_volume: Some(volume.clone()),
                partition: None,
            }),
            Err(tried) => {
                warn!(
                    volume = %volume.display_name(),
                    tried = %tried,
                    "logical volume not mountable, falling back to partitions"
                );
                self.lv_attempt = Some(format!("{} ({tried})", volume.device_path));
                ResolveState::PartitionPath(table)
            }
        }
    }

    fn mount_partition(&mut self, table: &PartitionTable) -> Result<ResolveState> {
        let device = self.device()?;
        let requested = self.options.partition;
        let index = requested.unwrap_or(DEFAULT_PARTITION);

        let (offset, partition) = match table.get(index) {
            Some(entry) => (entry.offset_bytes(), Some(entry.index)),
            None if table.is_empty() && requested.is_none() => {
                info!(device = %device, "no partition table, mounting whole device");
                (0, None)
            }
            None => match self.lv_attempt.take().filter(|_| requested.is_none()) {
                Some(lv) => {
                    return Err(ResolveError::NoMountableFilesystem {
                        image: self.image.clone(),
                        tried: format!("{lv}; no partition {index} to fall back to"),
                    });
                }
                None => return Err(ResolveError::PartitionNotFound(index)),
            },
        };
        debug!(partition = index, offset, "mounting partition");

        match self.try_mount(&device, offset) {
            Ok(fs_type) => Ok(ResolveState::Mounted(MountedFilesystem {
                device,
                mount_point: self.options.mount_point.clone(),
                fs_type,
                offset,
                logical_volume: None,
                partition,
            })),
            Err(tried) => Err(ResolveError::NoMountableFilesystem {
                image: self.image.clone(),
                tried,
            }),
        }
    }

    /// Activate the volume groups living on `device` and list their logical
    /// volumes in name order. Failures degrade to "no logical volumes".
    fn activate_logical_volumes(&mut self, device: &str) -> Vec<LogicalVolume> {
        let pvs = match self.host.scan_physical_volumes() {
            Ok(pvs) => pvs,
            Err(SysError::ToolMissing(tool)) => {
                debug!(tool = %tool, "LVM tools unavailable");
                return Vec::new();
            }
            Err(e) => {
                warn!("physical volume scan failed: {e}");
                return Vec::new();
            }
        };

        let mut volumes = Vec::new();
        for group in snapvol_sys::logical::volume_groups_on_device(&pvs, device) {
            if let Err(e) = self.host.activate_volume_group(&group.name) {
                warn!(vg = %group.name, "failed to activate volume group: {e}");
                continue;
            }
            info!(vg = %group.name, "activated volume group");
            self.held.volume_groups.push(group.name.clone());

            match self.host.list_logical_volumes(&group.name) {
                Ok(lvs) => volumes.extend(lvs),
                Err(e) => warn!(vg = %group.name, "failed to list logical volumes: {e}"),
            }
        }
        volumes.sort();
        volumes
    }

    /// Try every filesystem candidate in order. Returns the type that mounted,
    /// or the comma-separated list of types tried.
    fn try_mount(&mut self, device: &str, offset: u64) -> std::result::Result<FilesystemType, String> {
        let target = self.options.mount_point.clone();
        if let Err(e) = self.ensure_mount_point(&target) {
            return Err(format!("mount point unavailable: {e}"));
        }
        if self.host.is_mounted(&target) {
            self.warn(MountInUseWarning::MountPointBusy(target.clone()));
        }

        let mut tried = Vec::new();
        for fs_type in FILESYSTEM_CANDIDATES {
            let request = MountRequest {
                source: device.to_string(),
                target: target.clone(),
                fs_type,
                offset,
                read_only: self.options.read_only,
            };
            match self.host.mount(&request) {
                Ok(()) => {
                    self.held.mounted_at = Some(target);
                    return Ok(fs_type);
                }
                Err(e) => {
                    debug!(device, fs_type = %fs_type, "mount attempt failed: {e}");
                    tried.push(fs_type.as_str());
                }
            }
        }
        Err(tried.join(", "))
    }

    fn ensure_mount_point(&mut self, target: &Path) -> std::io::Result<()> {
        if target.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(target)?;
        debug!(path = %target.display(), "created mount point");
        if self.held.created_dir.is_none() {
            self.held.created_dir = Some(target.to_path_buf());
        }
        Ok(())
    }

    fn device(&self) -> Result<String> {
        self.held
            .loop_device
            .clone()
            .ok_or(ResolveError::InvalidState {
                state: "init",
                action: "use the loop device",
            })
    }

    fn warn(&mut self, warning: MountInUseWarning) {
        if self.warnings.contains(&warning) {
            return;
        }
        warn!(image = %self.image.display(), "{warning}");
        self.warnings.push(warning);
    }

    /// Release every held resource in reverse acquisition order.
    fn release(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(target) = self.held.mounted_at.take() {
            record(&mut report, format!("unmount {}", target.display()), self.host.unmount(&target));
        }
        while let Some(vg) = self.held.volume_groups.pop() {
            record(
                &mut report,
                format!("deactivate {vg}"),
                self.host.deactivate_volume_group(&vg),
            );
        }
        if let Some(device) = self.held.loop_device.take() {
            record(&mut report, format!("detach {device}"), self.host.detach_loop(&device));
        }
        if let Some(dir) = self.held.created_dir.take() {
            record(
                &mut report,
                format!("remove {}", dir.display()),
                std::fs::remove_dir(&dir).map_err(SysError::from),
            );
        }

        report
    }
}

fn record(report: &mut TeardownReport, action: String, outcome: snapvol_sys::Result<()>) {
    match outcome {
        Ok(()) => {
            debug!("{action}");
            report.completed.push(action);
        }
        Err(e) => {
            warn!("teardown step failed: {action}: {e}");
            report.failures.push(format!("{action}: {e}"));
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let held = &self.held;
        if held.loop_device.is_some() || held.mounted_at.is_some() || !held.volume_groups.is_empty()
        {
            warn!(image = %self.image.display(), "resolver dropped while holding resources");
            self.teardown();
        }
    }
}
