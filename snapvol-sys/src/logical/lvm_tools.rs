// SPDX-License-Identifier: GPL-3.0-only

//! LVM discovery and activation through the LVM command-line tools

use tracing::{debug, info};

use snapvol_types::{LogicalVolume, PhysicalVolume};

use crate::cmd::run;
use crate::Result;

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

pub fn parse_pvs(output: &str) -> Vec<PhysicalVolume> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            let device = cols.first()?.clone();
            if device.is_empty() {
                return None;
            }
            let vg_name = cols.get(1).filter(|vg| !vg.is_empty()).cloned();

            Some(PhysicalVolume { device, vg_name })
        })
        .collect()
}

pub fn parse_lvs(output: &str) -> Vec<LogicalVolume> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 3 {
                return None;
            }

            Some(LogicalVolume {
                vg_name: cols[0].clone(),
                name: cols[1].clone(),
                device_path: cols[2].clone(),
            })
        })
        .collect()
}

fn lvm_available() -> bool {
    cfg!(feature = "lvm-tools")
        && which::which("pvs").is_ok()
        && which::which("lvs").is_ok()
        && which::which("vgchange").is_ok()
}

/// Rescan block devices and list every physical volume the host can see.
pub fn scan_physical_volumes() -> Result<Vec<PhysicalVolume>> {
    if !lvm_available() {
        debug!("LVM tools unavailable; skipping physical volume scan");
        return Ok(Vec::new());
    }

    // Refresh the LVM device cache so freshly attached loop partitions are seen.
    run("pvscan", &["--cache"])?;

    let output = run(
        "pvs",
        &[
            "--noheadings",
            "-o",
            "pv_name,vg_name",
            "--separator",
            "\t",
        ],
    )?;
    Ok(parse_pvs(&output.stdout))
}

pub fn activate_volume_group(vg_name: &str) -> Result<()> {
    run("vgchange", &["-ay", vg_name])?;
    info!(vg = %vg_name, "Activated volume group");
    Ok(())
}

pub fn deactivate_volume_group(vg_name: &str) -> Result<()> {
    run("vgchange", &["-an", vg_name])?;
    info!(vg = %vg_name, "Deactivated volume group");
    Ok(())
}

pub fn list_logical_volumes(vg_name: &str) -> Result<Vec<LogicalVolume>> {
    let output = run(
        "lvs",
        &[
            "--noheadings",
            "-o",
            "vg_name,lv_name,lv_path",
            "--separator",
            "\t",
            vg_name,
        ],
    )?;
    Ok(parse_lvs(&output.stdout))
}
