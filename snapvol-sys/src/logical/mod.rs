// SPDX-License-Identifier: GPL-3.0-only

pub mod lvm_tools;

use std::collections::BTreeMap;

use snapvol_types::{PhysicalVolume, VolumeGroup};

/// Group the physical volumes living on `loop_device` into volume groups.
///
/// Groups are returned in name order; unassigned PVs are ignored.
pub fn volume_groups_on_device(pvs: &[PhysicalVolume], loop_device: &str) -> Vec<VolumeGroup> {
    let mut groups = BTreeMap::<String, Vec<String>>::new();
    for pv in pvs.iter().filter(|pv| pv.is_on_device(loop_device)) {
        if let Some(vg_name) = &pv.vg_name {
            groups
                .entry(vg_name.clone())
                .or_default()
                .push(pv.device.clone());
        }
    }

    groups
        .into_iter()
        .map(|(name, physical_volumes)| VolumeGroup {
            name,
            physical_volumes,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv(device: &str, vg: Option<&str>) -> PhysicalVolume {
        PhysicalVolume {
            device: device.to_string(),
            vg_name: vg.map(str::to_string),
        }
    }

    #[test]
    fn only_groups_on_the_attached_device_are_returned() {
        let pvs = vec![
            pv("/dev/sda2", Some("host_vg")),
            pv("/dev/loop4p2", Some("vg_data")),
            pv("/dev/loop4p3", Some("vg_data")),
            pv("/dev/loop4p1", Some("vg_boot")),
            pv("/dev/loop4p5", None),
        ];

        let groups = volume_groups_on_device(&pvs, "/dev/loop4");
        let names: Vec<&str> = groups.iter().map(|vg| vg.name.as_str()).collect();
        assert_eq!(names, vec!["vg_boot", "vg_data"]);
        assert_eq!(groups[1].physical_volumes.len(), 2);
    }
}
