// SPDX-License-Identifier: GPL-3.0-only

//! Common constants and formatting helpers shared across models

/// Nominal snapshot block size (512 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 512 * 1024;

/// Sector size assumed when a partition table does not advertise one
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Maximum number of block descriptors requested per listing page
pub const LIST_PAGE_SIZE: usize = 1000;

/// Convert bytes to a binary-unit string (e.g., "1.5 GiB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut unit_index = 0;
    let mut value = bytes as f64;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{value:.1} {}", UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::format_bytes;

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(512 * 1024), "512.0 KiB");
        assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8.0 GiB");
    }
}
