// SPDX-License-Identifier: GPL-3.0-only

//! Partition table probing via `sfdisk --json`

use serde::Deserialize;
use tracing::debug;

use snapvol_types::{DEFAULT_SECTOR_SIZE, PartitionEntry, PartitionTable, PartitionTableType};

use crate::cmd::run;
use crate::error::{Result, SysError};

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    type_id: String,
}

/// Read the partition table of `device`.
///
/// A device without a recognizable table yields an empty table rather than an error.
pub fn probe(device: &str) -> Result<PartitionTable> {
    match run("sfdisk", &["--json", device]) {
        Ok(outcome) => parse_sfdisk_json(&outcome.stdout),
        Err(SysError::CommandFailed { stderr, .. })
            if stderr.contains("does not contain a recognized partition table") =>
        {
            debug!(device = %device, "No partition table found");
            Ok(PartitionTable::empty())
        }
        Err(e) => Err(e),
    }
}

pub fn parse_sfdisk_json(json: &str) -> Result<PartitionTable> {
    if json.trim().is_empty() {
        return Ok(PartitionTable::empty());
    }

    let dump: SfdiskDump = serde_json::from_str(json).map_err(|e| SysError::Parse {
        what: "sfdisk output".to_string(),
        reason: e.to_string(),
    })?;

    let table = dump.partitiontable;
    let sector_size = table.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE);
    let entries = table
        .partitions
        .into_iter()
        .enumerate()
        .map(|(position, partition)| PartitionEntry {
            index: partition_number(&partition.node).unwrap_or(position as u32 + 1),
            start_sector: partition.start,
            size_sectors: partition.size,
            sector_size,
            type_id: partition.type_id,
            device: partition.node.starts_with("/dev/").then_some(partition.node),
        })
        .collect();

    Ok(PartitionTable {
        table_type: PartitionTableType::parse(&table.label),
        sector_size,
        entries,
    })
}

/// Trailing partition number of a node such as "/dev/loop0p2" or "disk.img1".
fn partition_number(node: &str) -> Option<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() || digits.len() == node.len() {
        return None;
    }
    digits.parse().ok()
}
