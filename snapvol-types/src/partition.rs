// SPDX-License-Identifier: GPL-3.0-only

//! Partition table records parsed from an attached image

use serde::{Deserialize, Serialize};

use crate::common::DEFAULT_SECTOR_SIZE;

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionTableType {
    /// GPT (GUID Partition Table)
    Gpt,

    /// MBR/DOS (Master Boot Record)
    Mbr,
}

impl PartitionTableType {
    /// Parse from the label reported by sfdisk
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" => Some(Self::Mbr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Mbr => "dos",
        }
    }
}

/// One partition of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Partition number (1-based)
    pub index: u32,

    /// First sector of the partition
    pub start_sector: u64,

    /// Length in sectors
    pub size_sectors: u64,

    /// Logical sector size in bytes
    pub sector_size: u64,

    /// Partition type identifier (GPT GUID or MBR type code)
    pub type_id: String,

    /// Device node of the partition, when the kernel created one
    pub device: Option<String>,
}

impl PartitionEntry {
    /// Byte offset of the partition inside the image
    pub fn offset_bytes(&self) -> u64 {
        self.start_sector * self.sector_size
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_sectors * self.sector_size
    }
}

/// Parsed partition table of an image
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionTable {
    /// Table type, `None` when the image carries no recognizable table
    pub table_type: Option<PartitionTableType>,

    pub sector_size: u64,

    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Table of an image without partitions
    pub fn empty() -> Self {
        Self {
            table_type: None,
            sector_size: DEFAULT_SECTOR_SIZE,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PartitionEntry> {
        self.entries.iter().find(|entry| entry.index == index)
    }
}
