// SPDX-License-Identifier: GPL-3.0-only

//! Disk image reconstruction using positioned file I/O
//!
//! Blocks arrive in any order from concurrent fetch workers. Each block owns a
//! disjoint byte range, so writers only need positioned writes (`pwrite`) on a
//! shared handle; no range locking is involved.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Result, SysError};

/// How the image file is allocated on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Allocation {
    /// Set the logical length only; unwritten ranges stay holes
    #[default]
    Sparse,
    /// Reserve every byte up front
    Full,
}

/// Outcome of a finalized image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub block_size: u32,
    pub blocks_written: u64,
    pub bytes_written: u64,
}

/// Positioned writer placing verified blocks into a pre-sized image file
#[derive(Debug)]
pub struct SparseImageWriter {
    file: File,
    path: PathBuf,
    size_bytes: u64,
    block_size: u32,
    written: Mutex<HashSet<u64>>,
    bytes_written: AtomicU64,
}

impl SparseImageWriter {
    /// Create or truncate `path` to exactly `size_bytes` logical bytes.
    pub fn open(
        path: &Path,
        size_bytes: u64,
        block_size: u32,
        allocation: Allocation,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(SysError::OperationFailed(
                "block size must be greater than zero".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    SysError::PermissionDenied(format!("Cannot open {} for writing", path.display()))
                } else {
                    SysError::Io(e)
                }
            })?;

        file.set_len(size_bytes)?;
        if allocation == Allocation::Full {
            preallocate(&file, size_bytes, path);
        }

        info!(
            path = %path.display(),
            size_bytes,
            block_size,
            ?allocation,
            "Created image file"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size_bytes,
            block_size,
            written: Mutex::new(HashSet::new()),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn blocks_written(&self) -> u64 {
        self.written.lock().map(|set| set.len() as u64).unwrap_or(0)
    }

    /// Write one block at `index * block_size`.
    ///
    /// Safe to call concurrently from several threads. A second write to the
    /// same index is refused.
    pub fn write_block(&self, index: u64, bytes: &[u8]) -> Result<()> {
        let offset = self.check_range(index, bytes.len())?;

        self.claim(index)?;
        if let Err(e) = self.file.write_all_at(bytes, offset) {
            self.release_claim(index);
            return Err(SysError::Io(e));
        }

        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        debug!(index, offset, len = bytes.len(), "Wrote block");
        Ok(())
    }

    /// Flush and sync the image, then check it against the expected block count.
    pub fn finalize(self, expected_blocks: u64) -> Result<ImageSummary> {
        self.file.sync_all()?;

        let logical_len = self.file.metadata()?.len();
        if logical_len != self.size_bytes {
            return Err(SysError::SizeMismatch(format!(
                "{} is {} bytes, expected {}",
                self.path.display(),
                logical_len,
                self.size_bytes
            )));
        }

        let blocks_written = self.blocks_written();
        let bytes_written = self.bytes_written.load(Ordering::Relaxed);

        if blocks_written != expected_blocks {
            return Err(SysError::SizeMismatch(format!(
                "wrote {blocks_written} blocks, source listed {expected_blocks}"
            )));
        }
        if bytes_written > self.size_bytes {
            return Err(SysError::SizeMismatch(format!(
                "wrote {bytes_written} bytes into a {} byte image",
                self.size_bytes
            )));
        }

        let block_size = u64::from(self.block_size);
        let total_blocks = self.size_bytes.div_ceil(block_size);
        if blocks_written == total_blocks && self.size_bytes - bytes_written >= block_size {
            return Err(SysError::SizeMismatch(format!(
                "every block written but only {bytes_written} of {} bytes covered",
                self.size_bytes
            )));
        }

        info!(
            path = %self.path.display(),
            blocks_written,
            bytes_written,
            "Image finalized"
        );

        Ok(ImageSummary {
            path: self.path,
            size_bytes: self.size_bytes,
            block_size: self.block_size,
            blocks_written,
            bytes_written,
        })
    }

    fn check_range(&self, index: u64, len: usize) -> Result<u64> {
        let block_size = u64::from(self.block_size);
        let out_of_range = || SysError::BlockOutOfRange {
            index,
            size_bytes: self.size_bytes,
        };

        let offset = index.checked_mul(block_size).ok_or_else(out_of_range)?;
        let end = offset.checked_add(len as u64).ok_or_else(out_of_range)?;
        if offset >= self.size_bytes || end > self.size_bytes || len as u64 > block_size {
            return Err(out_of_range());
        }

        // Only the block that ends the image may be short.
        if len == 0 || ((len as u64) < block_size && end != self.size_bytes) {
            return Err(SysError::ShortBlock {
                index,
                len,
                block_size: self.block_size,
            });
        }

        Ok(offset)
    }

    fn claim(&self, index: u64) -> Result<()> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| SysError::OperationFailed("written-block set poisoned".to_string()))?;
        if !written.insert(index) {
            return Err(SysError::DuplicateBlock(index));
        }
        Ok(())
    }

    fn release_claim(&self, index: u64) {
        if let Ok(mut written) = self.written.lock() {
            written.remove(&index);
        }
    }
}

fn preallocate(file: &File, size_bytes: u64, path: &Path) {
    let Ok(len) = libc::off_t::try_from(size_bytes) else {
        warn!(path = %path.display(), "Image too large to preallocate; leaving it sparse");
        return;
    };

    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    if rc != 0 {
        warn!(
            path = %path.display(),
            error = %std::io::Error::from_raw_os_error(rc),
            "Full allocation refused; leaving image sparse"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    const BLOCK: u32 = 4096;

    fn block(fill: u8, len: usize) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn open_sets_exact_logical_size_without_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let size = 64 * 1024 * 1024;

        let writer = SparseImageWriter::open(&path, size, BLOCK, Allocation::Sparse).unwrap();
        let metadata = std::fs::metadata(writer.path()).unwrap();

        assert_eq!(metadata.len(), size);
        // st_blocks counts 512-byte units actually allocated
        assert!(metadata.blocks() * 512 < size);
    }

    #[test]
    fn blocks_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let writer =
            SparseImageWriter::open(&path, u64::from(BLOCK) * 4, BLOCK, Allocation::Sparse).unwrap();

        writer.write_block(2, &block(0xAB, BLOCK as usize)).unwrap();
        writer.write_block(0, &block(0x01, BLOCK as usize)).unwrap();
        let summary = writer.finalize(2).unwrap();
        assert_eq!(summary.blocks_written, 2);

        let file = File::open(&path).unwrap();
        let mut buf = vec![0u8; BLOCK as usize];
        file.read_exact_at(&mut buf, u64::from(BLOCK) * 2).unwrap();
        assert!(buf.iter().all(|b| *b == 0xAB));
        file.read_exact_at(&mut buf, u64::from(BLOCK)).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn second_write_to_same_index_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let writer =
            SparseImageWriter::open(&path, u64::from(BLOCK) * 2, BLOCK, Allocation::Sparse).unwrap();

        writer.write_block(1, &block(1, BLOCK as usize)).unwrap();
        let again = writer.write_block(1, &block(2, BLOCK as usize));
        assert!(matches!(again, Err(SysError::DuplicateBlock(1))));
    }

    #[test]
    fn only_the_final_block_may_be_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let size = u64::from(BLOCK) * 2 + 100;
        let writer = SparseImageWriter::open(&path, size, BLOCK, Allocation::Sparse).unwrap();

        assert!(matches!(
            writer.write_block(0, &block(1, 100)),
            Err(SysError::ShortBlock { index: 0, .. })
        ));
        writer.write_block(2, &block(7, 100)).unwrap();
        writer.write_block(0, &block(1, BLOCK as usize)).unwrap();
        writer.write_block(1, &block(1, BLOCK as usize)).unwrap();

        let summary = writer.finalize(3).unwrap();
        assert_eq!(summary.bytes_written, size);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let writer =
            SparseImageWriter::open(&path, u64::from(BLOCK) * 2, BLOCK, Allocation::Sparse).unwrap();

        assert!(matches!(
            writer.write_block(2, &block(1, BLOCK as usize)),
            Err(SysError::BlockOutOfRange { index: 2, .. })
        ));
        assert!(matches!(
            writer.write_block(u64::MAX, &block(1, BLOCK as usize)),
            Err(SysError::BlockOutOfRange { .. })
        ));
    }

    #[test]
    fn finalize_detects_missing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let writer =
            SparseImageWriter::open(&path, u64::from(BLOCK) * 2, BLOCK, Allocation::Sparse).unwrap();
        writer.write_block(0, &block(1, BLOCK as usize)).unwrap();

        assert!(matches!(writer.finalize(2), Err(SysError::SizeMismatch(_))));
    }

    #[test]
    fn concurrent_writers_do_not_corrupt_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let blocks = 64u64;
        let writer = std::sync::Arc::new(
            SparseImageWriter::open(&path, u64::from(BLOCK) * blocks, BLOCK, Allocation::Full)
                .unwrap(),
        );

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for index in (worker..blocks).step_by(8) {
                        writer
                            .write_block(index, &block(index as u8, BLOCK as usize))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let writer = std::sync::Arc::try_unwrap(writer).unwrap();
        writer.finalize(blocks).unwrap();

        let data = std::fs::read(&path).unwrap();
        for (index, chunk) in data.chunks(BLOCK as usize).enumerate() {
            assert!(chunk.iter().all(|b| *b == index as u8), "block {index} corrupted");
        }
    }
}
