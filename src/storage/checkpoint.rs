//! Incremental point-in-time copy ("dump") of the objects file.
//!
//! Starting a checkpoint snapshots the block bitmap as the set of blocks still
//! to copy. Two things drain that set:
//!
//! - [`Checkpoint::step`], called repeatedly by whoever drives the dump, copies
//!   a bounded number of pending blocks per call
//! - [`Checkpoint::preserve`], called by the file store before it frees or
//!   overwrites a range, copies any pending block in that range first
//!
//! Every block copied therefore holds the contents it had when the checkpoint
//! started, even though the live file keeps changing.

use crate::storage::bitmap::{BlockBitmap, BLOCK_SIZE};
use crate::storage::disk::BlockFile;
use crate::storage::error::{StoreError, StoreResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    InProgress,
    Finished,
    NotRunning,
}

pub struct Checkpoint {
    out: BlockFile,
    pending: BlockBitmap,
    cursor: usize,
    copied: usize,
}

impl Checkpoint {
    pub fn begin(path: &Path, snapshot: BlockBitmap) -> StoreResult<Self> {
        let out = BlockFile::create(path).map_err(|e| match e {
            StoreError::Io(source) => StoreError::CheckpointOpen {
                path: PathBuf::from(path),
                source,
            },
            other => other,
        })?;
        log::info!(
            "checkpoint to {:?} started: {} blocks to copy",
            path,
            snapshot.allocated_count()
        );

        Ok(Self {
            out,
            pending: snapshot,
            cursor: 0,
            copied: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.out.path()
    }

    pub fn blocks_copied(&self) -> usize {
        self.copied
    }

    pub fn is_pending(&self, block: usize) -> bool {
        self.pending.is_set(block)
    }

    /// Copy any still-pending block in `start..start + count` before the
    /// caller changes it.
    pub fn preserve(&mut self, source: &mut BlockFile, start: usize, count: usize) -> StoreResult<()> {
        for block in start..start + count {
            if self.pending.is_set(block) {
                self.copy_block(source, block)?;
            }
        }
        Ok(())
    }

    /// Copy up to `max_blocks` pending blocks. Returns `Finished` once the
    /// cursor has passed the end of the snapshot; the output is synced then.
    pub fn step(&mut self, source: &mut BlockFile, max_blocks: usize) -> StoreResult<CheckpointStatus> {
        let mut budget = max_blocks;
        while budget > 0 {
            match self.pending.next_set(self.cursor) {
                Some(block) => {
                    self.copy_block(source, block)?;
                    self.cursor = block + 1;
                    budget -= 1;
                }
                None => {
                    self.cursor = self.pending.len();
                    break;
                }
            }
        }

        if self.pending.next_set(self.cursor).is_none() {
            self.out.sync()?;
            log::info!(
                "checkpoint to {:?} finished: {} blocks copied",
                self.out.path(),
                self.copied
            );
            return Ok(CheckpointStatus::Finished);
        }
        Ok(CheckpointStatus::InProgress)
    }

    fn copy_block(&mut self, source: &mut BlockFile, block: usize) -> StoreResult<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        source.read_block(block, &mut buf)?;
        self.out.write_block(block, &buf)?;
        self.pending.clear(block);
        self.copied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn filled(byte: u8) -> [u8; BLOCK_SIZE] {
        [byte; BLOCK_SIZE]
    }

    #[test]
    fn test_step_copies_only_snapshot_blocks() -> Result<()> {
        let dir = tempdir()?;
        let mut source = BlockFile::create(&dir.path().join("objects"))?;
        let mut bitmap = BlockBitmap::new();
        for b in 0..4u8 {
            source.write_block(b as usize, &filled(b + 1))?;
        }
        bitmap.mark(0, BLOCK_SIZE);
        bitmap.mark(2, BLOCK_SIZE);

        let dump_path = dir.path().join("dump");
        let mut cp = Checkpoint::begin(&dump_path, bitmap)?;
        assert_eq!(cp.step(&mut source, 1)?, CheckpointStatus::InProgress);
        assert_eq!(cp.step(&mut source, 1)?, CheckpointStatus::Finished);
        assert_eq!(cp.blocks_copied(), 2);

        let mut out = BlockFile::open(&dump_path)?;
        let mut buf = [0u8; BLOCK_SIZE];
        out.read_block(0, &mut buf)?;
        assert_eq!(buf, filled(1));
        out.read_block(1, &mut buf)?;
        assert_eq!(buf, filled(0));
        out.read_block(2, &mut buf)?;
        assert_eq!(buf, filled(3));
        Ok(())
    }

    #[test]
    fn test_preserve_before_overwrite() -> Result<()> {
        let dir = tempdir()?;
        let mut source = BlockFile::create(&dir.path().join("objects"))?;
        let mut bitmap = BlockBitmap::new();
        source.write_block(5, &filled(9))?;
        bitmap.mark(5, BLOCK_SIZE);

        let dump_path = dir.path().join("dump");
        let mut cp = Checkpoint::begin(&dump_path, bitmap)?;
        cp.preserve(&mut source, 4, 3)?;
        assert!(!cp.is_pending(5));
        source.write_block(5, &filled(1))?;

        assert_eq!(cp.step(&mut source, 100)?, CheckpointStatus::Finished);
        assert_eq!(cp.blocks_copied(), 1);

        let mut out = BlockFile::open(&dump_path)?;
        let mut buf = [0u8; BLOCK_SIZE];
        out.read_block(5, &mut buf)?;
        assert_eq!(buf, filled(9));
        Ok(())
    }

    #[test]
    fn test_cannot_open() -> Result<()> {
        let dir = tempdir()?;
        let bad = dir.path().join("missing-dir").join("dump");
        let err = Checkpoint::begin(&bad, BlockBitmap::new()).err().unwrap();
        assert!(matches!(err, StoreError::CheckpointOpen { .. }));
        Ok(())
    }
}
