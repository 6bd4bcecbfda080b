//! Block allocator and record store over the flat objects file.
//!
//! Records are written whole, block aligned, at the location the index holds
//! for their objnum. The in-memory bitmap is not persisted; it is rebuilt from
//! the index on open.
//!
//! A `put` whose encoding still fits the blocks already reserved rewrites the
//! record in place instead of moving it. Shrinking records therefore keep
//! their larger extent. This trades some wasted space for less fragmentation
//! on the common no-growth update. The index records the extent length
//! (`max(old, new)`) so its rounded size always equals the bitmap extent;
//! decoding ignores the unused tail.
//!
//! A record that outgrows its extent gets a new one before the old one is
//! freed, so it never reuses its own blocks. The old bytes stay intact until
//! the index points at the new location.
//!
//! Index entries that start well past the end of the file are treated as
//! corrupt on open. An entry may run a little past the end when a crash came
//! between the index update and the write, but never by more than one bitmap
//! growth step.

use crate::codec::{decode_object, encode_object, TOMBSTONE};
use crate::object::{ObjectRecord, Objnum};
use crate::storage::bitmap::{blocks_needed, BlockBitmap, BITMAP_GROWTH, BLOCK_SIZE};
use crate::storage::checkpoint::{Checkpoint, CheckpointStatus};
use crate::storage::disk::BlockFile;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::index::{Index, Location};
use crate::value::InstanceRegistry;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileStore {
    file: BlockFile,
    bitmap: BlockBitmap,
    index: Arc<Index>,
    registry: Arc<InstanceRegistry>,
    dump: Option<Checkpoint>,
    max_objnum: Option<Objnum>,
}

/// Path of the index copy written alongside a dump at `path`.
pub fn dump_index_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".index");
    PathBuf::from(name)
}

impl FileStore {
    /// Open the objects file and rebuild the bitmap from every index entry.
    pub fn open(path: &Path, index: Arc<Index>, registry: Arc<InstanceRegistry>) -> StoreResult<Self> {
        let file = BlockFile::open_or_create(path)?;
        let mut bitmap = BlockBitmap::new();
        let mut max_objnum = None;
        let mut records = 0usize;
        let limit = file.len()? + (BITMAP_GROWTH * BLOCK_SIZE) as u64;

        let mut cursor = index.first()?;
        while let Some((objnum, loc)) = cursor {
            if loc.offset > limit {
                return Err(StoreError::Corrupt(format!(
                    "#{} located at offset {}, past the end of the file",
                    objnum, loc.offset
                )));
            }
            let start = loc.block();
            for block in start..start + blocks_needed(loc.size) {
                if bitmap.is_set(block) {
                    return Err(StoreError::Corrupt(format!(
                        "#{} overlaps another record at block {}",
                        objnum, block
                    )));
                }
            }
            bitmap.mark(start, loc.size);
            max_objnum = max_objnum.max(Some(objnum));
            records += 1;
            cursor = index.next(objnum)?;
        }

        log::info!(
            "objects file {:?}: {} records in {} blocks",
            path,
            records,
            bitmap.allocated_count()
        );

        Ok(Self {
            file,
            bitmap,
            index,
            registry,
            dump: None,
            max_objnum,
        })
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn bitmap(&self) -> &BlockBitmap {
        &self.bitmap
    }

    pub fn file_len(&self) -> StoreResult<u64> {
        self.file.len()
    }

    pub fn allocate(&mut self, size: usize) -> usize {
        self.bitmap.allocate(size)
    }

    /// Release an extent. Pending checkpoint blocks are copied out first.
    pub fn free(&mut self, block: usize, size: usize) -> StoreResult<()> {
        self.preserve(block, blocks_needed(size))?;
        self.bitmap.free(block, size);
        Ok(())
    }

    fn preserve(&mut self, block: usize, count: usize) -> StoreResult<()> {
        if let Some(dump) = self.dump.as_mut() {
            dump.preserve(&mut self.file, block, count)?;
        }
        Ok(())
    }

    fn write_extent(&mut self, block: usize, bytes: &[u8]) -> StoreResult<()> {
        self.preserve(block, blocks_needed(bytes.len()))?;
        self.file.write_at(BlockFile::block_offset(block), bytes)
    }

    pub fn check(&self, objnum: Objnum) -> bool {
        self.index.contains(objnum)
    }

    /// Load a record. `Ok(None)` when the index has no entry for it.
    pub fn get(&mut self, objnum: Objnum) -> StoreResult<Option<ObjectRecord>> {
        let Some(loc) = self.index.get(objnum) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; loc.size];
        self.file.read_at(loc.offset, &mut buf)?;
        let record = decode_object(&buf, &self.registry)?;
        if record.objnum != objnum {
            return Err(StoreError::Corrupt(format!(
                "block {} holds #{} where #{} was expected",
                loc.block(),
                record.objnum,
                objnum
            )));
        }
        Ok(Some(record))
    }

    /// Persist a record. Returns `false` if the index could not be updated,
    /// in which case nothing was written.
    pub fn put(&mut self, record: &ObjectRecord) -> StoreResult<bool> {
        let objnum = record.objnum;
        let bytes = encode_object(record);
        let needed = blocks_needed(bytes.len());

        let block = match self.index.get(objnum) {
            Some(old) if needed <= blocks_needed(old.size) => {
                let loc = Location::new(old.block(), old.size.max(bytes.len()));
                if loc != old && !self.index.put(objnum, loc) {
                    return Ok(false);
                }
                old.block()
            }
            old => {
                let block = self.allocate(bytes.len());
                if !self.index.put(objnum, Location::new(block, bytes.len())) {
                    self.free(block, bytes.len())?;
                    return Ok(false);
                }
                if let Some(old) = old {
                    log::debug!("#{} moved from block {} to {}", objnum, old.block(), block);
                    self.free(old.block(), old.size)?;
                }
                block
            }
        };

        self.write_extent(block, &bytes)?;
        self.note_objnum(objnum);
        Ok(true)
    }

    /// Remove a record: drop its index entry, free its extent and stamp the
    /// first bytes with a tombstone. Returns `false` if it was not stored.
    pub fn delete(&mut self, objnum: Objnum) -> StoreResult<bool> {
        let Some(loc) = self.index.get(objnum) else {
            return Ok(false);
        };
        if !self.index.remove(objnum) {
            return Ok(false);
        }
        self.free(loc.block(), loc.size)?;
        self.file.write_at(loc.offset, &TOMBSTONE)?;
        log::debug!("#{} deleted from block {}", objnum, loc.block());
        Ok(true)
    }

    /// Next objnum handed out for automatic numbering.
    pub fn next_objnum(&self) -> Objnum {
        self.max_objnum.map_or(0, |max| max + 1)
    }

    /// Account for an objnum in use, even if it is not stored yet.
    pub fn note_objnum(&mut self, objnum: Objnum) {
        self.max_objnum = self.max_objnum.max(Some(objnum));
    }

    pub fn checkpoint_running(&self) -> bool {
        self.dump.is_some()
    }

    /// Begin a dump to `path`. The current index is copied to
    /// `<path>.index` at the same instant.
    pub fn checkpoint_start(&mut self, path: &Path) -> StoreResult<()> {
        if self.dump.is_some() {
            return Err(StoreError::CheckpointInProgress);
        }
        let dump = Checkpoint::begin(path, self.bitmap.clone())?;
        let index_path = dump_index_path(path);
        self.index.export(&index_path).map_err(|e| match e {
            StoreError::Io(source) => StoreError::CheckpointOpen {
                path: index_path,
                source,
            },
            other => other,
        })?;
        self.dump = Some(dump);
        Ok(())
    }

    pub fn checkpoint_step(&mut self, max_blocks: usize) -> StoreResult<CheckpointStatus> {
        let Some(dump) = self.dump.as_mut() else {
            return Ok(CheckpointStatus::NotRunning);
        };
        let status = dump.step(&mut self.file, max_blocks)?;
        if status == CheckpointStatus::Finished {
            self.dump = None;
        }
        Ok(status)
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync()?;
        self.index.sync()
    }
}
