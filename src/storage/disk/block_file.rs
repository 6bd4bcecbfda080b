use crate::storage::bitmap::BLOCK_SIZE;
use crate::storage::error::StoreResult;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A flat file addressed in bytes and in fixed-size blocks.
///
/// Blocks past the end of the file read as zeroes; writes extend the file.
pub struct BlockFile {
    file: File,
    path: PathBuf,
}

impl BlockFile {
    pub fn create(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn open_or_create(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> StoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn num_blocks(&self) -> StoreResult<usize> {
        Ok((self.len()? as usize).div_ceil(BLOCK_SIZE))
    }

    /// Fill `buf` from `offset`; the part beyond end of file is zeroed.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let file_size = self.len()?;
        let available = file_size.saturating_sub(offset).min(buf.len() as u64) as usize;

        if available > 0 {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf[..available])?;
        }
        buf[available..].fill(0);
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn read_block(&mut self, block: usize, buf: &mut [u8; BLOCK_SIZE]) -> StoreResult<()> {
        self.read_at(Self::block_offset(block), buf)
    }

    pub fn write_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> StoreResult<()> {
        self.write_at(Self::block_offset(block), data)
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn block_offset(block: usize) -> u64 {
        block as u64 * BLOCK_SIZE as u64
    }
}
