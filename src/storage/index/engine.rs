//! Key-value engines behind the index.
//!
//! [`LogKv`] keeps the whole map in memory and appends every change to a log
//! file. Opening replays the log, last write wins. A torn record at the tail
//! (crash mid-append) is cut off with a warning. The log is rewritten
//! compactly once dead records outnumber live ones.

use crate::storage::error::{StoreError, StoreResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Minimum number of dead log records before compaction is considered.
const COMPACT_MIN_GARBAGE: usize = 1024;

pub trait KvEngine: Send + Debug {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Returns whether the key existed.
    fn remove(&mut self, key: &[u8]) -> StoreResult<bool>;

    /// Smallest entry whose key starts with `prefix` and sorts after `after`
    /// (or the smallest such entry when `after` is `None`).
    fn next_with_prefix(&self, prefix: &[u8], after: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every change so far durable.
    fn flush(&mut self) -> StoreResult<()>;

    /// Write a compact copy of the current contents to `path` as a log that
    /// [`LogKv::open`] can read.
    fn export(&self, path: &Path) -> StoreResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

fn write_entry(out: &mut impl Write, entry: &LogEntry) -> StoreResult<()> {
    let bytes = bincode::serialize(entry)?;
    out.write_u32::<LittleEndian>(bytes.len() as u32)?;
    out.write_all(&bytes)?;
    Ok(())
}

/// Reads one entry; `Ok(None)` on a clean or torn end of log.
fn read_entry(input: &mut impl Read) -> StoreResult<Option<LogEntry>> {
    let len = match input.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = vec![0u8; len];
    match input.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    Ok(Some(bincode::deserialize(&bytes)?))
}

fn next_in_map(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
    after: Option<&[u8]>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let lower = match after {
        Some(key) => Bound::Excluded(key.to_vec()),
        None => Bound::Included(prefix.to_vec()),
    };
    // keys sharing a prefix are contiguous, so only the first candidate matters
    map.range((lower, Bound::Unbounded))
        .next()
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
}

fn export_map(map: &BTreeMap<Vec<u8>, Vec<u8>>, path: &Path) -> StoreResult<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for (key, value) in map {
        write_entry(
            &mut out,
            &LogEntry::Put {
                key: key.clone(),
                value: value.clone(),
            },
        )?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

/// In-memory engine for tests and throwaway stores.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemoryKv {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.map.remove(key).is_some())
    }

    fn next_with_prefix(&self, prefix: &[u8], after: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        next_in_map(&self.map, prefix, after)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn export(&self, path: &Path) -> StoreResult<()> {
        export_map(&self.map, path)
    }
}

/// Append-only log engine.
pub struct LogKv {
    path: PathBuf,
    log: BufWriter<File>,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    garbage: usize,
    sync_writes: bool,
}

impl Debug for LogKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogKv")
            .field("path", &self.path)
            .field("entries", &self.map.len())
            .field("garbage", &self.garbage)
            .finish()
    }
}

impl LogKv {
    pub fn open(path: &Path, sync_writes: bool) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut map = BTreeMap::new();
        let mut garbage = 0;
        let mut good_len = 0u64;
        {
            let mut reader = BufReader::new(&mut file);
            while let Some(entry) = read_entry(&mut reader)? {
                match entry {
                    LogEntry::Put { key, value } => {
                        if map.insert(key, value).is_some() {
                            garbage += 1;
                        }
                    }
                    LogEntry::Remove { key } => {
                        map.remove(&key);
                        garbage += 2;
                    }
                }
                good_len = reader.stream_position()?;
            }
        }

        let file_len = file.metadata()?.len();
        if good_len < file_len {
            log::warn!(
                "index log {:?}: discarding {} bytes of torn tail",
                path,
                file_len - good_len
            );
            file.set_len(good_len)?;
        }
        file.seek(SeekFrom::Start(good_len))?;
        log::debug!("index log {:?} replayed: {} entries", path, map.len());

        Ok(Self {
            path: path.to_path_buf(),
            log: BufWriter::new(file),
            map,
            garbage,
            sync_writes,
        })
    }

    pub fn garbage(&self) -> usize {
        self.garbage
    }

    fn append(&mut self, entry: &LogEntry) -> StoreResult<()> {
        write_entry(&mut self.log, entry)
    }

    /// Rewrite the log with only live entries.
    pub fn compact(&mut self) -> StoreResult<()> {
        self.log.flush()?;
        let tmp = self.path.with_extension("compact");
        export_map(&self.map, &tmp)?;
        fs::rename(&tmp, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.log = BufWriter::new(file);
        log::info!(
            "index log {:?} compacted: {} live, {} dropped",
            self.path,
            self.map.len(),
            self.garbage
        );
        self.garbage = 0;
        Ok(())
    }
}

impl KvEngine for LogKv {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.append(&LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        if self.map.insert(key.to_vec(), value.to_vec()).is_some() {
            self.garbage += 1;
        }
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StoreResult<bool> {
        if !self.map.contains_key(key) {
            return Ok(false);
        }
        self.append(&LogEntry::Remove { key: key.to_vec() })?;
        self.map.remove(key);
        self.garbage += 2;
        Ok(true)
    }

    fn next_with_prefix(&self, prefix: &[u8], after: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        next_in_map(&self.map, prefix, after)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.garbage >= COMPACT_MIN_GARBAGE && self.garbage > self.map.len() {
            return self.compact();
        }
        self.log.flush()?;
        if self.sync_writes {
            self.log.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn export(&self, path: &Path) -> StoreResult<()> {
        if path == self.path {
            return Err(StoreError::Index(
                "cannot export the index onto its own log".to_string(),
            ));
        }
        export_map(&self.map, path)
    }
}
