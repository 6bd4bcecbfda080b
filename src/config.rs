use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a [`Database`](crate::database::Database).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the objects, index and marker files.
    pub dir: PathBuf,
    /// Number of cache buckets.
    pub cache_width: usize,
    /// Initial slots per cache bucket.
    pub cache_depth: usize,
    /// Slots in the direct-mapped name cache.
    pub name_cache_size: usize,
    /// Background write-back period. `None` runs single-threaded.
    pub writer_interval: Option<Duration>,
    /// Whether to fsync the index on every sync.
    pub sync_index_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: PathBuf::from("objdb_data"),
            cache_width: 7,
            cache_depth: 23,
            name_cache_size: 1009,
            writer_interval: None,
            sync_index_writes: true,
        }
    }
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        StoreConfig {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn objects_path(&self) -> PathBuf {
        self.dir.join("objects")
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join("clean")
    }
}
