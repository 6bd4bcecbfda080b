//! Storage layer for objdb.
//!
//! Bottom to top:
//!
//! - **BlockBitmap**: one bit per 256-byte block of the objects file
//! - **BlockFile**: raw block I/O on a flat file
//! - **Index**: objnum -> location and name -> objnum, on a pluggable key-value engine
//! - **FileStore**: allocates extents and reads/writes whole records, runs checkpoints
//! - **ObjectCache**: reference-counted working set with eviction and write-back
//!
//! The marker file records whether the last run shut down cleanly.

pub mod bitmap;
pub mod cache;
pub mod checkpoint;
pub mod disk;
pub mod error;
pub mod file_store;
pub mod index;
pub mod marker;

pub use bitmap::{BlockBitmap, BLOCK_SIZE};
pub use cache::{CacheStats, ObjRef, ObjectCache, Residency, Writer};
pub use checkpoint::CheckpointStatus;
pub use disk::BlockFile;
pub use error::{StoreError, StoreResult};
pub use file_store::FileStore;
pub use index::{Index, Location};
pub use marker::Marker;
