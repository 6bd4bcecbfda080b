//! Clean-shutdown marker.
//!
//! A small text file written on orderly close and removed on open. Its
//! presence with a matching version and magic means the objects file and the
//! index agree; anything else means the last run may have died mid-write.
//!
//! ```text
//! 1 0 0
//! 186496480
//! 5123
//! linux
//! ```

use crate::storage::error::{StoreError, StoreResult};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const VERSION: (u32, u32, u32) = (1, 0, 0);
pub const MAGIC: u32 = 0x0B1D_B5E0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub version: (u32, u32, u32),
    pub magic: u32,
    pub search_stamp: u64,
    pub system: String,
}

impl Marker {
    pub fn current(search_stamp: u64) -> Self {
        Self {
            version: VERSION,
            magic: MAGIC,
            search_stamp,
            system: std::env::consts::OS.to_string(),
        }
    }

    /// Read the marker at `path`. A missing or unparseable file is `None`.
    pub fn read(path: &Path) -> StoreResult<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker = Self::parse(&text);
        if marker.is_none() {
            log::warn!("ignoring unreadable marker file {:?}", path);
        }
        Ok(marker)
    }

    fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let mut version = lines.next()?.split_whitespace().map(|p| p.parse::<u32>());
        let major = version.next()?.ok()?;
        let minor = version.next()?.ok()?;
        let patch = version.next()?.ok()?;
        let magic = lines.next()?.trim().parse().ok()?;
        let search_stamp = lines.next()?.trim().parse().ok()?;
        let system = lines.next()?.trim().to_string();
        Some(Self {
            version: (major, minor, patch),
            magic,
            search_stamp,
            system,
        })
    }

    pub fn write(&self, path: &Path) -> StoreResult<()> {
        let text = format!(
            "{} {} {}\n{}\n{}\n{}\n",
            self.version.0, self.version.1, self.version.2, self.magic, self.search_stamp, self.system
        );
        fs::write(path, text)
            .map_err(|e| StoreError::Marker(format!("cannot write {:?}: {}", path, e)))
    }

    /// True if a store closed with this marker can be opened as clean.
    pub fn is_compatible(&self) -> bool {
        self.version == VERSION && self.magic == MAGIC
    }

    pub fn remove(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Marker(format!("cannot remove {:?}: {}", path, e))),
        }
    }
}
