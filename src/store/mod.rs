//! Memory-mapped append-only record log.
//!
//! ## Design Overview
//!
//! The store is a flat sequence of variable-length record frames written
//! contiguously from byte 0 of a memory-mapped region. The region is either
//! a file (persistent maps) or anonymous memory (throwaway maps). Its size
//! is fixed at creation: the kernel decides which pages live in RAM, the
//! store never grows, and an append past the end fails with
//! [`StoreError::StoreFull`].
//!
//! # On-disk layout
//!
//! ```text
//! [KEY_LEN_LE32][VAL_LEN_LE32][TOTAL_LEN_LE32][KEY_BYTES][VAL_BYTES]
//! [KEY_LEN_LE32][VAL_LEN_LE32][TOTAL_LEN_LE32][KEY_BYTES][VAL_BYTES]
//! ...
//! ```
//!
//! - `key_len == 0` marks the end of the log (the file is zero-filled at
//!   creation, so the first untouched header terminates replay).
//! - `val_len == 0` marks a tombstone.
//! - `total_len = key_len + val_len` duplicates the other two fields so a
//!   reader positioned at a record boundary can step *backwards*: the four
//!   bytes ending at the boundary are the previous record's `total_len`.
//!
//! There is no file header, no magic, and no per-record checksum; the log
//! is only ever read back by the map that wrote it, and replay validates
//! framing instead.
//!
//! # Offset width
//!
//! Record offsets are handed out as `u32` because the index packs them into
//! 4 bytes per bucket. The store size is therefore capped at 4 GiB; shards
//! are kept small by the routing layer.
//!
//! # Ownership
//!
//! [`Store::key`] and [`Store::val`] return slices borrowing the mapping.
//! Borrow-wise that is safe, but callers that hand bytes to the outside
//! world copy them first, because the slice only stays meaningful while the
//! record it points at is the authoritative version.

#[cfg(test)]
mod tests;

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{info, trace};

/// Framing bytes preceding each record's key: three little-endian `u32`
/// length fields.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Permission bits for newly created store files.
const STORE_FILE_MODE: u32 = 0o700;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing file could not be created, sized, mapped, or unlinked.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An append would run past the preallocated region.
    #[error("store full: {record}-byte record does not fit ({used} of {size} bytes used)")]
    StoreFull {
        record: usize,
        used: usize,
        size: usize,
    },

    /// The store would exceed the 4 GiB ceiling imposed by 32-bit offsets.
    #[error("store size {0} exceeds the 4 GiB offset ceiling")]
    SizeCeiling(u64),

    /// A record read back from the log does not frame correctly.
    #[error("corrupt record at offset {offset}: {reason}")]
    Corruption { offset: usize, reason: String },
}

/// Append-only record log in a fixed-size memory-mapped region.
///
/// The `length` and `deleted` counters live here but are advanced by the
/// owning map: `put` moves `length`, while `deleted` (bytes shadowed by
/// overwrites and tombstones) is pure bookkeeping the store itself never
/// consults.
#[derive(Debug)]
pub(crate) struct Store {
    mmap: MmapMut,
    path: Option<PathBuf>,
    /// Region capacity in bytes, fixed at creation.
    pub size: usize,
    /// First byte past the last written record.
    pub length: usize,
    /// Bytes shadowed by later overwrites or tombstones.
    pub deleted: usize,
}

impl Store {
    /// Creates a store of exactly `size` bytes.
    ///
    /// With a path, the backing file is created (mode `0700`), truncated to
    /// `size`, and mapped read-write. Without one, the store lives in
    /// anonymous memory and vanishes on drop.
    pub fn create(path: Option<&Path>, size: usize) -> Result<Self, StoreError> {
        if size > u32::MAX as usize {
            return Err(StoreError::SizeCeiling(size as u64));
        }
        let (mmap, path) = match path {
            None => (MmapMut::map_anon(size)?, None),
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(STORE_FILE_MODE)
                    .open(path)?;
                file.set_len(size as u64)?;
                let mmap = unsafe { MmapMut::map_mut(&file)? };
                (mmap, Some(path.to_path_buf()))
            }
        };
        info!(size, path = ?path, "created store");
        Ok(Self {
            mmap,
            path,
            size,
            length: 0,
            deleted: 0,
        })
    }

    /// Re-maps an existing store file; its size is the file's length.
    ///
    /// `length` and `deleted` start at zero — the owning map recomputes
    /// both while replaying the log.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len > u32::MAX as u64 {
            return Err(StoreError::SizeCeiling(file_len));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(size = file_len, path = %path.display(), "opened store");
        Ok(Self {
            mmap,
            path: Some(path.to_path_buf()),
            size: file_len as usize,
            length: 0,
            deleted: 0,
        })
    }

    /// Appends a record and returns the offset it was written at.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<u32, StoreError> {
        let record = RECORD_HEADER_SIZE + key.len() + value.len();
        if self.length + record > self.size {
            return Err(StoreError::StoreFull {
                record,
                used: self.length,
                size: self.size,
            });
        }
        let offset = self.length;
        self.write_u32(offset, key.len() as u32);
        self.write_u32(offset + 4, value.len() as u32);
        self.write_u32(offset + 8, (key.len() + value.len()) as u32);
        let key_start = offset + RECORD_HEADER_SIZE;
        self.mmap[key_start..key_start + key.len()].copy_from_slice(key);
        let val_start = key_start + key.len();
        self.mmap[val_start..val_start + value.len()].copy_from_slice(value);
        self.length += record;
        trace!(offset, key_len = key.len(), val_len = value.len(), "appended record");
        Ok(offset as u32)
    }

    /// Key length of the record at `offset`. Zero means no record starts here.
    pub fn key_len(&self, offset: usize) -> usize {
        self.read_u32(offset) as usize
    }

    /// Value length of the record at `offset`. Zero means tombstone.
    pub fn val_len(&self, offset: usize) -> usize {
        self.read_u32(offset + 4) as usize
    }

    /// Combined key + value length of the record at `offset`.
    pub fn total_len(&self, offset: usize) -> usize {
        self.read_u32(offset + 8) as usize
    }

    /// View of the key bytes of the record at `offset`.
    pub fn key(&self, offset: usize) -> &[u8] {
        let start = offset + RECORD_HEADER_SIZE;
        &self.mmap[start..start + self.key_len(offset)]
    }

    /// View of the value bytes of the record at `offset`. Empty for
    /// tombstones; otherwise begins with the 8-byte timestamp header.
    pub fn val(&self, offset: usize) -> &[u8] {
        let start = offset + RECORD_HEADER_SIZE + self.key_len(offset);
        &self.mmap[start..start + self.val_len(offset)]
    }

    /// Offset of the record that *ends* at `offset`, or `None` at the log
    /// head. Decodes the `total_len` field stored in the four bytes before
    /// the boundary.
    pub fn prev(&self, offset: usize) -> Option<usize> {
        if offset == 0 {
            return None;
        }
        let total = self.read_u32(offset - 4) as usize;
        Some(offset - RECORD_HEADER_SIZE - total)
    }

    /// Flushes the mapping and releases it.
    pub fn close(self) -> Result<(), StoreError> {
        self.mmap.flush()?;
        info!(path = ?self.path, length = self.length, "closed store");
        Ok(())
    }

    /// Flushes, unmaps, and unlinks the backing file (if any).
    pub fn close_and_delete(self) -> Result<(), StoreError> {
        let Store { mmap, path, .. } = self;
        mmap.flush()?;
        drop(mmap);
        if let Some(path) = path {
            fs::remove_file(&path)?;
            info!(path = %path.display(), "deleted store file");
        }
        Ok(())
    }

    /// Path of the backing file, `None` for anonymous stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b = &self.mmap[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.mmap[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
