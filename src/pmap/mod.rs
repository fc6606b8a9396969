//! # Persistent Map
//!
//! A `PMap` is one persistent dictionary: an append-only record log (the
//! [`store`](crate::store)) indexed by an open-addressed hash table (the
//! [`index`](crate::index)), with a commutative running digest (the
//! [`checksum`](crate::checksum)) over whatever is currently live.
//!
//! ## Timestamp semantics
//!
//! Every stored value begins with an 8-byte little-endian `i64` — the
//! record's timestamp in nanoseconds since the Unix epoch — followed by the
//! caller's payload. The timestamp drives **last-write-wins** resolution:
//!
//! - [`PMap::set`] keeps whichever record has the larger timestamp; on a
//!   tie the already-stored record wins, so replicas that replay the same
//!   operations converge regardless of arrival order.
//! - [`PMap::del`] is a timestamped operation too: a delete older than the
//!   stored record is discarded.
//! - [`PMap::cas`] opts *out* of LWW — it is explicit concurrency control,
//!   succeeding only when the stored timestamp and payload fingerprint
//!   match the caller's expectation exactly.
//!
//! ## Delete discipline
//!
//! Deletes never reclaim space. The record's bucket is tombstoned and a
//! tombstone record (empty value) is appended so replay reconstructs the
//! delete; the shadowed bytes are counted by [`PMap::deleted`] and leak
//! until the whole map is destroyed with [`PMap::close_and_delete`].
//!
//! ## Recovery
//!
//! [`PMap::open`] replays the log front to back, re-inserting each record
//! exactly as a replayed `set` would, so the index, the deleted-byte count,
//! and the checksum come out identical to the pre-close state. Replay
//! validates framing and fails with a corruption error on overruns instead
//! of silently truncating.
//!
//! ## Concurrency
//!
//! A `PMap` is **not** thread-safe and does not try to be: the containing
//! system serializes access with one lock per map. Rust's borrow rules
//! enforce the discipline locally (mutating operations take `&mut self`),
//! and [`PMap::get`] copies values out of the mapping so callers may hold
//! them across later mutations.

#[cfg(test)]
mod tests;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::checksum::SyncChecksum;
use crate::hashing::fnv1a64;
use crate::index::{DELETED_BUCKET, EMPTY_BUCKET, Index, IndexError, remap_hash};
use crate::store::{RECORD_HEADER_SIZE, Store, StoreError};

/// Bytes of timestamp header at the front of every live value.
pub const TIMESTAMP_SIZE: usize = 8;

/// Minimum `cas` value length: expected timestamp, expected payload hash,
/// and new timestamp.
pub const CAS_HEADER_SIZE: usize = 24;

/// Errors returned by map operations.
///
/// Absence is not an error: `get` of a missing key, `del` of a missing
/// key, and a `set` discarded by last-write-wins all return `Ok`.
#[derive(Debug, Error)]
pub enum PMapError {
    /// Error from the record log.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from the hash index.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// A value too short to carry its required header.
    #[error("value of {len} bytes is too short ({required} byte minimum)")]
    ValueTooShort { len: usize, required: usize },

    /// A compare-and-swap expectation did not hold.
    #[error("cas mismatch: {0}")]
    CasMismatch(String),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Sizing knobs for a map's hash index.
///
/// The defaults suit shard-sized maps (64 Ki initial buckets, growable to
/// 256 Mi); tests and small tools shrink them.
#[derive(Debug, Clone, Copy)]
pub struct PMapConfig {
    /// log2 of the initial bucket count.
    pub initial_index_log2: u8,

    /// log2 of the largest bucket count the index may grow to.
    pub max_index_log2: u8,

    /// Occupancy percentage that triggers doubling.
    pub index_load_factor_pct: u8,
}

impl Default for PMapConfig {
    fn default() -> Self {
        Self {
            initial_index_log2: 16,
            max_index_log2: 28,
            index_load_factor_pct: 75,
        }
    }
}

impl PMapConfig {
    fn validate(&self) -> Result<(), PMapError> {
        if self.initial_index_log2 > self.max_index_log2 {
            return Err(PMapError::InvalidConfig(format!(
                "initial_index_log2 ({}) exceeds max_index_log2 ({})",
                self.initial_index_log2, self.max_index_log2
            )));
        }
        if self.max_index_log2 > 29 {
            return Err(PMapError::InvalidConfig(format!(
                "max_index_log2 ({}) exceeds the 32-bit offset regime",
                self.max_index_log2
            )));
        }
        if self.index_load_factor_pct == 0 || self.index_load_factor_pct > 95 {
            return Err(PMapError::InvalidConfig(format!(
                "index_load_factor_pct ({}) must be in 1..=95",
                self.index_load_factor_pct
            )));
        }
        Ok(())
    }
}

/// Where a probe for a key came to rest.
enum Slot {
    /// The key is definitively absent. `bucket` is where an insert should
    /// land: the first tombstoned slot crossed during the probe, if any,
    /// otherwise the empty bucket that ended it.
    Vacant { bucket: u32 },

    /// Full key match: the live record for the key is at `offset`.
    Occupied { bucket: u32, offset: u32 },
}

/// A persistent last-write-wins dictionary. See the [module
/// documentation](self) for semantics.
#[derive(Debug)]
pub struct PMap {
    store: Store,
    index: Index,
    checksum: SyncChecksum,
}

impl PMap {
    /// Creates a fresh map backed by a file of exactly `size` bytes.
    pub fn new(path: impl AsRef<Path>, size: usize) -> Result<Self, PMapError> {
        Self::with_config(path, size, PMapConfig::default())
    }

    /// Creates a fresh map in anonymous memory; nothing touches the file
    /// system and the content is lost on drop.
    pub fn new_anonymous(size: usize) -> Result<Self, PMapError> {
        Self::new_anonymous_with_config(size, PMapConfig::default())
    }

    /// [`PMap::new_anonymous`] with explicit index sizing.
    pub fn new_anonymous_with_config(size: usize, config: PMapConfig) -> Result<Self, PMapError> {
        config.validate()?;
        Ok(Self {
            store: Store::create(None, size)?,
            index: Self::index_for(&config),
            checksum: SyncChecksum::new(),
        })
    }

    /// [`PMap::new`] with explicit index sizing.
    pub fn with_config(
        path: impl AsRef<Path>,
        size: usize,
        config: PMapConfig,
    ) -> Result<Self, PMapError> {
        config.validate()?;
        Ok(Self {
            store: Store::create(Some(path.as_ref()), size)?,
            index: Self::index_for(&config),
            checksum: SyncChecksum::new(),
        })
    }

    /// Opens a previously closed map, replaying its log to rebuild the
    /// index, the checksum, and the space counters.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PMapError> {
        Self::open_with_config(path, PMapConfig::default())
    }

    /// [`PMap::open`] with explicit index sizing.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: PMapConfig,
    ) -> Result<Self, PMapError> {
        config.validate()?;
        let mut map = Self {
            store: Store::open(path.as_ref())?,
            index: Self::index_for(&config),
            checksum: SyncChecksum::new(),
        };
        map.replay()?;
        Ok(map)
    }

    fn index_for(config: &PMapConfig) -> Index {
        Index::new(
            config.initial_index_log2,
            config.max_index_log2,
            config.index_load_factor_pct,
        )
    }

    /// Returns a copy of the key's value, or `None` if the key is absent
    /// or deleted. The copy stays valid across later mutations.
    ///
    /// `h32` is the low 32 bits of the key's FNV-1a64 hash; the remap that
    /// keeps real hashes off the bucket sentinels is applied here.
    pub fn get(&self, h32: u32, key: &[u8]) -> Result<Option<Vec<u8>>, PMapError> {
        match self.probe(remap_hash(h32), key) {
            Slot::Vacant { .. } => Ok(None),
            Slot::Occupied { offset, .. } => Ok(Some(self.store.val(offset as usize).to_vec())),
        }
    }

    /// Inserts or overwrites a pair under last-write-wins.
    ///
    /// `value` must be at least [`TIMESTAMP_SIZE`] bytes; its first 8 bytes
    /// are the pair's timestamp. A write older than (or tied with) the
    /// stored record is silently discarded.
    pub fn set(&mut self, h64: u64, key: &[u8], value: &[u8]) -> Result<(), PMapError> {
        if value.len() < TIMESTAMP_SIZE {
            return Err(PMapError::ValueTooShort {
                len: value.len(),
                required: TIMESTAMP_SIZE,
            });
        }
        if self.index.needs_expand() {
            self.index.expand()?;
        }

        let h = remap_hash(h64 as u32);
        let ts_new = timestamp_of(value);
        match self.probe(h, key) {
            Slot::Vacant { bucket } => {
                let offset = self.store.put(key, value)?;
                self.claim(bucket, h, offset);
                self.checksum.sum(h64 ^ ts_new as u64, ts_new);
            }
            Slot::Occupied { bucket, offset } => {
                let ts_old = timestamp_of(self.store.val(offset as usize));
                if ts_old >= ts_new {
                    debug!(ts_old, ts_new, "set discarded, stored pair is newer");
                    return Ok(());
                }
                let shadowed =
                    RECORD_HEADER_SIZE + key.len() + self.store.val_len(offset as usize);
                let new_offset = self.store.put(key, value)?;
                self.store.deleted += shadowed;
                self.checksum.sub(h64 ^ ts_old as u64, ts_new);
                self.index.set_store_offset(bucket, new_offset);
                self.checksum.sum(h64 ^ ts_new as u64, ts_new);
            }
        }
        Ok(())
    }

    /// Deletes a pair under last-write-wins.
    ///
    /// `value` carries the delete's timestamp in its first 8 bytes; the
    /// rest is ignored. Deleting an absent key succeeds, and a delete
    /// strictly older than the stored record is discarded. A successful
    /// delete tombstones the bucket and appends a tombstone record so the
    /// delete survives replay.
    pub fn del(&mut self, h64: u64, key: &[u8], value: &[u8]) -> Result<(), PMapError> {
        if value.len() < TIMESTAMP_SIZE {
            return Err(PMapError::ValueTooShort {
                len: value.len(),
                required: TIMESTAMP_SIZE,
            });
        }

        let h = remap_hash(h64 as u32);
        match self.probe(h, key) {
            Slot::Vacant { .. } => Ok(()),
            Slot::Occupied { bucket, offset } => {
                let ts_old = timestamp_of(self.store.val(offset as usize));
                let ts_new = timestamp_of(value);
                if ts_new < ts_old {
                    debug!(ts_old, ts_new, "del discarded, stored pair is newer");
                    return Ok(());
                }
                let shadowed =
                    RECORD_HEADER_SIZE + key.len() + self.store.val_len(offset as usize);
                self.store.deleted += shadowed;
                self.checksum.sub(h64 ^ ts_old as u64, ts_new);
                self.index.set_hash(bucket, DELETED_BUCKET);
                self.store.put(key, &[])?;
                Ok(())
            }
        }
    }

    /// Compare-and-swap. `value` layout:
    ///
    /// ```text
    /// [0..8]   expected timestamp of the stored pair; 0 expects absence
    /// [8..16]  expected FNV-1a64 of the stored payload (past its
    ///          timestamp header); fnv1a64(b"") when expecting absence
    /// [16..24] new timestamp
    /// [24..]   new payload
    /// ```
    ///
    /// The stored record is replaced by `value[16..]` only when both
    /// expectations hold; otherwise [`PMapError::CasMismatch`] is
    /// returned. `cas` deliberately ignores last-write-wins — it may
    /// install a timestamp older than the one it replaces.
    pub fn cas(&mut self, h64: u64, key: &[u8], value: &[u8]) -> Result<(), PMapError> {
        if value.len() < CAS_HEADER_SIZE {
            return Err(PMapError::ValueTooShort {
                len: value.len(),
                required: CAS_HEADER_SIZE,
            });
        }
        if self.index.needs_expand() {
            self.index.expand()?;
        }

        let expected_ts = timestamp_of(value);
        let expected_hash = u64_at(value, TIMESTAMP_SIZE);
        let new_value = &value[16..];
        let ts_new = timestamp_of(new_value);

        let h = remap_hash(h64 as u32);
        match self.probe(h, key) {
            Slot::Vacant { bucket } => {
                if expected_ts != 0 || expected_hash != fnv1a64(&[]) {
                    return Err(PMapError::CasMismatch(
                        "pair is absent but an existing pair was expected".into(),
                    ));
                }
                let offset = self.store.put(key, new_value)?;
                self.claim(bucket, h, offset);
                self.checksum.sum(h64 ^ ts_new as u64, ts_new);
                Ok(())
            }
            Slot::Occupied { bucket, offset } => {
                let (ts_old, stored_hash, shadowed) = {
                    let stored = self.store.val(offset as usize);
                    (
                        timestamp_of(stored),
                        fnv1a64(&stored[TIMESTAMP_SIZE..]),
                        RECORD_HEADER_SIZE + key.len() + stored.len(),
                    )
                };
                if ts_old != expected_ts {
                    return Err(PMapError::CasMismatch(format!(
                        "stored timestamp {ts_old} does not match expected {expected_ts}"
                    )));
                }
                if stored_hash != expected_hash {
                    return Err(PMapError::CasMismatch(
                        "stored payload hash does not match expected".into(),
                    ));
                }
                self.checksum.sub(h64 ^ ts_old as u64, ts_new);
                let new_offset = self.store.put(key, new_value)?;
                self.store.deleted += shadowed;
                self.index.set_store_offset(bucket, new_offset);
                self.checksum.sum(h64 ^ ts_new as u64, ts_new);
                Ok(())
            }
        }
    }

    /// Visits every live pair in log order, stopping early when `foreach`
    /// returns `false`. Keys and values are copied before the call.
    pub fn iterate<F>(&self, mut foreach: F) -> Result<(), PMapError>
    where
        F: FnMut(Vec<u8>, Vec<u8>) -> bool,
    {
        let mut offset = 0usize;
        while offset < self.store.length {
            if self.is_present(offset) {
                let key = self.store.key(offset).to_vec();
                let val = self.store.val(offset).to_vec();
                if !foreach(key, val) {
                    break;
                }
            }
            offset += RECORD_HEADER_SIZE + self.store.total_len(offset);
        }
        Ok(())
    }

    /// [`PMap::iterate`] in reverse log order.
    pub fn backwards_iterate<F>(&self, mut foreach: F) -> Result<(), PMapError>
    where
        F: FnMut(Vec<u8>, Vec<u8>) -> bool,
    {
        let mut offset = match self.store.prev(self.store.length) {
            None => return Ok(()),
            Some(offset) => offset,
        };
        loop {
            if self.is_present(offset) {
                let key = self.store.key(offset).to_vec();
                let val = self.store.val(offset).to_vec();
                if !foreach(key, val) {
                    return Ok(());
                }
            }
            match self.store.prev(offset) {
                None => return Ok(()),
                Some(previous) => offset = previous,
            }
        }
    }

    /// Current anti-entropy digest: the XOR of `key_hash ⊕ ts_bits` over
    /// every live pair. Equal digests mean (up to XOR collisions) equal
    /// live content, independent of operation order.
    pub fn checksum(&self) -> u64 {
        self.checksum.value()
    }

    /// Bytes of log written so far.
    pub fn used(&self) -> usize {
        self.store.length
    }

    /// Bytes of log shadowed by overwrites and deletes. This only ever
    /// grows; reclaiming it means [`PMap::close_and_delete`] and a rebuild
    /// from a replica. Replay additionally counts tombstone frames, so the
    /// figure may be larger after a close/open cycle than before it.
    pub fn deleted(&self) -> usize {
        self.store.deleted
    }

    /// Fixed capacity of the underlying store in bytes.
    pub fn size(&self) -> usize {
        self.store.size
    }

    /// Path of the backing file, `None` for anonymous maps.
    pub fn path(&self) -> Option<&Path> {
        self.store.path()
    }

    /// Flushes the store to disk and consumes the map.
    pub fn close(self) -> Result<(), PMapError> {
        self.store.close().map_err(Into::into)
    }

    /// Consumes the map and unlinks its backing file, releasing the disk
    /// space of everything the map ever stored.
    pub fn close_and_delete(self) -> Result<(), PMapError> {
        self.store.close_and_delete().map_err(Into::into)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// The probing template shared by every operation: start at
    /// `h & size_mask`, advance linearly. An empty bucket proves absence;
    /// a hash match is confirmed by full key comparison; tombstoned slots
    /// are skipped but remembered for reuse.
    ///
    /// Terminates because mutating operations expand the table before it
    /// can fill: some empty bucket always remains.
    fn probe(&self, h: u32, key: &[u8]) -> Slot {
        let mut bucket = h & self.index.size_mask;
        let mut reusable: Option<u32> = None;
        loop {
            match self.index.hash_at(bucket) {
                EMPTY_BUCKET => {
                    return Slot::Vacant {
                        bucket: reusable.unwrap_or(bucket),
                    };
                }
                DELETED_BUCKET => {
                    reusable.get_or_insert(bucket);
                }
                stored if stored == h => {
                    let offset = self.index.store_offset_at(bucket);
                    if self.store.key(offset as usize) == key {
                        return Slot::Occupied { bucket, offset };
                    }
                }
                _ => {}
            }
            bucket = (bucket + 1) & self.index.size_mask;
        }
    }

    /// Takes a vacant slot for a new key. Claiming a previously tombstoned
    /// slot still counts the key: tombstoned buckets keep participating in
    /// probe chains, so they stay inside the load-factor budget until an
    /// expansion recounts.
    fn claim(&mut self, bucket: u32, h: u32, offset: u32) {
        self.index.occupy(bucket, h, offset);
    }

    /// Whether the record at `offset` is the live version of its key:
    /// tombstones never are, and a shadowed record's timestamp header no
    /// longer matches the one the index points at.
    fn is_present(&self, offset: usize) -> bool {
        let val = self.store.val(offset);
        if val.len() < TIMESTAMP_SIZE {
            return false;
        }
        let key = self.store.key(offset);
        match self.probe(remap_hash(fnv1a64(key) as u32), key) {
            Slot::Vacant { .. } => false,
            Slot::Occupied { offset: live, .. } => {
                self.store.val(live as usize)[..TIMESTAMP_SIZE] == val[..TIMESTAMP_SIZE]
            }
        }
    }

    /// Rebuilds index, checksum, and counters by replaying the log.
    fn replay(&mut self) -> Result<(), PMapError> {
        let mut offset = 0usize;
        while offset + RECORD_HEADER_SIZE <= self.store.size {
            let key_len = self.store.key_len(offset);
            if key_len == 0 {
                break;
            }
            let val_len = self.store.val_len(offset);
            let total_len = self.store.total_len(offset);
            if total_len != key_len + val_len {
                return Err(StoreError::Corruption {
                    offset,
                    reason: format!(
                        "length fields disagree: {key_len} + {val_len} != {total_len}"
                    ),
                }
                .into());
            }
            let end = offset + RECORD_HEADER_SIZE + total_len;
            if end > self.store.size {
                return Err(StoreError::Corruption {
                    offset,
                    reason: format!("record runs {} bytes past the store end", end - self.store.size),
                }
                .into());
            }
            if val_len != 0 && val_len < TIMESTAMP_SIZE {
                return Err(StoreError::Corruption {
                    offset,
                    reason: format!("{val_len}-byte value cannot hold a timestamp header"),
                }
                .into());
            }

            self.restore_record(offset)?;
            if val_len == 0 {
                // Tombstone frames are dead weight from the moment they are
                // written; count them along with whatever they shadowed.
                self.store.deleted += RECORD_HEADER_SIZE + key_len;
            }

            offset = end;
            self.store.length = offset;
        }
        info!(
            used = self.store.length,
            deleted = self.store.deleted,
            keys = self.index.num_stored_keys,
            "replayed log"
        );
        Ok(())
    }

    /// Replays one record: a replayed `set` for live values, a replayed
    /// `del` for tombstones.
    fn restore_record(&mut self, offset: usize) -> Result<(), PMapError> {
        if self.index.needs_expand() {
            self.index.expand()?;
        }

        let key_len = self.store.key_len(offset);
        let val_len = self.store.val_len(offset);
        let h64 = fnv1a64(self.store.key(offset));
        let h = remap_hash(h64 as u32);
        let ts_new = if val_len == 0 {
            None
        } else {
            Some(timestamp_of(self.store.val(offset)))
        };

        let slot = self.probe(h, self.store.key(offset));
        match slot {
            Slot::Vacant { bucket } => {
                if let Some(ts) = ts_new {
                    self.claim(bucket, h, offset as u32);
                    self.checksum.sum(h64 ^ ts as u64, ts);
                }
                // A tombstone for a key with no live record restores to
                // nothing; its own frame is counted by the replay loop.
            }
            Slot::Occupied {
                bucket,
                offset: old_offset,
            } => {
                let ts_old = timestamp_of(self.store.val(old_offset as usize));
                if let Some(ts) = ts_new {
                    if ts_old >= ts {
                        // Same tie-break as the live path: the record
                        // already indexed wins, the replayed one is dead.
                        self.store.deleted += RECORD_HEADER_SIZE + key_len + val_len;
                        return Ok(());
                    }
                }
                let old_val_len = self.store.val_len(old_offset as usize);
                self.store.deleted += RECORD_HEADER_SIZE + key_len + old_val_len;
                let fold_ts = ts_new.unwrap_or(ts_old);
                self.checksum.sub(h64 ^ ts_old as u64, fold_ts);
                match ts_new {
                    Some(ts) => {
                        self.index.set_store_offset(bucket, offset as u32);
                        self.checksum.sum(h64 ^ ts as u64, ts);
                    }
                    None => self.index.set_hash(bucket, DELETED_BUCKET),
                }
            }
        }
        Ok(())
    }
}

/// Little-endian `i64` timestamp at the front of a value.
fn timestamp_of(value: &[u8]) -> i64 {
    let b = &value[..TIMESTAMP_SIZE];
    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Little-endian `u64` at `at`.
fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let b = &bytes[at..at + 8];
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
