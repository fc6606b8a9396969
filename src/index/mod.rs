//! Open-addressed hash table mapping key hashes to store offsets.
//!
//! ## Design Overview
//!
//! The index is RAM-only and rebuilt from the log on open, so it carries no
//! durability machinery at all — just a flat byte array of 8-byte buckets,
//! each a `(hash32 LE, store_offset32 LE)` pair. Capacity is a power of
//! two; lookups probe linearly from `hash & size_mask`.
//!
//! Bucket occupancy is encoded in the hash field itself to keep buckets at
//! 8 bytes:
//!
//! - [`EMPTY_BUCKET`] — never occupied; probing stops here.
//! - [`DELETED_BUCKET`] — tombstoned slot; probing continues past it, and
//!   a write that proves its key absent may claim it.
//!
//! A real key hash equal to either sentinel is shifted by
//! [`remap_hash`] before it ever reaches a bucket, so the sentinels are
//! unambiguous. The remap is deterministic, which keeps hashes stable
//! across close/open cycles.
//!
//! ## Expansion
//!
//! When the stored-key count reaches the load-factor threshold the table
//! doubles: a new array is allocated and every live bucket is re-inserted.
//! Deleted buckets are dropped during the rehash (their probe-chain role is
//! recomputed from scratch), so the stored-key count is recounted from what
//! was actually carried over. Expansion past the configured limit fails
//! with [`IndexError::TableTooLarge`].

#[cfg(test)]
mod tests;

use thiserror::Error;
use tracing::info;

/// Hash sentinel for a bucket that has never held a key.
pub(crate) const EMPTY_BUCKET: u32 = 0xFFFF_FFFF;

/// Hash sentinel for a bucket whose key was deleted. Probes continue past
/// it; writes may reuse it. It never reverts to empty.
pub(crate) const DELETED_BUCKET: u32 = 0xFFFF_FFFE;

const BUCKET_SIZE: usize = 8;

/// Shifts raw hashes off the sentinel values.
///
/// Idempotent: the shifted results (`0` and `1`) are not themselves
/// sentinels, so remapping twice is harmless.
#[inline]
pub(crate) fn remap_hash(hash: u32) -> u32 {
    if hash == EMPTY_BUCKET || hash == DELETED_BUCKET {
        hash.wrapping_add(2)
    } else {
        hash
    }
}

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Doubling the table would exceed the configured capacity limit.
    #[error("index table would exceed its size limit of 2^{limit} buckets")]
    TableTooLarge { limit: u8 },
}

/// Linear-probing hash table over packed 8-byte buckets.
#[derive(Debug)]
pub(crate) struct Index {
    buckets: Vec<u8>,
    log2_size: u8,
    max_log2_size: u8,
    load_factor_pct: u8,
    /// `capacity - 1`; capacity is a power of two.
    pub size_mask: u32,
    /// Occupied-bucket count, including buckets later tombstoned. Recounted
    /// on expansion.
    pub num_stored_keys: u32,
    /// Threshold at which the next insert-path operation must expand first.
    num_keys_to_expand: u32,
}

impl Index {
    pub fn new(log2_size: u8, max_log2_size: u8, load_factor_pct: u8) -> Self {
        let capacity = 1usize << log2_size;
        Self {
            // An all-ones hash field is EMPTY_BUCKET, so 0xFF-filling the
            // array marks every bucket empty in one pass.
            buckets: vec![0xFF; capacity * BUCKET_SIZE],
            log2_size,
            max_log2_size,
            load_factor_pct,
            size_mask: (capacity - 1) as u32,
            num_stored_keys: 0,
            num_keys_to_expand: (capacity * load_factor_pct as usize / 100) as u32,
        }
    }

    /// Whether an insert-path operation must expand before probing.
    pub fn needs_expand(&self) -> bool {
        self.num_stored_keys >= self.num_keys_to_expand
    }

    /// Doubles the table, re-inserting every live bucket.
    pub fn expand(&mut self) -> Result<(), IndexError> {
        if self.log2_size >= self.max_log2_size {
            return Err(IndexError::TableTooLarge {
                limit: self.max_log2_size,
            });
        }
        let mut grown = Index::new(self.log2_size + 1, self.max_log2_size, self.load_factor_pct);
        for bucket in 0..=self.size_mask {
            let hash = self.hash_at(bucket);
            if hash == EMPTY_BUCKET || hash == DELETED_BUCKET {
                continue;
            }
            grown.insert_rehashed(hash, self.store_offset_at(bucket));
        }
        info!(
            from_log2 = self.log2_size,
            to_log2 = grown.log2_size,
            keys = grown.num_stored_keys,
            "expanded index"
        );
        *self = grown;
        Ok(())
    }

    /// Fills `bucket` with a `(hash, offset)` pair and counts the key.
    pub fn occupy(&mut self, bucket: u32, hash: u32, offset: u32) {
        self.set_hash(bucket, hash);
        self.set_store_offset(bucket, offset);
        self.num_stored_keys += 1;
    }

    /// Hash field of `bucket`.
    pub fn hash_at(&self, bucket: u32) -> u32 {
        self.read_u32(bucket as usize * BUCKET_SIZE)
    }

    pub fn set_hash(&mut self, bucket: u32, hash: u32) {
        self.write_u32(bucket as usize * BUCKET_SIZE, hash);
    }

    /// Store-offset field of `bucket`.
    pub fn store_offset_at(&self, bucket: u32) -> u32 {
        self.read_u32(bucket as usize * BUCKET_SIZE + 4)
    }

    pub fn set_store_offset(&mut self, bucket: u32, offset: u32) {
        self.write_u32(bucket as usize * BUCKET_SIZE + 4, offset);
    }

    /// Rehash-only insert: the key is known absent, deleted slots do not
    /// exist yet, so the first empty bucket is always correct.
    fn insert_rehashed(&mut self, hash: u32, offset: u32) {
        let mut bucket = hash & self.size_mask;
        while self.hash_at(bucket) != EMPTY_BUCKET {
            bucket = (bucket + 1) & self.size_mask;
        }
        self.occupy(bucket, hash, offset);
    }

    fn read_u32(&self, at: usize) -> u32 {
        let b = &self.buckets[at..at + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.buckets[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}
