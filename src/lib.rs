//! # shardmap
//!
//! A **persistent key-value map** (`PMap`) designed as the per-shard storage
//! primitive of a distributed NoSQL database. Each map is a log-structured,
//! memory-mapped byte store indexed by an in-memory open-addressed hash
//! table, with **timestamped last-write-wins** conflict resolution, a
//! **tombstoned delete** discipline, a **compare-and-swap** primitive, and a
//! **commutative running checksum** that lets two replicas compare their
//! content without scanning it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                        PMap                           │
//! │  ┌──────────────┐   ┌──────────────┐  ┌────────────┐  │
//! │  │    Index     │   │    Store     │  │  Checksum  │  │
//! │  │  (RAM-only   │──►│  (mmap log   │  │ (XOR over  │  │
//! │  │   buckets)   │   │   of frames) │  │  live set) │  │
//! │  └──────────────┘   └──────────────┘  └────────────┘  │
//! │          ▲                                            │
//! │          └── rebuilt from the log on open             │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`pmap`] | The map façade — get, set, del, cas, iterate, checksum, lifecycle |
//! | [`store`] | Append-only record log held in a memory-mapped file |
//! | [`index`] | Open-addressed hash table mapping key hashes to log offsets |
//! | [`checksum`] | Order-independent digest over the live record set |
//! | [`hashing`] | FNV-1a 64-bit hash and shard routing helper |
//!
//! ## Key properties
//!
//! - **Last-write-wins** — every value carries an 8-byte nanosecond
//!   timestamp header; older writes are silently discarded, ties keep the
//!   stored record.
//! - **Crash-recoverable** — the index is rebuilt exactly by replaying the
//!   log on [`PMap::open`].
//! - **Anti-entropy ready** — [`PMap::checksum`] is invariant under
//!   reordering of the operations that produced the live set, so replicas
//!   can compare content in O(1).
//! - **Not thread-safe** — a `PMap` expects external serialization; the
//!   containing system holds one lock per map.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shardmap::hashing::fnv1a64;
//! use shardmap::PMap;
//!
//! let mut map = PMap::new("/tmp/shard-0.dat", 1 << 20).unwrap();
//!
//! // Values start with a little-endian i64 nanosecond timestamp.
//! let mut value = 1_000i64.to_le_bytes().to_vec();
//! value.extend_from_slice(b"payload");
//!
//! let h = fnv1a64(b"key");
//! map.set(h, b"key", &value).unwrap();
//! assert_eq!(map.get(h as u32, b"key").unwrap().as_deref(), Some(&value[..]));
//!
//! map.close().unwrap();
//! ```

pub mod checksum;
pub mod hashing;
pub mod index;
pub mod pmap;
pub mod store;

pub use index::IndexError;
pub use pmap::{PMap, PMapConfig, PMapError};
pub use store::StoreError;
