use tracing_subscriber::EnvFilter;

use crate::hashing::fnv1a64;
use crate::pmap::{PMap, PMapConfig, PMapError};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tiny index so expansion paths are cheap to reach in tests.
pub fn small_index_config() -> PMapConfig {
    init_tracing();
    PMapConfig {
        initial_index_log2: 4,
        max_index_log2: 20,
        index_load_factor_pct: 75,
    }
}

/// Anonymous 64 KiB map with a small index.
pub fn anon_map() -> PMap {
    PMap::new_anonymous_with_config(64 * 1024, small_index_config()).unwrap()
}

/// Encodes a value: little-endian timestamp header followed by `payload`.
pub fn value(ts: i64, payload: &[u8]) -> Vec<u8> {
    let mut encoded = ts.to_le_bytes().to_vec();
    encoded.extend_from_slice(payload);
    encoded
}

/// Encodes a `cas` argument: expectations followed by the new pair.
pub fn cas_value(expected_ts: i64, expected_payload: Option<&[u8]>, ts: i64, payload: &[u8]) -> Vec<u8> {
    let mut encoded = expected_ts.to_le_bytes().to_vec();
    let expected_hash = fnv1a64(expected_payload.unwrap_or(b""));
    encoded.extend_from_slice(&expected_hash.to_le_bytes());
    encoded.extend_from_slice(&value(ts, payload));
    encoded
}

/// `set` with the hash computed the way callers do.
pub fn set(map: &mut PMap, key: &[u8], ts: i64, payload: &[u8]) -> Result<(), PMapError> {
    map.set(fnv1a64(key), key, &value(ts, payload))
}

/// `del` with the hash computed the way callers do.
pub fn del(map: &mut PMap, key: &[u8], ts: i64) -> Result<(), PMapError> {
    map.del(fnv1a64(key), key, &value(ts, b""))
}

/// `get` with the hash computed the way callers do.
pub fn get(map: &PMap, key: &[u8]) -> Option<Vec<u8>> {
    map.get(fnv1a64(key) as u32, key).unwrap()
}

/// Collects the live set yielded by `iterate` as `(key, value)` pairs.
pub fn collect(map: &PMap) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::new();
    map.iterate(|key, val| {
        pairs.push((key, val));
        true
    })
    .unwrap();
    pairs
}
