//! Randomized workloads pitting a `PMap` against an in-memory model.
//!
//! Each test drives a map with a pseudo-random operation stream, mirrors
//! the expected outcome into a `HashMap` model applying the same
//! last-write-wins rules, and checks full agreement — then closes, reopens,
//! and checks agreement again.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use shardmap::hashing::fnv1a64;
use shardmap::{PMap, PMapConfig};

fn small_config() -> PMapConfig {
    PMapConfig {
        initial_index_log2: 4,
        max_index_log2: 20,
        index_load_factor_pct: 75,
    }
}

fn value(ts: i64, payload: &[u8]) -> Vec<u8> {
    let mut encoded = ts.to_le_bytes().to_vec();
    encoded.extend_from_slice(payload);
    encoded
}

fn stored_ts(val: &[u8]) -> i64 {
    i64::from_le_bytes(val[..8].try_into().unwrap())
}

/// Applies one LWW operation to both the map and the model.
fn apply(
    map: &mut PMap,
    model: &mut HashMap<Vec<u8>, Vec<u8>>,
    key: Vec<u8>,
    ts: i64,
    payload: Option<&[u8]>,
) {
    let h = fnv1a64(&key);
    match payload {
        Some(payload) => {
            let val = value(ts, payload);
            map.set(h, &key, &val).unwrap();
            match model.get(&key) {
                Some(stored) if stored_ts(stored) >= ts => {}
                _ => {
                    model.insert(key, val);
                }
            }
        }
        None => {
            map.del(h, &key, &value(ts, b"")).unwrap();
            if let Some(stored) = model.get(&key) {
                if ts >= stored_ts(stored) {
                    model.remove(&key);
                }
            }
        }
    }
}

fn assert_agrees(map: &PMap, model: &HashMap<Vec<u8>, Vec<u8>>, universe: &[Vec<u8>]) {
    for key in universe {
        assert_eq!(
            map.get(fnv1a64(key) as u32, key).unwrap().as_ref(),
            model.get(key),
            "disagreement on key {key:?}"
        );
    }
    let mut yielded = 0usize;
    map.iterate(|key, val| {
        assert_eq!(model.get(&key), Some(&val));
        yielded += 1;
        true
    })
    .unwrap();
    assert_eq!(yielded, model.len());
}

/// # Scenario
/// 2000 random sets and deletes over a 64-key universe with shuffled
/// timestamps, then a close/open cycle.
///
/// # Expected behavior
/// The map agrees with the model on every key before and after reopening,
/// and the checksum survives the round trip.
#[test]
fn random_workload_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shard.dat");
    let mut map = PMap::with_config(&path, 1 << 20, small_config()).unwrap();
    let mut model = HashMap::new();

    let universe: Vec<Vec<u8>> = (0..64u32)
        .map(|i| format!("key-{i:02}").into_bytes())
        .collect();

    for _ in 0..2_000 {
        let key = universe[rng.random_range(0..universe.len())].clone();
        let ts = rng.random_range(1..=10_000i64);
        if rng.random_bool(0.8) {
            let payload = vec![rng.random::<u8>(); rng.random_range(0..32)];
            apply(&mut map, &mut model, key, ts, Some(&payload));
        } else {
            apply(&mut map, &mut model, key, ts, None);
        }
    }

    assert_agrees(&map, &model, &universe);
    let checksum = map.checksum();
    map.close().unwrap();

    let reopened = PMap::open_with_config(&path, small_config()).unwrap();
    assert_eq!(reopened.checksum(), checksum);
    assert_agrees(&reopened, &model, &universe);
}

/// # Scenario
/// Two replicas receive the same per-key operation streams, interleaved
/// across keys in independently random orders. Per-key delivery order is
/// preserved: a delete reordered ahead of an earlier set on its key would
/// degenerate to an absent-key no-op that records no tombstone, and the
/// replicas would legitimately diverge.
///
/// # Expected behavior
/// Both replicas converge: same values, same checksum.
#[test]
fn shuffled_replicas_converge() {
    use rand::seq::SliceRandom;

    let mut rng = StdRng::seed_from_u64(42);
    let universe: Vec<Vec<u8>> = (0..32u32)
        .map(|i| format!("key-{i:02}").into_bytes())
        .collect();

    // Per-key operation streams with globally unique timestamps.
    let mut streams: Vec<Vec<(i64, Option<Vec<u8>>)>> = vec![Vec::new(); universe.len()];
    for ts in 1..=600i64 {
        let slot = rng.random_range(0..universe.len());
        if rng.random_bool(0.75) {
            streams[slot].push((ts, Some(format!("v{ts}").into_bytes())));
        } else {
            streams[slot].push((ts, None));
        }
    }

    let mut replicas = Vec::new();
    for _ in 0..2 {
        // Random interleaving that preserves each stream's order: shuffle
        // a deck holding one card per pending operation, then deal each
        // card as the next undelivered operation of its stream.
        let mut deck: Vec<usize> = streams
            .iter()
            .enumerate()
            .flat_map(|(slot, stream)| std::iter::repeat(slot).take(stream.len()))
            .collect();
        deck.shuffle(&mut rng);

        let mut map = PMap::new_anonymous_with_config(1 << 20, small_config()).unwrap();
        let mut model = HashMap::new();
        let mut cursors = vec![0usize; streams.len()];
        for slot in deck {
            let (ts, payload) = &streams[slot][cursors[slot]];
            cursors[slot] += 1;
            apply(
                &mut map,
                &mut model,
                universe[slot].clone(),
                *ts,
                payload.as_deref(),
            );
        }
        assert_agrees(&map, &model, &universe);
        replicas.push((map, model));
    }

    let (left, left_model) = &replicas[0];
    let (right, right_model) = &replicas[1];
    assert_eq!(left_model, right_model);
    assert_eq!(left.checksum(), right.checksum());
    for key in &universe {
        assert_eq!(
            left.get(fnv1a64(key) as u32, key).unwrap(),
            right.get(fnv1a64(key) as u32, key).unwrap(),
        );
    }
}

/// Deleted space only grows, and `used` never exceeds the fixed size.
#[test]
fn space_counters_are_monotone() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut map = PMap::new_anonymous_with_config(1 << 18, small_config()).unwrap();
    let mut model = HashMap::new();

    let universe: Vec<Vec<u8>> = (0..16u32).map(|i| format!("k{i}").into_bytes()).collect();
    let (mut last_used, mut last_deleted) = (0usize, 0usize);
    for ts in 1..=500i64 {
        let key = universe[rng.random_range(0..universe.len())].clone();
        if rng.random_bool(0.7) {
            apply(&mut map, &mut model, key, ts, Some(b"payload"));
        } else {
            apply(&mut map, &mut model, key, ts, None);
        }
        assert!(map.used() >= last_used);
        assert!(map.deleted() >= last_deleted);
        assert!(map.used() <= map.size());
        assert!(map.deleted() <= map.used());
        last_used = map.used();
        last_deleted = map.deleted();
    }
}
