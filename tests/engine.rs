//! End-to-end tests of the cache engine through its public API.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use shardcache::{CacheConfig, CacheEngine, CacheError};
use tokio_test::{assert_err, assert_ok};

fn config() -> CacheConfig {
    CacheConfig::new(Duration::from_secs(60))
        .with_shard_count(8)
        .with_max_size(10 * 1024 * 1024)
        .with_vacuum_interval(Duration::ZERO)
}

fn engine() -> CacheEngine {
    CacheEngine::new(config()).unwrap()
}

#[test]
fn test_set_get_300_byte_json() {
    let cache = engine();
    let json = format!(
        r#"{{"id":"k1","name":"alice","email":"alice@example.com","tags":["a","b","c"],"bio":"{}"}}"#,
        "x".repeat(216)
    );
    assert_eq!(json.len(), 300);

    assert_ok!(cache.set("k1", json.as_bytes()));

    let mut buf = vec![0u8; 1024];
    let n = assert_ok!(cache.get("k1", &mut buf));
    assert_eq!(n, 300);
    assert_eq!(&buf[..n], json.as_bytes());
}

#[test]
fn test_embedded_zero_bytes_round_trip() {
    let cache = engine();
    let data = b"\0head\0\0middle\0tail\0";

    cache.set("zeros", data).unwrap();

    let mut buf = [0xAAu8; 64];
    let n = cache.get("zeros", &mut buf).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(&buf[..n], data);
}

#[test]
fn test_empty_value() {
    let cache = engine();
    cache.set("empty", b"").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(cache.get("empty", &mut buf), Ok(0));
    assert_eq!(cache.get_owned("empty"), Ok(Bytes::new()));
}

#[test]
fn test_never_written_key() {
    let cache = engine();
    let mut buf = [0u8; 8];
    assert_eq!(cache.get("ghost", &mut buf), Err(CacheError::KeyNotFound));
    assert_eq!(cache.entry_len("ghost"), Err(CacheError::KeyNotFound));
}

#[test]
fn test_double_set_without_overwrite() {
    let cache = engine();
    cache.set("k", b"first").unwrap();

    let err = assert_err!(cache.set("k", b"second"));
    assert_eq!(err, CacheError::KeyExists);
    assert_eq!(err.code(), 6);
    assert_eq!(cache.get_owned("k").unwrap(), Bytes::from("first"));
}

#[test]
fn test_double_set_with_overwrite() {
    let cache = CacheEngine::new(config().with_force_set(true)).unwrap();
    cache.set("k", b"first").unwrap();
    cache.set("k", b"second").unwrap();

    assert_eq!(cache.get_owned("k").unwrap(), Bytes::from("second"));
    assert_eq!(cache.stats().unwrap().entries, 1);
}

#[test]
fn test_short_ttl_never_returns_stale_bytes() {
    let cache = engine();
    cache
        .set_with_ttl("brief", b"stale", Duration::from_millis(1))
        .unwrap();
    thread::sleep(Duration::from_millis(10));

    let mut buf = [0u8; 16];
    let err = cache.get("brief", &mut buf).unwrap_err();
    assert!(
        matches!(err, CacheError::KeyExpired | CacheError::KeyNotFound),
        "unexpected {:?}",
        err
    );
    assert_eq!(cache.get("brief", &mut buf), Err(CacheError::KeyNotFound));
}

#[test]
fn test_config_ttl_applies_to_set() {
    let cache = CacheEngine::new(config().with_ttl(Duration::from_millis(1))).unwrap();
    cache.set("brief", b"v").unwrap();
    thread::sleep(Duration::from_millis(10));

    assert!(cache.get_owned("brief").unwrap_err().is_miss());
}

#[test]
fn test_undersized_buffer() {
    let cache = engine();
    let data = vec![42u8; 100];
    cache.set("big", &data).unwrap();

    let mut small = [0u8; 10];
    let err = cache.get("big", &mut small).unwrap_err();
    assert_eq!(
        err,
        CacheError::BufLenLow {
            required: 100,
            capacity: 10
        }
    );
    assert_eq!(err.code(), 7);

    let mut buf = vec![0u8; cache.entry_len("big").unwrap()];
    assert_eq!(cache.get("big", &mut buf), Ok(100));
    assert_eq!(buf, data);
}

#[test]
fn test_delete() {
    let cache = engine();
    cache.set("k", b"v").unwrap();

    assert_eq!(cache.delete("k"), Ok(true));
    assert_eq!(cache.delete("k"), Ok(false));
    assert_eq!(cache.get_owned("k"), Err(CacheError::KeyNotFound));

    // the key can be written again
    cache.set("k", b"again").unwrap();
    assert_eq!(cache.get_owned("k").unwrap(), Bytes::from("again"));
}

#[test]
fn test_budget_never_exceeded() {
    let max = 4096;
    let cache = CacheEngine::new(
        config()
            .with_shard_count(1)
            .with_max_size(max)
            .with_page_size(1024),
    )
    .unwrap();

    let value = [7u8; 100];
    let mut written = 0;
    let overflow = loop {
        let key = format!("k{}", written);
        match cache.set(&key, &value) {
            Ok(()) => written += 1,
            Err(err) => break (key, err),
        }
        assert!(cache.stats().unwrap().resident_bytes <= max);
    };

    // ten 100-byte entries per 1 KiB page, four pages
    assert_eq!(written, 40);
    assert!(matches!(overflow.1, CacheError::NoSpace { .. }));
    assert_eq!(overflow.1.code(), 2);

    let stats = cache.stats().unwrap();
    assert_eq!(stats.resident_bytes, max);
    assert_eq!(stats.entries, 40);
    assert_eq!(cache.get_owned(&overflow.0), Err(CacheError::KeyNotFound));
    assert_eq!(cache.get_owned("k0").unwrap(), Bytes::copy_from_slice(&value));
}

#[test]
fn test_vacuum_returns_space_to_budget() {
    let cache = CacheEngine::new(
        config()
            .with_shard_count(1)
            .with_max_size(4096)
            .with_page_size(1024),
    )
    .unwrap();

    for i in 0..40 {
        cache
            .set_with_ttl(format!("k{}", i), &[1u8; 100], Duration::from_millis(1))
            .unwrap();
    }
    assert!(matches!(
        cache.set("late", &[1u8; 100]),
        Err(CacheError::NoSpace { .. })
    ));
    thread::sleep(Duration::from_millis(10));

    let report = cache.vacuum().unwrap();
    assert_eq!(report.totals.expired, 40);
    // the emptied active page goes too
    assert_eq!(report.totals.pages_reclaimed, 4);
    assert_eq!(report.totals.bytes_released, 4 * 1024);
    assert_eq!(cache.stats().unwrap().resident_bytes, 0);

    assert_ok!(cache.set("late", &[1u8; 100]));
    assert_eq!(cache.stats().unwrap().resident_bytes, 1024);
}

#[test]
fn test_emptied_cache_accepts_writes_again() {
    let cache = CacheEngine::new(
        config()
            .with_shard_count(2)
            .with_max_size(256)
            .with_page_size(64),
    )
    .unwrap();

    let mut written = Vec::new();
    let mut exhausted = false;
    for i in 0..1000 {
        let key = format!("fill{}", i);
        match cache.set(&key, &[1u8; 20]) {
            Ok(()) => written.push(key),
            Err(CacheError::NoSpace { .. }) => {
                exhausted = true;
                break;
            }
            Err(err) => panic!("unexpected {:?}", err),
        }
    }
    assert!(exhausted);

    for key in &written {
        assert_eq!(cache.delete(key), Ok(true));
    }
    assert_ok!(cache.vacuum());

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(stats.pages, 0);
    assert_eq!(stats.resident_bytes, 0);

    // pooled buffers hold no budget, so either shard can take all of it
    let failures = (0..50)
        .filter(|i| cache.set(format!("again{}", i), b"abc").is_err())
        .count();
    assert_eq!(failures, 0);
    assert_eq!(cache.stats().unwrap().entries, 50);
}

#[test]
fn test_concurrent_writers_stay_consistent() {
    const THREADS: usize = 8;
    const KEYS: usize = 500;
    const ROUNDS: usize = 4;

    let cache = Arc::new(CacheEngine::new(config().with_force_set(true)).unwrap());

    // each thread owns its keys, rewriting them every round
    let expected: Vec<HashMap<String, Vec<u8>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    let mut last = HashMap::new();
                    let mut buf = vec![0u8; 256];
                    for round in 0..ROUNDS {
                        for i in 0..KEYS {
                            let key = format!("t{}:k{}", t, i);
                            let value = format!("{}:{}:{}", t, i, round).repeat(1 + i % 7);
                            cache.set(&key, value.as_bytes()).unwrap();

                            let n = cache.get(&key, &mut buf).unwrap();
                            assert_eq!(&buf[..n], value.as_bytes());
                            last.insert(key, value.into_bytes());
                        }
                    }
                    last
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut buf = vec![0u8; 256];
    let mut checked = 0;
    for owned in &expected {
        for (key, value) in owned {
            let n = cache.get(key, &mut buf).unwrap();
            assert_eq!(checksum(&buf[..n]), checksum(value), "key {}", key);
            checked += 1;
        }
    }
    assert_eq!(checked, THREADS * KEYS);
    assert_eq!(cache.stats().unwrap().entries, THREADS * KEYS);
}

#[test]
fn test_concurrent_readers_and_vacuum() {
    let cache = Arc::new(
        CacheEngine::new(config().with_vacuum_interval(Duration::from_millis(1))).unwrap(),
    );
    for i in 0..200 {
        cache.set(format!("live{}", i), b"steady").unwrap();
    }

    thread::scope(|scope| {
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                let mut buf = [0u8; 16];
                for round in 0..200 {
                    let short = format!("short{}:{}", t, round);
                    cache
                        .set_with_ttl(&short, b"gone", Duration::from_micros(50))
                        .unwrap();
                    let n = cache.get(format!("live{}", round), &mut buf).unwrap();
                    assert_eq!(&buf[..n], b"steady");
                }
            });
        }
    });

    assert_eq!(cache.stats().unwrap().degraded_shards, 0);
}

#[test]
fn test_close_while_busy() {
    let cache = Arc::new(
        CacheEngine::new(
            config()
                .with_force_set(true)
                .with_vacuum_interval(Duration::from_millis(1)),
        )
        .unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut buf = [0u8; 32];
                let mut rounds = 0u64;
                loop {
                    let key = format!("busy{}:{}", t, rounds % 64);
                    let value = format!("value{}", rounds);
                    let set = cache.set(&key, value.as_bytes());
                    let get = cache.get(&key, &mut buf).map(|n| {
                        assert_eq!(&buf[..n], value.as_bytes());
                    });
                    for result in [set, get] {
                        match result {
                            Ok(()) => {}
                            Err(CacheError::CacheClosed) => return rounds,
                            Err(err) => panic!("worker {} round {}: {:?}", t, rounds, err),
                        }
                    }
                    rounds += 1;
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert_ok!(cache.close());

    let rounds: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(rounds > 0);
    assert_eq!(cache.stats(), Err(CacheError::CacheClosed));
    assert_eq!(cache.vacuum(), Err(CacheError::CacheClosed));
}

#[test]
fn test_close_twice() {
    let cache = engine();
    cache.set("k", b"v").unwrap();

    assert_ok!(cache.close());
    let err = assert_err!(cache.close());
    assert_eq!(err, CacheError::CacheClosed);

    let mut buf = [0u8; 4];
    assert_eq!(cache.get("k", &mut buf), Err(CacheError::CacheClosed));
    assert_eq!(cache.vacuum(), Err(CacheError::CacheClosed));
}

#[test]
fn test_from_raw_config() {
    let config = CacheConfig::from_raw(8, 60_000_000_000, 0, 10 * 1024 * 1024, false, 0).unwrap();
    let cache = CacheEngine::new(config).unwrap();

    cache.set("k1", b"value").unwrap();
    assert_eq!(cache.get_owned("k1").unwrap(), Bytes::from("value"));

    let err = CacheConfig::from_raw(6, 60_000_000_000, 0, 0, false, 0).unwrap_err();
    assert_eq!(err.code(), 9);
}

#[tokio::test]
async fn test_engine_inside_runtime() {
    let cache = Arc::new(
        CacheEngine::new(config().with_vacuum_interval(Duration::from_millis(5))).unwrap(),
    );
    cache
        .set_with_ttl("brief", b"v", Duration::from_millis(1))
        .unwrap();
    cache.set("stays", b"v").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 1);
    assert!(stats.vacuum_passes > 0);

    let worker = Arc::clone(&cache);
    let value = tokio::task::spawn_blocking(move || worker.get_owned("stays"))
        .await
        .unwrap();
    assert_eq!(value, Ok(Bytes::from("v")));
    cache.close().unwrap();
}

fn checksum(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[derive(Debug, Clone)]
enum Op {
    Set { key: u8, value: Vec<u8> },
    Get { key: u8 },
    Delete { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), prop::collection::vec(any::<u8>(), 0..512))
            .prop_map(|(key, value)| Op::Set { key, value }),
        any::<u8>().prop_map(|key| Op::Get { key }),
        any::<u8>().prop_map(|key| Op::Delete { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_binary_round_trip(
        key in prop::collection::vec(any::<u8>(), 0..64),
        value in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let cache = CacheEngine::new(config().with_shard_count(4)).unwrap();
        cache.set(&key, &value).unwrap();

        let mut buf = vec![0u8; value.len()];
        let n = cache.get(&key, &mut buf).unwrap();
        prop_assert_eq!(n, value.len());
        prop_assert_eq!(buf, value);
    }

    #[test]
    fn prop_matches_model(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let cache = CacheEngine::new(config().with_shard_count(4).with_force_set(true)).unwrap();
        let mut model: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut hits = 0u64;
        let mut misses = 0u64;

        for op in ops {
            match op {
                Op::Set { key, value } => {
                    cache.set([key], &value).unwrap();
                    model.insert(key, value);
                }
                Op::Get { key } => match (cache.get_owned([key]), model.get(&key)) {
                    (Ok(bytes), Some(expected)) => {
                        prop_assert_eq!(&bytes[..], &expected[..]);
                        hits += 1;
                    }
                    (Err(CacheError::KeyNotFound), None) => misses += 1,
                    (got, want) => prop_assert!(false, "got {:?}, model has {:?}", got, want),
                },
                Op::Delete { key } => {
                    prop_assert_eq!(cache.delete([key]).unwrap(), model.remove(&key).is_some());
                }
            }
        }

        let stats = cache.stats().unwrap();
        prop_assert_eq!(stats.entries, model.len());
        prop_assert_eq!(stats.hits, hits);
        prop_assert_eq!(stats.misses, misses);
    }
}
