//! Throughput Benchmark for ShardCache
//!
//! This benchmark measures the performance of the cache engine
//! under various workloads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shardcache::{CacheConfig, CacheEngine};
use std::sync::Arc;
use std::time::Duration;

/// Engine that overwrites keys and vacuums often enough to keep up with the
/// dead space repeated sets leave behind.
fn engine() -> CacheEngine {
    CacheEngine::new(
        CacheConfig::default()
            .with_shard_count(64)
            .with_max_size(1 << 30)
            .with_vacuum_interval(Duration::from_millis(100))
            .with_force_set(true),
    )
    .expect("bench config is valid")
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let engine = engine();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.set(key, b"small_value")).ok();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 1024]; // 1KB value
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.set(key, &value)).ok();
            i += 1;
        });
    });

    group.bench_function("set_large", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 64 * 1024]; // 64KB value, larger than a page
        b.iter(|| {
            let key = format!("key:{}", i % 1_000);
            black_box(engine.set(key, &value)).ok();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let engine = engine();

    // Pre-populate with data
    for i in 0..100_000 {
        engine
            .set(format!("key:{}", i), format!("value:{}", i).as_bytes())
            .expect("pre-populate");
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.get(key, &mut buf)).ok();
            i += 1;
        });
    });

    group.bench_function("get_owned", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.get_owned(key)).ok();
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(engine.get(key, &mut buf)).ok();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark mixed workload (80% reads, 20% writes)
fn bench_mixed(c: &mut Criterion) {
    let engine = engine();

    // Pre-populate
    for i in 0..10_000 {
        engine
            .set(format!("key:{}", i), format!("value:{}", i).as_bytes())
            .expect("pre-populate");
    }

    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(1));

    group.bench_function("80_read_20_write", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            if i % 5 == 0 {
                // 20% writes
                black_box(engine.set(format!("new:{}", i % 10_000), b"value")).ok();
            } else {
                // 80% reads
                black_box(engine.get(format!("key:{}", i % 10_000), &mut buf)).ok();
            }
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let engine = Arc::new(engine());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        let mut buf = [0u8; 16];
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            engine.set(&key, b"value").ok();
                            engine.get(&key, &mut buf).ok();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(engine.stats().ok());
        });
    });

    group.finish();
}

/// Benchmark expiry and vacuum
fn bench_vacuum(c: &mut Criterion) {
    let mut group = c.benchmark_group("vacuum");

    group.bench_function("set_with_ttl", |b| {
        let engine = engine();
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.set_with_ttl(key, b"value", Duration::from_secs(3600))).ok();
            i += 1;
        });
    });

    group.bench_function("sweep_10k_expired", |b| {
        let engine = CacheEngine::new(
            CacheConfig::default()
                .with_shard_count(64)
                .with_max_size(1 << 28)
                .with_vacuum_interval(Duration::ZERO),
        )
        .expect("bench config is valid");

        b.iter(|| {
            for i in 0..10_000 {
                engine
                    .set_with_ttl(format!("short:{}", i), b"value", Duration::from_nanos(1))
                    .ok();
            }
            black_box(engine.vacuum().ok());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_mixed,
    bench_concurrent,
    bench_vacuum,
);

criterion_main!(benches);
