//! ShardCache - stress driver
//!
//! Builds a cache engine, runs a concurrent set/get/verify workload against
//! it, prints the engine statistics and closes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use shardcache::{CacheConfig, CacheEngine, CacheError, Verbosity};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Workload configuration
struct Options {
    /// Engine configuration, seeded from `SHARDCACHE_*` variables
    cache: CacheConfig,
    /// Distinct keys to write
    keys: usize,
    /// Concurrent workers
    workers: usize,
    /// Approximate size of each value
    value_size: usize,
    /// Raw verbosity level, checked before the engine is built
    verbose: i64,
}

impl Default for Options {
    fn default() -> Self {
        let cache = CacheConfig::from_env();
        let verbose = cache.verbosity as i64;
        Self {
            cache,
            keys: 100_000,
            workers: 8,
            value_size: 300,
            verbose,
        }
    }
}

impl Options {
    /// Parse options from command-line arguments
    fn from_args() -> Self {
        let mut options = Options::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--shards" | "-s" => {
                    options.cache.shard_count = parse_value(&args, i);
                    i += 2;
                }
                "--ttl-ms" => {
                    options.cache.ttl = Duration::from_millis(parse_value(&args, i));
                    i += 2;
                }
                "--vacuum-ms" => {
                    options.cache.vacuum_interval = Duration::from_millis(parse_value(&args, i));
                    i += 2;
                }
                "--max-size" | "-m" => {
                    options.cache.max_size = parse_value(&args, i);
                    i += 2;
                }
                "--keys" | "-k" => {
                    options.keys = parse_value(&args, i);
                    i += 2;
                }
                "--workers" | "-w" => {
                    options.workers = parse_value::<usize>(&args, i).max(1);
                    i += 2;
                }
                "--value-size" => {
                    options.value_size = parse_value(&args, i);
                    i += 2;
                }
                "--force-set" | "-f" => {
                    options.cache.force_set = true;
                    i += 1;
                }
                "--verbose" => {
                    options.verbose = parse_value(&args, i);
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("shardcache version {}", shardcache::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        options
    }
}

/// Parses the value following the flag at `i`, exiting on a missing or bad value.
fn parse_value<T: std::str::FromStr>(args: &[String], i: usize) -> T {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", args[i]);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value '{}' for {}", raw, args[i]);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
ShardCache - An Embedded, Sharded Byte Cache (stress driver)

USAGE:
    shardcache [OPTIONS]

OPTIONS:
    -s, --shards <N>          Shard count, a power of two (default: 1024)
        --ttl-ms <MS>         Entry lifetime in milliseconds (default: 60000)
        --vacuum-ms <MS>      Vacuum period in milliseconds, 0 disables (default: 600000)
    -m, --max-size <BYTES>    Size budget, 0 picks half of available memory (default: 0)
    -k, --keys <N>            Distinct keys to write (default: 100000)
    -w, --workers <N>         Concurrent workers (default: 8)
        --value-size <BYTES>  Approximate value size (default: 300)
    -f, --force-set           Overwrite live keys instead of failing
        --verbose <0-6>       Diagnostic verbosity (default: 0)
    -v, --version             Print version information
    -h, --help                Print this help message

ENVIRONMENT:
    SHARDCACHE_SHARDS, SHARDCACHE_TTL_MS, SHARDCACHE_VACUUM_MS,
    SHARDCACHE_MAX_SIZE, SHARDCACHE_PAGE_SIZE, SHARDCACHE_FORCE_SET,
    SHARDCACHE_VERBOSE seed the defaults above.

EXAMPLES:
    shardcache --shards 8 --max-size 10485760 --keys 1000
    shardcache --workers 32 --value-size 4096 --verbose 4
"#
    );
}

/// Counts from one worker
#[derive(Debug, Default)]
struct WorkerReport {
    written: u64,
    no_space: u64,
    exists: u64,
    verified: u64,
    mismatched: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.written += other.written;
        self.no_space += other.no_space;
        self.exists += other.exists;
        self.verified += other.verified;
        self.mismatched += other.mismatched;
    }
}

/// A JSON document of roughly `size` bytes, unique to `index`.
fn payload(index: usize, size: usize) -> Vec<u8> {
    let mut value = format!(r#"{{"id":{},"payload":""#, index).into_bytes();
    let tail = br#""}"#;
    let fill = size.saturating_sub(value.len() + tail.len());
    value.extend(std::iter::repeat(b'a' + (index % 26) as u8).take(fill));
    value.extend_from_slice(tail);
    value
}

/// Writes every `workers`-th key starting at `worker`, then reads each back.
fn run_worker(
    cache: &CacheEngine,
    worker: usize,
    workers: usize,
    keys: usize,
    value_size: usize,
) -> anyhow::Result<WorkerReport> {
    let mut report = WorkerReport::default();
    let mut buf = vec![0u8; value_size.max(64) * 2];

    for index in (worker..keys).step_by(workers) {
        let key = format!("key:{}", index);
        match cache.set(&key, &payload(index, value_size)) {
            Ok(()) => report.written += 1,
            Err(CacheError::NoSpace { .. }) => report.no_space += 1,
            Err(CacheError::KeyExists) => report.exists += 1,
            Err(err) => return Err(err).with_context(|| format!("set {}", key)),
        }
    }

    for index in (worker..keys).step_by(workers) {
        let key = format!("key:{}", index);
        match cache.get(&key, &mut buf) {
            Ok(n) if buf[..n] == payload(index, value_size)[..] => report.verified += 1,
            Ok(_) => report.mismatched += 1,
            Err(err) if err.is_miss() => {}
            Err(err) => return Err(err).with_context(|| format!("get {}", key)),
        }
    }

    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let mut options = Options::from_args();
    options.cache.verbosity = Verbosity::from_level(options.verbose)?;

    // Set up logging; RUST_LOG narrows or widens what --verbose picked
    let filter = EnvFilter::builder()
        .with_default_directive(options.cache.verbosity.level_filter().into())
        .from_env_lossy();
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let cache = Arc::new(CacheEngine::new(options.cache.clone()).context("building cache")?);
    let config = cache.config();
    println!(
        "ShardCache v{} - {} shards, ttl {:?}, vacuum {:?}, force_set {}",
        shardcache::VERSION,
        config.shard_count,
        config.ttl,
        config.vacuum_interval,
        config.force_set
    );
    println!(
        "Writing {} keys of ~{} bytes with {} workers",
        options.keys, options.value_size, options.workers
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..options.workers)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            let (workers, keys, value_size) = (options.workers, options.keys, options.value_size);
            tokio::task::spawn_blocking(move || {
                run_worker(&cache, worker, workers, keys, value_size)
            })
        })
        .collect();

    let mut totals = WorkerReport::default();
    for handle in handles {
        totals.merge(handle.await??);
    }
    let elapsed = started.elapsed();

    if totals.no_space > 0 {
        warn!(rejected = totals.no_space, "size budget exhausted during the run");
    }
    info!(elapsed_ms = elapsed.as_millis() as u64, "workload finished");

    let sweep = cache.vacuum()?;
    let stats = cache.stats()?;

    println!("──────────────────────────────────────────────");
    println!("elapsed           {:?}", elapsed);
    println!("written           {}", totals.written);
    println!("verified          {}", totals.verified);
    println!("mismatched        {}", totals.mismatched);
    println!("rejected NoSpace  {}", totals.no_space);
    println!("rejected exists   {}", totals.exists);
    println!("entries           {}", stats.entries);
    println!("pages             {} (+{} pooled)", stats.pages, stats.pooled_pages);
    println!("resident bytes    {} / {}", stats.resident_bytes, stats.max_size);
    println!("live bytes        {}", stats.live_bytes);
    println!("hit rate          {:.2}%", stats.hit_rate() * 100.0);
    println!(
        "background        {} expiry, {} vacuum passes",
        stats.expiry_passes, stats.vacuum_passes
    );
    println!(
        "vacuum            {} expired, {} pages reclaimed",
        sweep.totals.expired, sweep.totals.pages_reclaimed
    );

    cache.close()?;

    if totals.mismatched > 0 {
        anyhow::bail!("{} values did not match what was written", totals.mismatched);
    }
    Ok(())
}
