//! Vacuum Scheduler
//!
//! Lazy expiry only removes entries that are read again. Entries that expire
//! and are never touched, and the pages holding them, are cleaned up in the
//! background by two passes:
//!
//! - the **expiry pass** runs [`Shard::expire`] on every shard once per
//!   configured TTL, dropping expired entries and the pages they emptied
//! - the **vacuum pass** runs [`Shard::vacuum`] on the vacuum interval, which
//!   also checks every remaining entry against its page
//!
//! ## Design
//!
//! The scheduler is a Tokio task that:
//! 1. Waits for the next expiry or vacuum tick, or until it is told to stop
//! 2. Visits each shard sequentially, holding only that shard's lock
//! 3. Skips degraded shards and logs failing ones without stopping
//! 4. Warns when a vacuum pass took longer than the interval
//!
//! A zero vacuum interval disables only the vacuum pass.
//!
//! When the engine is created inside a Tokio runtime the task is spawned on
//! that runtime. Otherwise a dedicated thread drives a current-thread runtime.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle};
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Verbosity;
use crate::error::{CacheError, Result};
use crate::storage::engine::Core;
use crate::storage::router::ShardRouter;
use crate::storage::shard::{Shard, VacuumReport};

/// Shortest period between expiry passes, however small the TTL.
pub const MIN_EXPIRY_PERIOD: Duration = Duration::from_millis(1);

/// Outcome of one expiry or vacuum pass over every shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Totals over the shards that were swept cleanly
    pub totals: VacuumReport,
    /// Shards whose pass succeeded
    pub shards_vacuumed: usize,
    /// Degraded shards that were not visited
    pub shards_skipped: usize,
    /// Shards whose pass reported an error
    pub shards_failed: usize,
    pub elapsed: Duration,
}

/// Runs one vacuum pass over every shard of `router`.
///
/// A failing shard never stops the pass.
pub fn sweep(router: &ShardRouter, verbosity: Verbosity) -> SweepReport {
    visit(router, verbosity, "vacuum", Shard::vacuum)
}

/// Runs one expiry pass over every shard of `router`.
pub fn expire(router: &ShardRouter, verbosity: Verbosity) -> SweepReport {
    visit(router, verbosity, "expiry", Shard::expire)
}

fn visit<F>(router: &ShardRouter, verbosity: Verbosity, pass: &str, run: F) -> SweepReport
where
    F: Fn(&Shard) -> Result<VacuumReport>,
{
    let started = Instant::now();
    let mut report = SweepReport::default();

    for shard in router.shards() {
        if shard.is_degraded() {
            report.shards_skipped += 1;
            continue;
        }
        match run(shard) {
            Ok(shard_report) => {
                report.totals.merge(&shard_report);
                report.shards_vacuumed += 1;
            }
            Err(CacheError::CacheClosed) => break,
            Err(err) => {
                report.shards_failed += 1;
                log_failure(shard, pass, &err, verbosity);
            }
        }
    }

    report.elapsed = started.elapsed();
    report
}

fn log_failure(shard: &Shard, pass: &str, err: &CacheError, verbosity: Verbosity) {
    if verbosity.includes(Verbosity::Error) {
        error!(
            shard = shard.id(),
            pass,
            degraded = shard.is_degraded(),
            error = %err,
            "background pass failed"
        );
    }
}

/// When the background passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Schedule {
    /// Period of the expiry pass
    pub expiry: Duration,
    /// Period of the vacuum pass, `None` when disabled
    pub vacuum: Option<Duration>,
}

impl Schedule {
    pub(crate) fn new(ttl: Duration, vacuum_interval: Duration) -> Self {
        Self {
            expiry: ttl.max(MIN_EXPIRY_PERIOD),
            vacuum: (!vacuum_interval.is_zero()).then_some(vacuum_interval),
        }
    }
}

/// A handle to the running background passes.
///
/// Dropping the handle stops them.
#[derive(Debug)]
pub struct VacuumScheduler {
    shutdown_tx: watch::Sender<bool>,
    /// Set when the loop runs on its own thread
    thread: Option<JoinHandle<()>>,
    verbosity: Verbosity,
}

impl VacuumScheduler {
    /// Starts the expiry and vacuum passes over `core`.
    pub(crate) fn start(core: Arc<Core>, schedule: Schedule) -> Result<Self> {
        let verbosity = core.config().verbosity;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread = match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(vacuum_loop(core, schedule, shutdown_rx));
                None
            }
            Err(_) => {
                let runtime = Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(|e| {
                        CacheError::Internal(format!("failed to build vacuum runtime: {}", e))
                    })?;
                let thread = std::thread::Builder::new()
                    .name("shardcache-vacuum".into())
                    .spawn(move || runtime.block_on(vacuum_loop(core, schedule, shutdown_rx)))
                    .map_err(|e| {
                        CacheError::Internal(format!("failed to spawn vacuum thread: {}", e))
                    })?;
                Some(thread)
            }
        };

        if verbosity.includes(Verbosity::Debug1) {
            info!(
                expiry_ms = schedule.expiry.as_millis() as u64,
                vacuum_ms = schedule.vacuum.map(|v| v.as_millis() as u64),
                dedicated_thread = thread.is_some(),
                "vacuum scheduler started"
            );
        }

        Ok(Self {
            shutdown_tx,
            thread,
            verbosity,
        })
    }

    /// Stops both passes, waiting for the thread if there is one.
    ///
    /// A pass already in progress runs to completion.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if self.verbosity.includes(Verbosity::Debug1) {
            info!("vacuum scheduler stopped");
        }
    }
}

impl Drop for VacuumScheduler {
    fn drop(&mut self) {
        if !*self.shutdown_tx.borrow() {
            self.stop();
        }
    }
}

/// Fires every `period`, starting one period from now.
fn ticker(period: Duration) -> Interval {
    let mut timer = time::interval_at(time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Waits for the next tick, or forever when there is no timer.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum Pass {
    Expiry,
    Vacuum,
}

async fn vacuum_loop(core: Arc<Core>, schedule: Schedule, mut shutdown_rx: watch::Receiver<bool>) {
    let verbosity = core.config().verbosity;
    let mut expiry_timer = ticker(schedule.expiry);
    let mut vacuum_timer = schedule.vacuum.map(ticker);

    loop {
        let pass = tokio::select! {
            _ = expiry_timer.tick() => Pass::Expiry,
            _ = next_tick(&mut vacuum_timer) => Pass::Vacuum,
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    if verbosity.includes(Verbosity::Debug2) {
                        debug!("vacuum received shutdown signal");
                    }
                    return;
                }
                continue;
            }
        };

        if core.is_closed() {
            return;
        }

        match pass {
            Pass::Expiry => {
                let report = core.expire();
                if verbosity.includes(Verbosity::Debug2) && report.totals.expired > 0 {
                    debug!(
                        expired = report.totals.expired,
                        pages = report.totals.pages_reclaimed,
                        failed = report.shards_failed,
                        elapsed_us = report.elapsed.as_micros() as u64,
                        "expiry pass complete"
                    );
                }
            }
            Pass::Vacuum => {
                let report = core.sweep();
                let interval = schedule.vacuum.unwrap_or_default();

                if report.elapsed > interval && verbosity.includes(Verbosity::Warning) {
                    warn!(
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        "vacuum pass took longer than its interval"
                    );
                }
                if verbosity.includes(Verbosity::Debug2) {
                    debug!(
                        expired = report.totals.expired,
                        pages = report.totals.pages_reclaimed,
                        bytes = report.totals.bytes_released,
                        skipped = report.shards_skipped,
                        failed = report.shards_failed,
                        elapsed_us = report.elapsed.as_micros() as u64,
                        "vacuum pass complete"
                    );
                }
            }
        }
    }
}
