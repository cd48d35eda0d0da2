//! Self-perpetuating retry scheduler.
//!
//! Keeps the inbound loop alive forever:
//!
//! ```text
//!   seed N tasks ─► [task queue] ─► acquire permit (≤ concurrency) ─► run cycle
//!                        ▲                                               │
//!                        ├──────────── success / empty ◄─────────────────┤
//!                        └──────── sleep(retry_delay) ◄──── failure ◄────┘
//! ```
//!
//! Every finished cycle enqueues exactly one successor, so the number of live
//! tasks never drops to zero and never grows past the seed. A failed cycle
//! releases its permit before sleeping.
//!
//! Statistics are reported on `stats_interval` and reset on
//! `stats_reset_interval`, both through the observer channel.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::RpcConfig;
use crate::service::events::{EventPublisher, RpcEvent};

/// Unit of work the scheduler keeps re-running.
#[async_trait]
pub trait CycleJob: Send + Sync + 'static {
    type Error: fmt::Display + Send;

    /// Run one cycle. `Err` triggers the retry delay.
    async fn run(&self) -> Result<(), Self::Error>;
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Tasks enqueued at start
    pub seed: usize,
    pub retry_delay: Duration,
    pub stats_interval: Duration,
    pub stats_reset_interval: Duration,
}

impl From<&RpcConfig> for SchedulerConfig {
    fn from(config: &RpcConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            seed: config.pollers,
            retry_delay: config.retry_delay,
            stats_interval: config.stats_interval,
            stats_reset_interval: config.stats_reset_interval,
        }
    }
}

/// A queued request to run one cycle
#[derive(Debug, Clone, Copy, Default)]
struct RetryTask {
    /// Consecutive failures before this task
    attempt: u32,
}

impl RetryTask {
    fn retry(self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// Live scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    busy_nanos: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    queued: AtomicUsize,
}

/// Point-in-time copy of the scheduler counters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulerStatsSnapshot {
    /// Cycles finished since the last reset
    pub total: u64,
    pub succeeded: u64,
    /// Failed cycles, each of which scheduled a delayed retry
    pub failed: u64,
    /// `succeeded / total`, 1.0 when nothing ran yet
    pub success_rate: f64,
    pub average_cycle: Duration,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Tasks waiting for a permit or for their retry delay
    pub queued: usize,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = succeeded + failed;
        let busy = self.busy_nanos.load(Ordering::Relaxed);

        SchedulerStatsSnapshot {
            total,
            succeeded,
            failed,
            success_rate: if total == 0 {
                1.0
            } else {
                succeeded as f64 / total as f64
            },
            average_cycle: if total == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(busy / total)
            },
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }

    /// Zero the cumulative counters, returning their values before the reset.
    ///
    /// Gauges (in flight, queued) describe the present and are kept.
    pub fn reset(&self) -> SchedulerStatsSnapshot {
        let before = self.snapshot();
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.busy_nanos.store(0, Ordering::Relaxed);
        self.peak_in_flight
            .store(self.in_flight.load(Ordering::Relaxed), Ordering::Relaxed);
        before
    }

    fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    fn started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    fn finished(&self, ok: bool, elapsed: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn abandoned(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Runs a `CycleJob` forever with bounded concurrency and retry delay.
pub struct RetryScheduler<J: CycleJob> {
    job: Arc<J>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    events: Arc<EventPublisher>,
}

impl<J: CycleJob> RetryScheduler<J> {
    pub fn new(job: Arc<J>, config: SchedulerConfig, events: Arc<EventPublisher>) -> Self {
        Self {
            job,
            config,
            stats: Arc::new(SchedulerStats::default()),
            events,
        }
    }

    /// Share an existing stats handle
    pub fn with_stats(mut self, stats: Arc<SchedulerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// On shutdown, cycles still polling are cancelled and pending retries
    /// are discarded. Returns once every cycle task has ended.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tasks_tx, mut tasks_rx) = mpsc::unbounded_channel::<RetryTask>();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let cycle_shutdown = shutdown.clone();
        let mut cycles = JoinSet::new();

        for _ in 0..self.config.seed {
            self.stats.enqueued();
            let _ = tasks_tx.send(RetryTask::default());
        }

        let mut report = interval_at(
            Instant::now() + self.config.stats_interval,
            self.config.stats_interval,
        );
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reset = interval_at(
            Instant::now() + self.config.stats_reset_interval,
            self.config.stats_reset_interval,
        );
        reset.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            concurrency = self.config.concurrency,
            seed = self.config.seed,
            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                Some(task) = tasks_rx.recv() => {
                    let cycle = Cycle {
                        job: self.job.clone(),
                        stats: self.stats.clone(),
                        semaphore: semaphore.clone(),
                        tasks: tasks_tx.clone(),
                        retry_delay: self.config.retry_delay,
                        shutdown: cycle_shutdown.clone(),
                    };
                    cycles.spawn(cycle.run(task));
                }
                Some(joined) = cycles.join_next() => {
                    if let Err(e) = joined {
                        // Only panics reach here; the lost task is replaced
                        error!(error = %e, "Poll cycle task failed, re-seeding");
                        if e.is_panic() {
                            self.stats.abandoned();
                        }
                        self.stats.enqueued();
                        let _ = tasks_tx.send(RetryTask::default());
                    }
                }
                _ = report.tick() => self.report(),
                _ = reset.tick() => self.reset(),
            }
        }

        debug!(running = cycles.len(), "Waiting for poll cycles to stop");
        while cycles.join_next().await.is_some() {}
        info!("Retry scheduler stopped");
    }

    fn report(&self) {
        let snapshot = self.stats.snapshot();
        info!(
            total = snapshot.total,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            success_rate = snapshot.success_rate,
            average_cycle_ms = snapshot.average_cycle.as_millis() as u64,
            in_flight = snapshot.in_flight,
            peak_in_flight = snapshot.peak_in_flight,
            queued = snapshot.queued,
            "Scheduler stats"
        );
        self.events.publish(RpcEvent::SchedulerStats(snapshot));
    }

    fn reset(&self) {
        let before = self.stats.reset();
        info!(total = before.total, failed = before.failed, "Scheduler stats reset");
        self.events.publish(RpcEvent::SchedulerStatsReset(before));
    }
}

/// Everything one cycle task needs
struct Cycle<J: CycleJob> {
    job: Arc<J>,
    stats: Arc<SchedulerStats>,
    semaphore: Arc<Semaphore>,
    tasks: mpsc::UnboundedSender<RetryTask>,
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<J: CycleJob> Cycle<J> {
    async fn run(mut self, task: RetryTask) {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = wait_for_shutdown(&mut self.shutdown) => return,
        };
        self.stats.dequeued();
        self.stats.started();

        let started = Instant::now();
        let result = tokio::select! {
            result = self.job.run() => result,
            _ = wait_for_shutdown(&mut self.shutdown) => {
                self.stats.abandoned();
                return;
            }
        };
        self.stats.finished(result.is_ok(), started.elapsed());

        match result {
            Ok(()) => {
                self.enqueue(RetryTask::default());
                drop(permit);
            }
            Err(e) => {
                drop(permit);
                let next = task.retry();
                warn!(
                    attempt = next.attempt,
                    retry_in_ms = self.retry_delay.as_millis() as u64,
                    error = %e,
                    "Poll cycle failed, retrying after delay"
                );
                self.stats.enqueued();
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {
                        let _ = self.tasks.send(next);
                    }
                    _ = wait_for_shutdown(&mut self.shutdown) => {}
                }
            }
        }
    }

    fn enqueue(&self, task: RetryTask) {
        self.stats.enqueued();
        let _ = self.tasks.send(task);
    }
}

/// Resolves once shutdown is signalled or the signal's sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
