//! Periodic job scheduling.
//!
//! Each job gets its own loop driven by a [`Ticker`]. Every fire goes through
//! a [`TickRunner`], which refuses to start a second execution of the same job
//! while one is still in flight: overlapping fires are skipped, not queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use courier_common::config::BroadcastSettings;
use courier_common::error::AppError;

use crate::processor::QueueProcessor;
use crate::purger::RetentionPurger;

/// How often terminal runs past retention are purged.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), AppError>;
}

#[async_trait]
impl Job for QueueProcessor {
    fn name(&self) -> &'static str {
        "process_queue"
    }

    async fn run(&self) -> Result<(), AppError> {
        self.tick().await.map(|_| ())
    }
}

#[async_trait]
impl Job for RetentionPurger {
    fn name(&self) -> &'static str {
        "purge_old_runs"
    }

    async fn run(&self) -> Result<(), AppError> {
        self.purge(Utc::now()).await.map(|_| ())
    }
}

/// Source of fire events for a job loop.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next fire. Returns `false` when the loop should stop.
    async fn tick(&mut self) -> bool;
}

/// Fires on a fixed period until shutdown is signalled.
pub struct IntervalTicker {
    interval: tokio::time::Interval,
    shutdown: watch::Receiver<bool>,
}

impl IntervalTicker {
    /// The first fire happens immediately.
    pub fn new(period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, shutdown }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.interval.tick() => true,
            // The flag only ever flips to true; a dropped sender also stops us.
            _ = self.shutdown.changed() => false,
        }
    }
}

/// Fires only when its [`ManualTickHandle`] says so. Stops once every handle
/// is dropped.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTickHandle {
    /// Returns false if the ticker is gone.
    pub fn fire(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

pub fn manual_ticker() -> (ManualTicker, ManualTickHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManualTicker { rx }, ManualTickHandle { tx })
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another execution was still running.
    Skipped,
    Completed,
    Failed,
}

/// Runs a job with a reentrancy guard.
pub struct TickRunner {
    job: Arc<dyn Job>,
    running: AtomicBool,
}

/// Clears the running flag even if the job panics.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TickRunner {
    pub fn new(job: Arc<dyn Job>) -> Arc<Self> {
        Arc::new(Self {
            job,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run_once(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(job = self.job.name(), "Previous run still in progress, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        match self.job.run().await {
            Ok(()) => TickOutcome::Completed,
            Err(e) => {
                tracing::error!(job = self.job.name(), error = %e, "Scheduled job failed");
                TickOutcome::Failed
            }
        }
    }
}

/// Fire-and-forget handle that kicks a job outside its schedule.
#[derive(Clone)]
pub struct TickTrigger {
    runner: Arc<TickRunner>,
}

impl TickTrigger {
    pub fn new(runner: Arc<TickRunner>) -> Self {
        Self { runner }
    }

    pub fn fire(&self) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            runner.run_once().await;
        });
    }
}

/// Owns the job loops and the shutdown signal they observe.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Schedule `runner` every `period`.
    pub fn every(&mut self, runner: Arc<TickRunner>, period: Duration) {
        let ticker = IntervalTicker::new(period, self.shutdown_tx.subscribe());
        self.with_ticker(runner, ticker);
    }

    /// Schedule `runner` on a custom ticker.
    pub fn with_ticker<T>(&mut self, runner: Arc<TickRunner>, mut ticker: T)
    where
        T: Ticker + 'static,
    {
        let handle = tokio::spawn(async move {
            let job = runner.job.name();
            tracing::info!(job, "Scheduler loop started");
            while ticker.tick().await {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.run_once().await;
                });
            }
            tracing::info!(job, "Scheduler loop stopped");
        });
        self.handles.push(handle);
    }

    /// Signal every loop to stop and wait for them. Executions already in
    /// flight are left to finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler loop panicked");
            }
        }
    }
}

/// Start the queue and purge loops. The returned trigger kicks the queue job
/// on demand.
pub fn spawn_background_jobs(
    processor: QueueProcessor,
    purger: RetentionPurger,
    settings: &BroadcastSettings,
) -> (Scheduler, TickTrigger) {
    let queue = TickRunner::new(Arc::new(processor));
    let purge = TickRunner::new(Arc::new(purger));

    let mut scheduler = Scheduler::new();
    scheduler.every(queue.clone(), settings.tick_interval());
    scheduler.every(purge, PURGE_INTERVAL);

    tracing::info!(
        tick_interval_secs = settings.tick_interval().as_secs(),
        "Broadcast scheduler started"
    );
    (scheduler, TickTrigger::new(queue))
}
