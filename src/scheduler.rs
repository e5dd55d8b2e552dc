//! Three independently timed triggers (sync, recall sweep, release sweep), each allowed at
//! most one run at a time. A tick that finds its job still running is skipped, not queued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::limits::{MAX_SYNC_INTERVAL_MINUTES, MIN_SYNC_INTERVAL_MINUTES};
use crate::model::Ms;
use crate::observability;
use crate::reaper::{SweepReport, Sweeper};
use crate::sync::{SyncOrchestrator, SyncReport};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("sync interval must be within [{min}, {max}] minutes, got {got}")]
    InvalidInterval { got: u64, min: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Recall,
    Release,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Sync, JobKind::Recall, JobKind::Release];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Recall => "recall",
            JobKind::Release => "release",
        }
    }
}

/// The work behind each trigger.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn sync(&self) -> SyncReport;
    async fn recall_sweep(&self) -> SweepReport;
    async fn release_sweep(&self) -> SweepReport;
}

/// Production workload: a sync cycle followed by a telemetry refresh, and the two sweeps.
pub struct ParkingWorkload {
    orchestrator: Arc<SyncOrchestrator>,
    sweeper: Arc<Sweeper>,
}

impl ParkingWorkload {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, sweeper: Arc<Sweeper>) -> Self {
        Self { orchestrator, sweeper }
    }
}

#[async_trait]
impl Workload for ParkingWorkload {
    async fn sync(&self) -> SyncReport {
        let report = self.orchestrator.sync().await;
        if let Err(e) = self.orchestrator.sync_positions().await {
            warn!(error = %e, "position refresh failed");
        }
        report
    }

    async fn recall_sweep(&self) -> SweepReport {
        self.sweeper.recall_sweep().await
    }

    async fn release_sweep(&self) -> SweepReport {
        self.sweeper.release_sweep().await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sync_interval_minutes: u64,
    pub recall_interval: Duration,
    pub release_interval: Duration,
    pub sync_misfire_grace: Duration,
    pub sweep_misfire_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sync_interval_minutes: config.sync.interval_minutes,
            recall_interval: config.jobs.recall_interval,
            release_interval: config.jobs.release_interval,
            sync_misfire_grace: config.jobs.sync_misfire_grace,
            sweep_misfire_grace: config.jobs.sweep_misfire_grace,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sync_interval_minutes: 5,
            recall_interval: Duration::from_secs(120),
            release_interval: Duration::from_secs(180),
            sync_misfire_grace: Duration::from_secs(300),
            sweep_misfire_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub runs: u64,
    /// Ticks dropped because the previous run had not finished.
    pub skipped: u64,
    /// Ticks dropped for arriving later than the misfire grace.
    pub misfired: u64,
    pub failed: u64,
    pub last_run_at: Option<Ms>,
    pub next_run_at: Option<Ms>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_minutes: u64,
    /// Next sync tick.
    pub next_run_at: Option<Ms>,
    pub jobs: BTreeMap<&'static str, JobStats>,
}

fn validate_interval(minutes: u64) -> Result<(), SchedulerError> {
    if (MIN_SYNC_INTERVAL_MINUTES..=MAX_SYNC_INTERVAL_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidInterval {
            got: minutes,
            min: MIN_SYNC_INTERVAL_MINUTES,
            max: MAX_SYNC_INTERVAL_MINUTES,
        })
    }
}

fn misfired(scheduled: Instant, now: Instant, grace: Duration) -> bool {
    now.saturating_duration_since(scheduled) > grace
}

struct Shared {
    workload: Arc<dyn Workload>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    sync_interval_minutes: AtomicU64,
    gates: DashMap<JobKind, Arc<Mutex<()>>>,
    stats: DashMap<JobKind, JobStats>,
    /// In-flight job runs. Drained on stop.
    runs: TaskTracker,
}

impl Shared {
    fn gate(&self, kind: JobKind) -> Arc<Mutex<()>> {
        self.gates.entry(kind).or_default().clone()
    }

    fn period(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Sync => Duration::from_secs(self.sync_interval_minutes.load(Ordering::SeqCst) * 60),
            JobKind::Recall => self.settings.recall_interval,
            JobKind::Release => self.settings.release_interval,
        }
    }

    fn grace(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Sync => self.settings.sync_misfire_grace,
            JobKind::Recall | JobKind::Release => self.settings.sweep_misfire_grace,
        }
    }

    fn update_stats(&self, kind: JobKind, f: impl FnOnce(&mut JobStats)) {
        f(&mut self.stats.entry(kind).or_default());
    }

    fn set_next_run(&self, kind: JobKind, period: Option<Duration>) {
        let next = period.map(|p| self.clock.now_ms() + p.as_millis() as Ms);
        self.update_stats(kind, |s| s.next_run_at = next);
    }

    /// Start a run unless the previous one still holds the gate.
    fn dispatch(self: &Arc<Self>, kind: JobKind) -> bool {
        let Ok(permit) = self.gate(kind).try_lock_owned() else {
            info!(job = kind.as_str(), "previous run still going, tick skipped");
            metrics::counter!(observability::JOB_SKIPPED_TOTAL, "job" => kind.as_str()).increment(1);
            self.update_stats(kind, |s| s.skipped += 1);
            return false;
        };
        let shared = self.clone();
        self.runs.spawn(async move {
            let _permit = permit;
            shared.run_isolated(kind).await;
        });
        true
    }

    /// Run the job in its own task so a panic is reported as a failed run
    /// and the gate is still released.
    async fn run_isolated(self: &Arc<Self>, kind: JobKind) {
        let started_at = self.clock.now_ms();
        let shared = self.clone();
        let ok = match tokio::spawn(async move { shared.execute(kind).await }).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(job = kind.as_str(), error = %e, "job run aborted");
                false
            }
        };
        self.record_run(kind, ok, started_at);
    }

    async fn execute(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Sync => self.workload.sync().await.is_ok(),
            JobKind::Recall => self.workload.recall_sweep().await.failed == 0,
            JobKind::Release => self.workload.release_sweep().await.failed == 0,
        }
    }

    fn record_run(&self, kind: JobKind, ok: bool, started_at: Ms) {
        let outcome = if ok { "ok" } else { "failed" };
        metrics::counter!(observability::JOB_RUNS_TOTAL, "job" => kind.as_str(), "outcome" => outcome).increment(1);
        self.update_stats(kind, |s| {
            s.runs += 1;
            if !ok {
                s.failed += 1;
            }
            s.last_run_at = Some(started_at);
        });
    }
}

async fn trigger_loop(shared: Arc<Shared>, kind: JobKind, cancel: CancellationToken) {
    let period = shared.period(kind);
    let grace = shared.grace(kind);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let scheduled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            at = interval.tick() => at,
        };
        shared.set_next_run(kind, Some(period));
        if misfired(scheduled, Instant::now(), grace) {
            warn!(job = kind.as_str(), "tick arrived past its misfire grace, dropped");
            metrics::counter!(observability::JOB_MISFIRED_TOTAL, "job" => kind.as_str()).increment(1);
            shared.update_stats(kind, |s| s.misfired += 1);
            continue;
        }
        shared.dispatch(kind);
    }
}

struct Running {
    root: CancellationToken,
    sync_cancel: CancellationToken,
    loops: TaskTracker,
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl JobScheduler {
    pub fn new(
        workload: Arc<dyn Workload>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Result<Self, SchedulerError> {
        validate_interval(settings.sync_interval_minutes)?;
        Ok(Self {
            shared: Arc::new(Shared {
                workload,
                clock,
                sync_interval_minutes: AtomicU64::new(settings.sync_interval_minutes),
                settings,
                gates: DashMap::new(),
                stats: DashMap::new(),
                runs: TaskTracker::new(),
            }),
            running: Mutex::new(None),
        })
    }

    /// Start all three triggers. No-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("scheduler already running");
            return;
        }
        let root = CancellationToken::new();
        let sync_cancel = root.child_token();
        let loops = TaskTracker::new();
        for kind in JobKind::ALL {
            self.shared.set_next_run(kind, Some(self.shared.period(kind)));
        }
        loops.spawn(trigger_loop(self.shared.clone(), JobKind::Sync, sync_cancel.clone()));
        loops.spawn(trigger_loop(self.shared.clone(), JobKind::Recall, root.child_token()));
        loops.spawn(trigger_loop(self.shared.clone(), JobKind::Release, root.child_token()));
        *running = Some(Running {
            root,
            sync_cancel,
            loops,
        });
        info!(
            interval_minutes = self.shared.sync_interval_minutes.load(Ordering::SeqCst),
            "scheduler started"
        );
    }

    /// Stop the triggers and wait for in-flight runs to finish. No-op when stopped.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.root.cancel();
        running.loops.close();
        running.loops.wait().await;
        for kind in JobKind::ALL {
            self.shared.set_next_run(kind, None);
        }

        self.shared.runs.close();
        self.shared.runs.wait().await;
        self.shared.runs.reopen();
        info!("scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a sync now. Waits for a scheduled sync that is already going, never overlaps one.
    pub async fn trigger_manual_sync(&self) -> SyncReport {
        let _permit = self.shared.gate(JobKind::Sync).lock_owned().await;
        info!("manual sync triggered");
        let started_at = self.shared.clock.now_ms();
        let report = self.shared.workload.sync().await;
        self.shared.record_run(JobKind::Sync, report.is_ok(), started_at);
        report
    }

    /// Change the sync cadence. Only the sync trigger is rescheduled.
    pub async fn update_interval(&self, minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(minutes)?;
        let mut running = self.running.lock().await;
        let previous = self.shared.sync_interval_minutes.swap(minutes, Ordering::SeqCst);
        if let Some(running) = running.as_mut() {
            running.sync_cancel.cancel();
            running.sync_cancel = running.root.child_token();
            self.shared
                .set_next_run(JobKind::Sync, Some(self.shared.period(JobKind::Sync)));
            running.loops.spawn(trigger_loop(
                self.shared.clone(),
                JobKind::Sync,
                running.sync_cancel.clone(),
            ));
        }
        info!(previous, minutes, "sync interval updated");
        Ok(())
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let running = self.is_running().await;
        let jobs: BTreeMap<&'static str, JobStats> = JobKind::ALL
            .iter()
            .map(|kind| {
                let stats = self.shared.stats.get(kind).map(|s| s.clone()).unwrap_or_default();
                (kind.as_str(), stats)
            })
            .collect();
        SchedulerStatus {
            running,
            interval_minutes: self.shared.sync_interval_minutes.load(Ordering::SeqCst),
            next_run_at: jobs.get(JobKind::Sync.as_str()).and_then(|s| s.next_run_at),
            jobs,
        }
    }
}
