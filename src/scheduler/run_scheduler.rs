//! Background execution of pipeline runs with bounded concurrency.
//!
//! [`RunScheduler::submit`] records the run and returns its id at once; the
//! run itself executes on a spawned task once one of `max_concurrent`
//! permits is free. Runs share nothing but the status store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{PipelineRun, RunStatus, SubjectInput};
use crate::pipeline::{PipelineOrchestrator, StageEntry};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to record run: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler is closed")]
    Closed,

    #[error("Run task aborted: {0}")]
    TaskAborted(String),
}

/// A submitted run. Dropping the handle does not cancel the run.
pub struct RunHandle {
    run_id: Uuid,
    task: JoinHandle<RunStatus>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Waits for the run to reach a terminal status.
    pub async fn wait(self) -> Result<RunStatus, SchedulerError> {
        self.task
            .await
            .map_err(|e| SchedulerError::TaskAborted(e.to_string()))
    }
}

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub max_concurrent: usize,
    /// Runs currently holding a permit.
    pub active: u64,
    /// Submitted runs still waiting for a permit.
    pub queued: u64,
    pub deployed: u64,
    pub failed: u64,
    pub average_run_duration: Duration,
}

impl SchedulerStats {
    pub fn total_finished(&self) -> u64 {
        self.deployed + self.failed
    }
}

struct SharedStats {
    active: AtomicU64,
    queued: AtomicU64,
    deployed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            active: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            deployed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record_finish(&self, status: RunStatus, duration: Duration) {
        match status {
            RunStatus::Deployed => self.deployed.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self, max_concurrent: usize) -> SchedulerStats {
        let deployed = self.deployed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let finished = deployed + failed;
        let average_run_duration = if finished > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / finished)
        } else {
            Duration::ZERO
        };

        SchedulerStats {
            max_concurrent,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            deployed,
            failed,
            average_run_duration,
        }
    }
}

/// Counts a run as active until dropped, including when the run panics.
struct ActiveSlot {
    stats: Arc<SharedStats>,
    started: Instant,
    status: RunStatus,
}

impl ActiveSlot {
    fn enter(stats: Arc<SharedStats>) -> Self {
        stats.active.fetch_add(1, Ordering::SeqCst);
        Self {
            stats,
            started: Instant::now(),
            status: RunStatus::Failed,
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.record_finish(self.status, self.started.elapsed());
    }
}

pub struct RunScheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    stats: Arc<SharedStats>,
    accepting: AtomicBool,
}

impl RunScheduler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        let max_concurrent = orchestrator.config().max_concurrent_runs.max(1);
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            stats: Arc::new(SharedStats::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Records a new run and schedules it. Returns as soon as the run row exists.
    pub async fn submit(&self, subject: SubjectInput) -> Result<RunHandle, SchedulerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }

        let run = PipelineRun::new(Uuid::new_v4(), subject);
        self.orchestrator.store().create_run(&run).await?;
        info!(run_id = %run.id, subject = %run.subject.slug, "Run submitted");

        Ok(self.spawn(run.id, run.subject, StageEntry::Start))
    }

    fn spawn(&self, run_id: Uuid, subject: SubjectInput, entry: StageEntry) -> RunHandle {
        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        stats.queued.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            stats.queued.fetch_sub(1, Ordering::SeqCst);
            // The semaphore is never closed.
            let Ok(_permit) = permit else {
                return RunStatus::Failed;
            };

            let mut slot = ActiveSlot::enter(Arc::clone(&stats));
            let status = orchestrator.run_from(&subject, run_id, entry).await;
            slot.status = status;
            status
        });

        RunHandle { run_id, task }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot(self.max_concurrent)
    }

    /// Stops accepting submissions and waits for every scheduled run to finish.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("Waiting for scheduled runs to finish");
        loop {
            let stats = self.stats();
            if stats.active == 0 && stats.queued == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Scheduler drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = SharedStats::new();
        stats.record_finish(RunStatus::Deployed, Duration::from_millis(300));
        stats.record_finish(RunStatus::Failed, Duration::from_millis(100));

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.deployed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total_finished(), 2);
        assert_eq!(snapshot.average_run_duration, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_panicking_run_releases_its_slot() {
        let stats = Arc::new(SharedStats::new());
        let task_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            let _slot = ActiveSlot::enter(task_stats);
            panic!("run blew up");
        });

        assert!(task.await.is_err());
        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.deployed, 0);
    }

    #[test]
    fn test_slot_records_final_status() {
        let stats = Arc::new(SharedStats::new());
        {
            let mut slot = ActiveSlot::enter(Arc::clone(&stats));
            assert_eq!(stats.snapshot(1).active, 1);
            slot.status = RunStatus::Deployed;
        }
        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.deployed, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = SharedStats::new().snapshot(3);
        assert_eq!(snapshot.max_concurrent, 3);
        assert_eq!(snapshot.average_run_duration, Duration::ZERO);
    }
}
