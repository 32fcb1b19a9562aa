//! Re-entry into interrupted runs.
//!
//! A run is resumed from the furthest stage its persisted state supports.
//! Expensive work already paid for is never repeated: generation is never
//! re-run, captions are kept, and a submitted training job is followed
//! instead of resubmitted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::TrainingState;
use crate::error::StoreError;
use crate::models::{PipelineRun, RunStatus};
use crate::utils::BackoffPolicy;

use super::orchestrator::{PipelineError, PipelineOrchestrator, StageEntry};

/// What resuming a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The run was already finished; nothing was touched.
    Terminal(RunStatus),
    /// The run was re-entered at `entry` and ended with `status`.
    Resumed { entry: StageEntry, status: RunStatus },
    /// Nothing resumable was left; the run was marked failed.
    Abandoned { reason: String },
}

/// Resume decision derived from persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    Nothing(RunStatus),
    Enter(StageEntry),
    Abandon(String),
}

pub struct Resumer {
    orchestrator: Arc<PipelineOrchestrator>,
    lookup: BackoffPolicy,
    stale_after: Duration,
}

impl Resumer {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        let lookup = orchestrator.config().lookup_backoff();
        let stale_after = orchestrator.config().stale_after;
        Self {
            orchestrator,
            lookup,
            stale_after,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Decides where `run` would re-enter without changing anything.
    pub async fn plan(&self, run: &PipelineRun) -> Result<ResumePlan, PipelineError> {
        if run.status.is_terminal() {
            return Ok(ResumePlan::Nothing(run.status));
        }

        let config = self.orchestrator.config();
        let counts = self.orchestrator.store().image_counts(run.id).await?;

        if counts.captioned > 0 {
            return self.training_plan(run).await;
        }
        if counts.passed >= config.min_passed_images {
            return Ok(ResumePlan::Enter(StageEntry::Captioning));
        }
        Ok(ResumePlan::Abandon(format!(
            "Cannot resume: {} images passed evaluation, {} required",
            counts.passed, config.min_passed_images
        )))
    }

    /// Checks a previously submitted job before any new submission.
    async fn training_plan(&self, run: &PipelineRun) -> Result<ResumePlan, PipelineError> {
        let attempt = run.training_attempts.max(1);
        let Some(job_id) = run.training_job_id.clone() else {
            return Ok(ResumePlan::Enter(StageEntry::Training {
                attempt,
                job_id: None,
            }));
        };

        let service = self.orchestrator.training_service().clone();
        let status = self
            .lookup
            .retry("training status lookup", |_| {
                let service = service.clone();
                let job_id = job_id.clone();
                async move { service.get_training_status(&job_id).await }
            })
            .await?;

        info!(
            run_id = %run.id,
            job_id = %job_id,
            state = status.state.as_str(),
            attempt = attempt,
            "Found existing training job"
        );

        match status.state {
            TrainingState::Succeeded | TrainingState::Queued | TrainingState::Running => {
                Ok(ResumePlan::Enter(StageEntry::Training {
                    attempt,
                    job_id: Some(job_id),
                }))
            }
            TrainingState::Failed | TrainingState::Cancelled => {
                let next = attempt + 1;
                let max = self.orchestrator.config().max_training_attempts;
                if next > max {
                    Ok(ResumePlan::Abandon(format!(
                        "Training job {} {} on the last of {} attempts",
                        job_id,
                        status.state.as_str(),
                        max
                    )))
                } else {
                    Ok(ResumePlan::Enter(StageEntry::Training {
                        attempt: next,
                        job_id: None,
                    }))
                }
            }
        }
    }

    /// Resumes one run. Resuming a finished run is a no-op.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<ResumeOutcome, PipelineError> {
        let run = self.orchestrator.store().get_run(run_id).await?;

        match self.plan(&run).await? {
            ResumePlan::Nothing(status) => {
                info!(run_id = %run_id, status = %status, "Run already finished");
                Ok(ResumeOutcome::Terminal(status))
            }
            ResumePlan::Abandon(reason) => {
                warn!(run_id = %run_id, reason = %reason, "Run cannot be resumed");
                self.orchestrator.fail_run(run_id, &reason).await;
                Ok(ResumeOutcome::Abandoned { reason })
            }
            ResumePlan::Enter(entry) => {
                info!(run_id = %run_id, from = %run.status, entry = ?entry, "Resuming run");
                let status = self
                    .orchestrator
                    .run_from(&run.subject, run_id, entry.clone())
                    .await;
                Ok(ResumeOutcome::Resumed { entry, status })
            }
        }
    }

    /// Non-terminal runs not updated within the staleness window, oldest first.
    pub async fn stalled_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - window;

        let mut runs: Vec<PipelineRun> = self
            .orchestrator
            .store()
            .list_runs(None)
            .await?
            .into_iter()
            .filter(|run| !run.status.is_terminal() && run.updated_at <= cutoff)
            .collect();
        runs.sort_by_key(|run| run.updated_at);
        Ok(runs)
    }

    /// Resumes every stalled run in turn.
    ///
    /// A run that cannot be inspected (e.g. the training service is down) is
    /// left as it is for the next sweep and does not stop the others.
    pub async fn resume_stalled(
        &self,
    ) -> Result<Vec<(Uuid, Result<ResumeOutcome, PipelineError>)>, StoreError> {
        let runs = self.stalled_runs().await?;
        info!(count = runs.len(), "Resuming stalled runs");

        let mut outcomes = Vec::with_capacity(runs.len());
        for run in runs {
            let outcome = self.resume_run(run.id).await;
            if let Err(err) = &outcome {
                warn!(run_id = %run.id, error = %err, "Resume failed");
            }
            outcomes.push((run.id, outcome));
        }
        Ok(outcomes)
    }
}
