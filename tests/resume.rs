//! Re-entering interrupted runs from persisted state.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{artifact_url, test_config, FakeVision, Harness};
use flate2::read::GzDecoder;
use persona_forge::clients::TrainingJobStatus;
use persona_forge::models::{EvalStatus, PromptScore, RunStatus, ValidationResult};
use persona_forge::storage::BlobStorage;
use persona_forge::training::{overrides_for_attempt, TrainingParams};
use persona_forge::pipeline::{ResumeOutcome, ResumePlan, Resumer, StageEntry};
use persona_forge::storage::StatusStore;
use uuid::Uuid;

async fn caption_all(h: &Harness, run_id: Uuid) {
    for image in h.store.list_images(run_id).await.unwrap() {
        h.store
            .set_image_caption(run_id, &image.id, "woman, portrait")
            .await
            .unwrap();
    }
}

/// A run interrupted while its adapter was training.
async fn training_run(h: &Harness, attempt: u32, job_id: &str) -> Uuid {
    let run_id = h.create_run().await;
    h.seed_images(run_id, 8, EvalStatus::Passed).await;
    caption_all(h, run_id).await;
    h.store
        .begin_training_attempt(run_id, attempt, Some(job_id))
        .await
        .unwrap();
    h.store
        .update_run_status(run_id, RunStatus::Training, None)
        .await
        .unwrap();
    run_id
}

#[tokio::test]
async fn test_resume_at_captioning_skips_generation() {
    let h = Harness::new(FakeVision::approving()).await;
    let run_id = h.create_run().await;
    h.seed_images(run_id, 8, EvalStatus::Passed).await;
    h.store
        .update_run_status(run_id, RunStatus::Evaluating, None)
        .await
        .unwrap();

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert_eq!(
        outcome,
        ResumeOutcome::Resumed {
            entry: StageEntry::Captioning,
            status: RunStatus::Deployed,
        }
    );

    assert_eq!(h.generator.dataset_calls(), 0);
    // Only the six validation renders were scored.
    assert_eq!(h.vision.calls(), 6);

    let counts = h.store.image_counts(run_id).await.unwrap();
    assert_eq!(counts.captioned, 8);
    assert_eq!(h.store.get_run(run_id).await.unwrap().dataset_size, Some(8));
}

#[tokio::test]
async fn test_resume_below_floor_abandons_run() {
    let h = Harness::new(FakeVision::approving()).await;
    let run_id = h.create_run().await;
    h.seed_images(run_id, 4, EvalStatus::Passed).await;
    h.store
        .update_run_status(run_id, RunStatus::Evaluating, None)
        .await
        .unwrap();

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert!(matches!(outcome, ResumeOutcome::Abandoned { .. }));

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("4 images passed"));
    assert_eq!(h.generator.dataset_calls(), 0);
}

#[tokio::test]
async fn test_resuming_deployed_run_is_noop() {
    let h = Harness::new(FakeVision::approving()).await;
    let run_id = h.create_run().await;
    assert_eq!(h.orchestrator.run(&h.subject, run_id).await, RunStatus::Deployed);
    let before = h.store.get_run(run_id).await.unwrap();
    let generated = h.generator.dataset_calls();

    let resumer = Resumer::new(h.orchestrator.clone());
    for _ in 0..2 {
        let outcome = resumer.resume_run(run_id).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Terminal(RunStatus::Deployed));
    }

    let after = h.store.get_run(run_id).await.unwrap();
    assert_eq!(after.status, RunStatus::Deployed);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(h.generator.dataset_calls(), generated);
    assert_eq!(h.training.submissions().len(), 1);
}

#[tokio::test]
async fn test_resume_follows_existing_job() {
    let h = Harness::new(FakeVision::approving()).await;
    h.training
        .seed_job("job-earlier", TrainingJobStatus::succeeded(artifact_url("job-earlier")));
    let run_id = training_run(&h, 1, "job-earlier").await;

    let resumer = Resumer::new(h.orchestrator.clone());
    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(
        resumer.plan(&run).await.unwrap(),
        ResumePlan::Enter(StageEntry::Training {
            attempt: 1,
            job_id: Some("job-earlier".to_string()),
        })
    );

    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert!(matches!(
        outcome,
        ResumeOutcome::Resumed {
            status: RunStatus::Deployed,
            ..
        }
    ));
    assert!(h.training.submissions().is_empty());

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.artifact.unwrap().url, artifact_url("job-earlier"));
    assert_eq!(h.generator.dataset_calls(), 0);
}

#[tokio::test]
async fn test_resume_after_failed_job_starts_next_attempt() {
    let h = Harness::new(FakeVision::approving()).await;
    h.training
        .seed_job("job-earlier", TrainingJobStatus::failed("out of memory"));
    let run_id = training_run(&h, 1, "job-earlier").await;

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert_eq!(
        outcome,
        ResumeOutcome::Resumed {
            entry: StageEntry::Training {
                attempt: 2,
                job_id: None,
            },
            status: RunStatus::Deployed,
        }
    );

    let submissions = h.training.submissions();
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].0.ends_with("attempt-2.tar.gz"));

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.training_attempts, 2);
    assert_eq!(run.training_job_id.as_deref(), Some("job-1"));
}

#[tokio::test]
async fn test_resume_after_attempt_started_submits_fresh_job() {
    let h = Harness::new(FakeVision::approving()).await;
    h.training
        .seed_job("job-earlier", TrainingJobStatus::succeeded(artifact_url("job-earlier")));
    let run_id = training_run(&h, 1, "job-earlier").await;
    let rejected = (0..6)
        .map(|i| PromptScore {
            prompt: format!("prompt {}", i),
            score: 2.0,
            passed: false,
            error: None,
        })
        .collect();
    let rejected = ValidationResult::from_scores(1, rejected, 5);
    assert!(h.store.record_validation(run_id, &rejected).await.unwrap());

    // Interrupted right after attempt 2 was recorded, before its submission.
    h.store
        .begin_training_attempt(run_id, 2, None)
        .await
        .unwrap();
    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.training_attempts, 2);
    assert_eq!(run.training_job_id, None);

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert_eq!(
        outcome,
        ResumeOutcome::Resumed {
            entry: StageEntry::Training {
                attempt: 2,
                job_id: None,
            },
            status: RunStatus::Deployed,
        }
    );

    let submissions = h.training.submissions();
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].0.ends_with("attempt-2.tar.gz"));
    let retry_params = TrainingParams::default().with_overrides(&overrides_for_attempt(2));
    assert_eq!(submissions[0].1.learning_rate, retry_params.learning_rate);
    assert_ne!(
        submissions[0].1.learning_rate,
        TrainingParams::default().learning_rate
    );

    let run = h.store.get_run(run_id).await.unwrap();
    assert_eq!(run.artifact.unwrap().url, artifact_url("job-1"));
    let attempts: Vec<u32> = h
        .store
        .list_validations(run_id)
        .await
        .unwrap()
        .iter()
        .map(|v| v.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_oversized_dataset_is_recompressed_for_upload() {
    let limit = 400_000;
    let h = Harness::with_config(
        FakeVision::approving(),
        test_config().with_max_archive_bytes(limit),
    )
    .await;
    let run_id = h.create_run().await;
    h.seed_png_images(run_id, 8).await;
    h.store
        .update_run_status(run_id, RunStatus::Evaluating, None)
        .await
        .unwrap();

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert!(matches!(
        outcome,
        ResumeOutcome::Resumed {
            status: RunStatus::Deployed,
            ..
        }
    ));

    let submissions = h.training.submissions();
    assert_eq!(submissions.len(), 1);
    let archive = h.blob.download(&submissions[0].0).await.unwrap();
    assert!(archive.len() as u64 <= limit, "{} bytes", archive.len());

    let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
    let names: Vec<String> = tar
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(names.len(), 16);
    assert!(names.iter().any(|name| name.ends_with(".jpg")));
    assert!(!names.iter().any(|name| name.ends_with(".png")));
}

#[tokio::test]
async fn test_failed_job_on_last_attempt_abandons_run() {
    let h = Harness::new(FakeVision::approving()).await;
    h.training
        .seed_job("job-earlier", TrainingJobStatus::failed("out of memory"));
    let run_id = training_run(&h, 3, "job-earlier").await;

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert!(matches!(outcome, ResumeOutcome::Abandoned { .. }));
    assert_eq!(
        h.store.get_run(run_id).await.unwrap().status,
        RunStatus::Failed
    );
    assert!(h.training.submissions().is_empty());
}

#[tokio::test]
async fn test_resume_reuses_recorded_validation() {
    let h = Harness::new(FakeVision::approving()).await;
    h.training
        .seed_job("job-earlier", TrainingJobStatus::succeeded(artifact_url("job-earlier")));
    let run_id = training_run(&h, 1, "job-earlier").await;

    let results = (0..6)
        .map(|i| PromptScore {
            prompt: format!("prompt {}", i),
            score: 8.0,
            passed: true,
            error: None,
        })
        .collect();
    let recorded = ValidationResult::from_scores(1, results, 5);
    assert!(h.store.record_validation(run_id, &recorded).await.unwrap());

    let resumer = Resumer::new(h.orchestrator.clone());
    let outcome = resumer.resume_run(run_id).await.unwrap();
    assert!(matches!(
        outcome,
        ResumeOutcome::Resumed {
            status: RunStatus::Deployed,
            ..
        }
    ));

    assert_eq!(h.generator.validation_calls(), 0);
    assert_eq!(h.vision.calls(), 0);
    assert_eq!(h.store.list_validations(run_id).await.unwrap().len(), 1);
    assert_eq!(
        h.store.get_run(run_id).await.unwrap().validation_score,
        Some(8.0)
    );
}

#[tokio::test]
async fn test_resume_stalled_skips_unreachable_jobs() {
    let h = Harness::new(FakeVision::approving()).await;

    let captioning = h.create_run().await;
    h.seed_images(captioning, 8, EvalStatus::Passed).await;
    h.store
        .update_run_status(captioning, RunStatus::Captioning, None)
        .await
        .unwrap();
    // The training service has no record of this job.
    let lost = training_run(&h, 1, "job-lost").await;

    let resumer = Resumer::new(h.orchestrator.clone()).with_stale_after(Duration::ZERO);
    let outcomes: HashMap<Uuid, _> = resumer.resume_stalled().await.unwrap().into_iter().collect();
    assert_eq!(outcomes.len(), 2);

    assert!(matches!(
        outcomes[&captioning],
        Ok(ResumeOutcome::Resumed {
            status: RunStatus::Deployed,
            ..
        })
    ));
    assert!(outcomes[&lost].is_err());

    let run = h.store.get_run(lost).await.unwrap();
    assert_eq!(run.status, RunStatus::Training);
    assert_eq!(run.training_job_id.as_deref(), Some("job-lost"));
}

#[tokio::test]
async fn test_stalled_runs_respects_window() {
    let h = Harness::new(FakeVision::approving()).await;
    let run_id = h.create_run().await;
    h.store
        .update_run_status(run_id, RunStatus::Evaluating, None)
        .await
        .unwrap();

    let patient = Resumer::new(h.orchestrator.clone()).with_stale_after(Duration::from_secs(3600));
    assert!(patient.stalled_runs().await.unwrap().is_empty());

    let eager = Resumer::new(h.orchestrator.clone()).with_stale_after(Duration::ZERO);
    let stalled = eager.stalled_runs().await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, run_id);
}
