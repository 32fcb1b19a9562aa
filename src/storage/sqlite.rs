//! SQLite-backed status store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::catalog::PromptLane;
use crate::error::StoreError;
use crate::models::{
    CandidateImage, EvalStatus, EvaluationDetail, ImageCounts, ImageQuery, PipelineRun,
    RunStatus, SubjectInput, TrainingArtifact, ValidationResult,
};

use super::migrations::MigrationRunner;
use super::store::{ConsumerLink, StatusStore};

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

const RUN_COLUMNS: &str = "id, subject_json, status, training_attempts, training_job_id, \
     error_message, validation_score, dataset_size, artifact_json, created_at, updated_at, \
     deployed_at";

const IMAGE_COLUMNS: &str = "run_id, id, lane, prompt_id, storage_path, image_url, status, \
     score, evaluation_json, caption, created_at";

/// Status store on a SQLite database in WAL mode.
#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Opens (creating if missing) a database and applies migrations.
    ///
    /// Accepts a `sqlite:` URL or a plain filesystem path.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::info!(database = %url, "Status store opened");
        Ok(store)
    }

    /// A private in-memory database. Lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        // One connection that never expires, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await?;
        Ok(())
    }

    async fn update_run<'q>(
        &self,
        run_id: Uuid,
        query: SqliteQuery<'q>,
    ) -> Result<(), StoreError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn update_image<'q>(
        &self,
        run_id: Uuid,
        image_id: &str,
        query: SqliteQuery<'q>,
    ) -> Result<(), StoreError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ImageNotFound {
                run_id,
                image_id: image_id.to_string(),
            });
        }
        Ok(())
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value)
        .map_err(|e| StoreError::InvalidData(format!("bad uuid '{}': {}", value, e)))
}

fn row_to_run(row: &SqliteRow) -> Result<PipelineRun, StoreError> {
    let id: String = row.try_get("id")?;
    let subject_json: String = row.try_get("subject_json")?;
    let status: String = row.try_get("status")?;
    let artifact_json: Option<String> = row.try_get("artifact_json")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let deployed_at: Option<String> = row.try_get("deployed_at")?;

    let subject: SubjectInput = serde_json::from_str(&subject_json)?;
    let artifact: Option<TrainingArtifact> = artifact_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(PipelineRun {
        id: parse_uuid(&id)?,
        subject,
        status: RunStatus::from_str(&status).map_err(StoreError::InvalidData)?,
        training_attempts: row.try_get::<i64, _>("training_attempts")? as u32,
        training_job_id: row.try_get("training_job_id")?,
        error_message: row.try_get("error_message")?,
        validation_score: row.try_get("validation_score")?,
        dataset_size: row
            .try_get::<Option<i64>, _>("dataset_size")?
            .map(|v| v as u32),
        artifact,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        deployed_at: deployed_at.as_deref().map(parse_time).transpose()?,
    })
}

fn row_to_image(row: &SqliteRow) -> Result<CandidateImage, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let lane: String = row.try_get("lane")?;
    let status: String = row.try_get("status")?;
    let evaluation_json: Option<String> = row.try_get("evaluation_json")?;
    let created_at: String = row.try_get("created_at")?;

    let evaluation: Option<EvaluationDetail> = evaluation_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(CandidateImage {
        id: row.try_get("id")?,
        run_id: parse_uuid(&run_id)?,
        lane: PromptLane::from_str(&lane).map_err(StoreError::InvalidData)?,
        prompt_id: row.try_get("prompt_id")?,
        storage_path: row.try_get("storage_path")?,
        image_url: row.try_get("image_url")?,
        status: EvalStatus::from_str(&status).map_err(StoreError::InvalidData)?,
        score: row.try_get("score")?,
        evaluation,
        caption: row.try_get("caption")?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let subject_json = serde_json::to_string(&run.subject)?;
        let artifact_json = run
            .artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, subject_id, subject_json, status, training_attempts, training_job_id,
                error_message, validation_score, dataset_size, artifact_json,
                created_at, updated_at, deployed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.subject.subject_id)
        .bind(subject_json)
        .bind(run.status.as_str())
        .bind(run.training_attempts as i64)
        .bind(run.training_job_id.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.validation_score)
        .bind(run.dataset_size.map(|v| v as i64))
        .bind(artifact_json)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .bind(run.deployed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;

        row_to_run(&row)
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<PipelineRun>, StoreError> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM runs WHERE status = ?1 ORDER BY created_at",
                    RUN_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {} FROM runs ORDER BY created_at", RUN_COLUMNS);
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        rows.iter().map(row_to_run).collect()
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query(
                "UPDATE runs SET status = ?1, error_message = COALESCE(?2, error_message), \
                 updated_at = ?3 WHERE id = ?4",
            )
            .bind(status.as_str())
            .bind(error)
            .bind(now_text())
            .bind(run_id.to_string()),
        )
        .await
    }

    async fn begin_training_attempt(
        &self,
        run_id: Uuid,
        attempt: u32,
        job_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query(
                "UPDATE runs SET training_attempts = ?1, training_job_id = ?2, updated_at = ?3 \
                 WHERE id = ?4",
            )
            .bind(attempt as i64)
            .bind(job_id)
            .bind(now_text())
            .bind(run_id.to_string()),
        )
        .await
    }

    async fn set_training_job(&self, run_id: Uuid, job_id: Option<&str>) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query("UPDATE runs SET training_job_id = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(job_id)
                .bind(now_text())
                .bind(run_id.to_string()),
        )
        .await
    }

    async fn set_validation_score(&self, run_id: Uuid, score: f64) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query("UPDATE runs SET validation_score = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(score)
                .bind(now_text())
                .bind(run_id.to_string()),
        )
        .await
    }

    async fn set_dataset_size(&self, run_id: Uuid, size: u32) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query("UPDATE runs SET dataset_size = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(size as i64)
                .bind(now_text())
                .bind(run_id.to_string()),
        )
        .await
    }

    async fn promote_deployment(
        &self,
        run_id: Uuid,
        artifact: &TrainingArtifact,
        deployed_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let artifact_json = serde_json::to_string(artifact)?;
        let mut tx = self.pool.begin().await?;

        let (subject_id,): (String,) = sqlx::query_as("SELECT subject_id FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM runs WHERE subject_id = ?1 AND status = ?2 AND id != ?3")
                .bind(&subject_id)
                .bind(RunStatus::Deployed.as_str())
                .bind(run_id.to_string())
                .fetch_all(&mut *tx)
                .await?;

        let now = now_text();
        sqlx::query(
            "UPDATE runs SET status = ?1, updated_at = ?2 \
             WHERE subject_id = ?3 AND status = ?4 AND id != ?5",
        )
        .bind(RunStatus::Archived.as_str())
        .bind(&now)
        .bind(&subject_id)
        .bind(RunStatus::Deployed.as_str())
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE runs SET status = ?1, artifact_json = ?2, deployed_at = ?3, \
             error_message = NULL, updated_at = ?4 WHERE id = ?5",
        )
        .bind(RunStatus::Deployed.as_str())
        .bind(artifact_json)
        .bind(deployed_at.to_rfc3339())
        .bind(&now)
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        ids.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    async fn insert_image(&self, image: &CandidateImage) -> Result<(), StoreError> {
        let evaluation_json = image
            .evaluation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO candidate_images (
                run_id, id, lane, prompt_id, storage_path, image_url, status,
                score, evaluation_json, caption, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(image.run_id.to_string())
        .bind(&image.id)
        .bind(image.lane.as_str())
        .bind(&image.prompt_id)
        .bind(&image.storage_path)
        .bind(&image.image_url)
        .bind(image.status.as_str())
        .bind(image.score)
        .bind(evaluation_json)
        .bind(image.caption.as_deref())
        .bind(image.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_image(&self, run_id: Uuid, image_id: &str) -> Result<CandidateImage, StoreError> {
        let sql = format!(
            "SELECT {} FROM candidate_images WHERE run_id = ?1 AND id = ?2",
            IMAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::ImageNotFound {
                run_id,
                image_id: image_id.to_string(),
            })?;

        row_to_image(&row)
    }

    async fn list_images(&self, run_id: Uuid) -> Result<Vec<CandidateImage>, StoreError> {
        let sql = format!(
            "SELECT {} FROM candidate_images WHERE run_id = ?1 ORDER BY rowid",
            IMAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_image).collect()
    }

    async fn list_images_with_status(
        &self,
        run_id: Uuid,
        status: EvalStatus,
    ) -> Result<Vec<CandidateImage>, StoreError> {
        let sql = format!(
            "SELECT {} FROM candidate_images WHERE run_id = ?1 AND status = ?2 ORDER BY rowid",
            IMAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(run_id.to_string())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_image).collect()
    }

    async fn update_image_evaluation(
        &self,
        run_id: Uuid,
        image_id: &str,
        status: EvalStatus,
        detail: &EvaluationDetail,
    ) -> Result<(), StoreError> {
        let evaluation_json = serde_json::to_string(detail)?;
        self.update_image(
            run_id,
            image_id,
            sqlx::query(
                "UPDATE candidate_images SET status = ?1, score = ?2, evaluation_json = ?3 \
                 WHERE run_id = ?4 AND id = ?5",
            )
            .bind(status.as_str())
            .bind(detail.score())
            .bind(evaluation_json)
            .bind(run_id.to_string())
            .bind(image_id),
        )
        .await
    }

    async fn set_image_status(
        &self,
        run_id: Uuid,
        image_id: &str,
        status: EvalStatus,
    ) -> Result<(), StoreError> {
        self.update_image(
            run_id,
            image_id,
            sqlx::query("UPDATE candidate_images SET status = ?1 WHERE run_id = ?2 AND id = ?3")
                .bind(status.as_str())
                .bind(run_id.to_string())
                .bind(image_id),
        )
        .await
    }

    async fn set_image_caption(
        &self,
        run_id: Uuid,
        image_id: &str,
        caption: &str,
    ) -> Result<(), StoreError> {
        self.update_image(
            run_id,
            image_id,
            sqlx::query("UPDATE candidate_images SET caption = ?1 WHERE run_id = ?2 AND id = ?3")
                .bind(caption)
                .bind(run_id.to_string())
                .bind(image_id),
        )
        .await
    }

    async fn count_images(&self, run_id: Uuid, query: ImageQuery) -> Result<u32, StoreError> {
        let mut sql = String::from("SELECT COUNT(*) FROM candidate_images WHERE run_id = ?1");
        if query.status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        match query.captioned {
            Some(true) => sql.push_str(" AND caption IS NOT NULL"),
            Some(false) => sql.push_str(" AND caption IS NULL"),
            None => {}
        }

        let mut q = sqlx::query_as::<_, (i64,)>(&sql).bind(run_id.to_string());
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        let (count,) = q.fetch_one(&self.pool).await?;

        Ok(count as u32)
    }

    async fn image_counts(&self, run_id: Uuid) -> Result<ImageCounts, StoreError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*), COUNT(caption) FROM candidate_images \
             WHERE run_id = ?1 GROUP BY status",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ImageCounts::default();
        for (status, count, captioned) in rows {
            let count = count as u32;
            counts.total += count;
            counts.captioned += captioned as u32;
            match EvalStatus::from_str(&status).map_err(StoreError::InvalidData)? {
                EvalStatus::Pending => counts.pending = count,
                EvalStatus::Passed => counts.passed = count,
                EvalStatus::Failed => counts.failed = count,
                EvalStatus::Replaced => counts.replaced = count,
            }
        }

        Ok(counts)
    }

    async fn record_validation(
        &self,
        run_id: Uuid,
        result: &ValidationResult,
    ) -> Result<bool, StoreError> {
        let result_json = serde_json::to_string(result)?;
        let outcome = sqlx::query(
            r#"
            INSERT OR IGNORE INTO validation_results (
                run_id, attempt, overall_pass, mean_score, result_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(run_id.to_string())
        .bind(result.attempt as i64)
        .bind(result.overall_pass)
        .bind(result.mean_score)
        .bind(result_json)
        .bind(now_text())
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn list_validations(&self, run_id: Uuid) -> Result<Vec<ValidationResult>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT result_json FROM validation_results WHERE run_id = ?1 ORDER BY attempt",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|(json,)| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn register_consumer(
        &self,
        consumer_id: &str,
        subject_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO consumer_links (consumer_id, subject_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(consumer_id) DO UPDATE SET
                subject_id = excluded.subject_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(consumer_id)
        .bind(subject_id)
        .bind(now_text())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn link_active_adapter(
        &self,
        subject_id: &str,
        run_id: Uuid,
        adapter_url: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE consumer_links SET active_run_id = ?1, active_adapter_url = ?2, \
             updated_at = ?3 WHERE subject_id = ?4",
        )
        .bind(run_id.to_string())
        .bind(adapter_url)
        .bind(now_text())
        .bind(subject_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_consumers(&self, subject_id: &str) -> Result<Vec<ConsumerLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT consumer_id, subject_id, active_run_id, active_adapter_url, updated_at \
             FROM consumer_links WHERE subject_id = ?1 ORDER BY consumer_id",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let active_run_id: Option<String> = row.try_get("active_run_id")?;
                let updated_at: String = row.try_get("updated_at")?;
                Ok(ConsumerLink {
                    consumer_id: row.try_get("consumer_id")?,
                    subject_id: row.try_get("subject_id")?,
                    active_run_id: active_run_id.as_deref().map(parse_uuid).transpose()?,
                    active_adapter_url: row.try_get("active_adapter_url")?,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvalStatus, Verdict};
    use crate::training::TrainingParams;
    use std::collections::BTreeMap;

    fn subject() -> SubjectInput {
        SubjectInput::new("subj-1", "Ava Stone", "woman", "https://example.com/ref.png")
    }

    fn image(run_id: Uuid, id: &str) -> CandidateImage {
        CandidateImage::new(
            id,
            run_id,
            PromptLane::Primary,
            id,
            format!("datasets/{}/{}.png", run_id, id),
            format!("https://cdn.example.com/datasets/{}/{}.png", run_id, id),
        )
    }

    fn artifact(job: &str) -> TrainingArtifact {
        TrainingArtifact {
            url: format!("https://cdn.example.com/{}.safetensors", job),
            filename: "characters/char_ava_stone_00000000.safetensors".into(),
            size_bytes: 1024,
            training_job_id: job.into(),
            params: TrainingParams::default(),
        }
    }

    async fn store_with_run() -> (SqliteStatusStore, Uuid) {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let run = PipelineRun::new(Uuid::new_v4(), subject());
        store.create_run(&run).await.unwrap();
        (store, run.id)
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let (store, run_id) = store_with_run().await;

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.subject, subject());

        store
            .update_run_status(run_id, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();
        store
            .update_run_status(run_id, RunStatus::Failed, None)
            .await
            .unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_run() {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.get_run(missing).await,
            Err(StoreError::RunNotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.begin_training_attempt(missing, 2, None).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_training_fields() {
        let (store, run_id) = store_with_run().await;
        store.begin_training_attempt(run_id, 1, None).await.unwrap();
        store.set_training_job(run_id, Some("job-9")).await.unwrap();
        store.begin_training_attempt(run_id, 2, None).await.unwrap();
        assert!(store.get_run(run_id).await.unwrap().training_job_id.is_none());
        store.set_training_job(run_id, Some("job-9")).await.unwrap();
        store.set_validation_score(run_id, 7.5).await.unwrap();
        store.set_dataset_size(run_id, 24).await.unwrap();

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.training_attempts, 2);
        assert_eq!(run.training_job_id.as_deref(), Some("job-9"));
        assert_eq!(run.validation_score, Some(7.5));
        assert_eq!(run.dataset_size, Some(24));
    }

    #[tokio::test]
    async fn test_image_lifecycle_and_counts() {
        let (store, run_id) = store_with_run().await;
        for id in ["a", "b", "c", "d"] {
            store.insert_image(&image(run_id, id)).await.unwrap();
        }

        let scores = BTreeMap::from([
            ("identity".to_string(), 8.0),
            ("structure".to_string(), 8.0),
            ("technical".to_string(), 9.0),
        ]);
        let detail = EvaluationDetail::from_subscores(&scores, Some("PASS".into()), 7.0);
        store
            .update_image_evaluation(run_id, "a", EvalStatus::Passed, &detail)
            .await
            .unwrap();
        store
            .update_image_evaluation(
                run_id,
                "b",
                EvalStatus::Failed,
                &EvaluationDetail::errored("timeout"),
            )
            .await
            .unwrap();
        store
            .set_image_status(run_id, "c", EvalStatus::Replaced)
            .await
            .unwrap();
        store
            .set_image_caption(run_id, "a", "woman, smiling")
            .await
            .unwrap();

        let a = store.get_image(run_id, "a").await.unwrap();
        assert_eq!(a.status, EvalStatus::Passed);
        assert_eq!(a.evaluation.unwrap().verdict, Verdict::Pass);
        assert_eq!(a.caption.as_deref(), Some("woman, smiling"));

        let counts = store.image_counts(run_id).await.unwrap();
        assert_eq!(
            counts,
            ImageCounts {
                total: 4,
                pending: 1,
                passed: 1,
                failed: 1,
                replaced: 1,
                captioned: 1,
            }
        );

        let passed_uncaptioned = store
            .count_images(run_id, ImageQuery::with_status(EvalStatus::Passed).captioned(false))
            .await
            .unwrap();
        assert_eq!(passed_uncaptioned, 0);
        assert_eq!(
            store
                .count_images(run_id, ImageQuery::default().captioned(true))
                .await
                .unwrap(),
            1
        );

        let ids: Vec<_> = store
            .list_images(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_missing_image() {
        let (store, run_id) = store_with_run().await;
        assert!(matches!(
            store.set_image_caption(run_id, "nope", "x").await,
            Err(StoreError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_insert_once() {
        let (store, run_id) = store_with_run().await;
        let first = ValidationResult::from_scores(1, Vec::new(), 5);
        let mut again = first.clone();
        again.mean_score = 9.0;

        assert!(store.record_validation(run_id, &first).await.unwrap());
        assert!(!store.record_validation(run_id, &again).await.unwrap());

        let stored = store.list_validations(run_id).await.unwrap();
        assert_eq!(stored, vec![first]);
    }

    #[tokio::test]
    async fn test_deploy_archives_previous() {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let old = PipelineRun::new(Uuid::new_v4(), subject());
        let new = PipelineRun::new(Uuid::new_v4(), subject());
        store.create_run(&old).await.unwrap();
        store.create_run(&new).await.unwrap();

        let archived = store
            .promote_deployment(old.id, &artifact("old"), Utc::now())
            .await
            .unwrap();
        assert!(archived.is_empty());
        let archived = store
            .promote_deployment(new.id, &artifact("new"), Utc::now())
            .await
            .unwrap();

        assert_eq!(archived, vec![old.id]);
        assert_eq!(
            store.get_run(old.id).await.unwrap().status,
            RunStatus::Archived
        );
        let deployed = store.list_runs(Some(RunStatus::Deployed)).await.unwrap();
        assert_eq!(deployed.len(), 1);
        assert_eq!(
            deployed[0].artifact.as_ref().unwrap().training_job_id,
            "new"
        );
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_current_deployment() {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let current = PipelineRun::new(Uuid::new_v4(), subject());
        store.create_run(&current).await.unwrap();
        store
            .promote_deployment(current.id, &artifact("current"), Utc::now())
            .await
            .unwrap();

        let missing = Uuid::new_v4();
        assert!(matches!(
            store
                .promote_deployment(missing, &artifact("ghost"), Utc::now())
                .await,
            Err(StoreError::RunNotFound(id)) if id == missing
        ));
        assert_eq!(
            store.get_run(current.id).await.unwrap().status,
            RunStatus::Deployed
        );
    }

    #[tokio::test]
    async fn test_consumer_links() {
        let (store, run_id) = store_with_run().await;
        store.register_consumer("story-1", "subj-1").await.unwrap();
        store.register_consumer("story-2", "subj-1").await.unwrap();
        store.register_consumer("story-3", "other").await.unwrap();

        let updated = store
            .link_active_adapter("subj-1", run_id, "https://cdn/a.safetensors")
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let links = store.list_consumers("subj-1").await.unwrap();
        assert!(links
            .iter()
            .all(|l| l.active_run_id == Some(run_id)
                && l.active_adapter_url.as_deref() == Some("https://cdn/a.safetensors")));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.db");
        let path = path.to_str().unwrap();

        let run_id = {
            let store = SqliteStatusStore::connect(path).await.unwrap();
            let run = PipelineRun::new(Uuid::new_v4(), subject());
            store.create_run(&run).await.unwrap();
            store.pool().close().await;
            run.id
        };

        let reopened = SqliteStatusStore::connect(path).await.unwrap();
        assert_eq!(reopened.get_run(run_id).await.unwrap().id, run_id);
    }
}
