//! Database schema constants.
//!
//! All SQL schema definitions for the SQLite status store. Identifiers and
//! timestamps are stored as TEXT (UUID strings and RFC 3339 respectively).

/// One row per pipeline run. The subject input is kept as JSON so a run can
/// be resumed without the caller resubmitting it.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id                TEXT    PRIMARY KEY,
    subject_id        TEXT    NOT NULL,
    subject_json      TEXT    NOT NULL,
    status            TEXT    NOT NULL DEFAULT 'pending',
    training_attempts INTEGER NOT NULL DEFAULT 0,
    training_job_id   TEXT,
    error_message     TEXT,
    validation_score  REAL,
    dataset_size      INTEGER,
    artifact_json     TEXT,
    created_at        TEXT    NOT NULL,
    updated_at        TEXT    NOT NULL,
    deployed_at       TEXT
)
"#;

pub const CREATE_CANDIDATE_IMAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS candidate_images (
    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    id              TEXT NOT NULL,
    lane            TEXT NOT NULL,
    prompt_id       TEXT NOT NULL,
    storage_path    TEXT NOT NULL,
    image_url       TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    score           REAL,
    evaluation_json TEXT,
    caption         TEXT,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (run_id, id)
)
"#;

/// Insert-once: a second write for the same attempt is ignored.
pub const CREATE_VALIDATION_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS validation_results (
    run_id       TEXT    NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    attempt      INTEGER NOT NULL,
    overall_pass INTEGER NOT NULL,
    mean_score   REAL    NOT NULL,
    result_json  TEXT    NOT NULL,
    created_at   TEXT    NOT NULL,
    PRIMARY KEY (run_id, attempt)
)
"#;

/// Downstream consumers (stories, scenes, ...) that render a subject and
/// should pick up its active adapter.
pub const CREATE_CONSUMER_LINKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS consumer_links (
    consumer_id        TEXT PRIMARY KEY,
    subject_id         TEXT NOT NULL,
    active_run_id      TEXT,
    active_adapter_url TEXT,
    updated_at         TEXT NOT NULL
)
"#;

pub const CREATE_RUNS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)";

pub const CREATE_RUNS_SUBJECT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_subject ON runs(subject_id, status)";

pub const CREATE_IMAGES_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_candidate_images_status ON candidate_images(run_id, status)";

pub const CREATE_CONSUMERS_SUBJECT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_consumer_links_subject ON consumer_links(subject_id)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_RUNS_TABLE,
        CREATE_CANDIDATE_IMAGES_TABLE,
        CREATE_VALIDATION_RESULTS_TABLE,
        CREATE_CONSUMER_LINKS_TABLE,
        CREATE_RUNS_STATUS_INDEX,
        CREATE_RUNS_SUBJECT_INDEX,
        CREATE_IMAGES_STATUS_INDEX,
        CREATE_CONSUMERS_SUBJECT_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const RUNS: &str = "runs";
    pub const CANDIDATE_IMAGES: &str = "candidate_images";
    pub const VALIDATION_RESULTS: &str = "validation_results";
    pub const CONSUMER_LINKS: &str = "consumer_links";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 8);
        // Runs must come first (other tables reference it)
        assert!(statements[0].contains(tables::RUNS));
        assert!(statements[1].contains(tables::CANDIDATE_IMAGES));
        assert!(statements[4..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_one_statement_per_entry() {
        for statement in all_schema_statements() {
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }
}
