//! DuckDB schema definitions and migration support.
//!
//! Three logical tables: `tasks` (lifecycle + snapshots), `samples`
//! (append-only per-sample outcomes), `leaderboard_cache` (aggregate rows
//! keyed by fingerprint slice).

use std::fmt;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

pub const DDL_TASKS: &str = "\
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    status TEXT NOT NULL,
    job TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    started_at BIGINT,
    completed_at BIGINT,
    progress INTEGER NOT NULL DEFAULT 0,
    plan_snapshot TEXT NOT NULL,
    result TEXT,
    error TEXT,
    revision BIGINT NOT NULL
);";

pub const DDL_INDEX_TASKS_FINGERPRINT: &str = "\
CREATE INDEX IF NOT EXISTS idx_tasks_fingerprint ON tasks(fingerprint);";

pub const DDL_INDEX_TASKS_STATUS: &str = "\
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);";

pub const DDL_SAMPLES: &str = "\
CREATE TABLE IF NOT EXISTS samples (
    task_id TEXT NOT NULL,
    model_name TEXT NOT NULL,
    sample_index INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    prompt TEXT NOT NULL,
    answer TEXT NOT NULL,
    correctness DOUBLE NOT NULL,
    skill_label TEXT,
    target_label TEXT,
    subject_label TEXT,
    task_label TEXT,
    dataset_name TEXT,
    metadata TEXT,
    ts BIGINT NOT NULL,
    PRIMARY KEY (task_id, model_name, sample_index)
);";

pub const DDL_INDEX_SAMPLES_FINGERPRINT: &str = "\
CREATE INDEX IF NOT EXISTS idx_samples_fingerprint ON samples(fingerprint, model_name);";

pub const DDL_LEADERBOARD_CACHE: &str = "\
CREATE TABLE IF NOT EXISTS leaderboard_cache (
    row_id TEXT NOT NULL UNIQUE,
    fingerprint TEXT NOT NULL,
    model_name TEXT NOT NULL,
    language TEXT NOT NULL,
    subject_type TEXT NOT NULL,
    task_type TEXT NOT NULL,
    score DOUBLE NOT NULL,
    sample_count BIGINT NOT NULL,
    last_updated BIGINT NOT NULL,
    quarantined BOOLEAN NOT NULL DEFAULT FALSE,
    quarantine_reason TEXT,
    source_task_id TEXT NOT NULL,
    evaluator_version INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (fingerprint, model_name, language, subject_type, task_type)
);";

pub const DDL_INDEX_CACHE_UPDATED: &str = "\
CREATE INDEX IF NOT EXISTS idx_cache_updated ON leaderboard_cache(last_updated);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_TASKS,
    DDL_INDEX_TASKS_FINGERPRINT,
    DDL_INDEX_TASKS_STATUS,
    DDL_SAMPLES,
    DDL_INDEX_SAMPLES_FINGERPRINT,
    DDL_LEADERBOARD_CACHE,
    DDL_INDEX_CACHE_UPDATED,
];

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Uses the `schema_version` table for idempotent version tracking.
/// Returns the version in effect afterwards.
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)
        .map_err(MigrationError::Duckdb)?;

    let current = get_current_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl).map_err(MigrationError::Duckdb)?;
        }
        record_version(conn, 1)?;
    }

    // Future migrations go here:
    // if current < 2 { ... record_version(conn, 2)?; }

    Ok(CURRENT_VERSION)
}

fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .map_err(MigrationError::Duckdb)?;
    let version: i32 = stmt
        .query_row([], |row| row.get(0))
        .map_err(MigrationError::Duckdb)?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, crate::task::epoch_ms()],
    )
    .map_err(MigrationError::Duckdb)?;
    Ok(())
}

/// Deterministic id for a leaderboard row, derived from its composite key.
/// Gives admin endpoints a single opaque handle per row.
pub fn cache_row_id(
    fingerprint: &str,
    model_name: &str,
    language: &str,
    subject_type: &str,
    task_type: &str,
) -> String {
    use sha2::{Digest, Sha256};
    let input = format!("{fingerprint}\x1f{model_name}\x1f{language}\x1f{subject_type}\x1f{task_type}");
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MigrationError {
    Duckdb(duckdb::Error),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Duckdb(e) => write!(f, "DuckDB migration error: {e}"),
        }
    }
}

impl std::error::Error for MigrationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
