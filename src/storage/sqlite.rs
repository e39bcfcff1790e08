//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. The CLI and a running
//! scheduler may open the same file concurrently; every operation is a single
//! statement, so SQLite's own locking keeps them atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{RunStatus, Storage, StorageError, StoredRun};
use crate::core::job::{Job, JobCommand};
use crate::core::schedule::Schedule;
use crate::core::types::{JobName, RunId};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const JOB_COLUMNS: &str = "name, command, schedule, enabled, timeout_secs, max_retries, \
     retry_delay_secs, description, next_run_at, last_run_at, last_status, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, job_name, command, status, started_at, ended_at, attempts, exit_code, error, stdout, stderr";

type JobRow = (
    String,
    String,
    String,
    bool,
    i64,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    i64,
    i64,
);

type RunRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("timestamp out of range: {}", millis)))
}

fn parse_status(s: &str) -> Result<RunStatus, StorageError> {
    s.parse().map_err(StorageError::SerializationError)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn job_from_row(row: JobRow) -> Result<Job, StorageError> {
    let command: JobCommand = from_json(&row.1)?;
    let schedule: Schedule = from_json(&row.2)?;
    Ok(Job {
        name: JobName::new(row.0),
        command,
        schedule,
        enabled: row.3,
        timeout: Duration::from_secs(row.4.max(0) as u64),
        max_retries: row.5.map(|n| n.max(0) as u32),
        retry_delay: row.6.map(|s| Duration::from_secs(s.max(0) as u64)),
        description: row.7,
        next_run_at: row.8.map(from_millis).transpose()?,
        last_run_at: row.9.map(from_millis).transpose()?,
        last_status: row.10.as_deref().map(parse_status).transpose()?,
        created_at: from_millis(row.11)?,
        updated_at: from_millis(row.12)?,
    })
}

fn run_from_row(row: RunRow) -> Result<StoredRun, StorageError> {
    Ok(StoredRun {
        id: RunId::parse(&row.0)
            .map_err(|e| StorageError::SerializationError(format!("invalid uuid: {}", e)))?,
        job_name: JobName::new(row.1),
        command: row.2,
        status: parse_status(&row.3)?,
        started_at: from_millis(row.4)?,
        ended_at: row.5.map(from_millis).transpose()?,
        attempts: row.6.max(0) as u32,
        exit_code: row.7.map(|c| c as i32),
        error: row.8,
        stdout: row.9,
        stderr: row.10,
    })
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (name, command, schedule_type, schedule, enabled, timeout_secs,
                max_retries, retry_delay_secs, description, next_run_at, last_run_at,
                last_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.name.as_str())
        .bind(to_json(&job.command)?)
        .bind(job.schedule.kind())
        .bind(to_json(&job.schedule)?)
        .bind(job.enabled)
        .bind(job.timeout.as_secs() as i64)
        .bind(job.max_retries.map(i64::from))
        .bind(job.retry_delay.map(|d| d.as_secs() as i64))
        .bind(&job.description)
        .bind(job.next_run_at.map(to_millis))
        .bind(job.last_run_at.map(to_millis))
        .bind(job.last_status.map(|s| s.as_str()))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.name)))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_job(&self, name: &JobName) -> Result<Job, StorageError> {
        let row: JobRow =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE name = ?", JOB_COLUMNS))
                .bind(name.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?
                .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))?;

        job_from_row(row)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs ORDER BY created_at, name",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn delete_job(&self, name: &JobName) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", name)));
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        name: &JobName,
        enabled: bool,
        lapsed_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let now = to_millis(now);
        let lapsed_next = lapsed_next.map(to_millis);
        // Column references on the right-hand side see the pre-update row.
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                enabled = ?,
                updated_at = ?,
                next_run_at = CASE
                    WHEN ? = 1 AND ? IS NOT NULL AND (next_run_at IS NULL OR next_run_at < ?)
                    THEN ?
                    ELSE next_run_at
                END
            WHERE name = ?
            "#,
        )
        .bind(enabled)
        .bind(now)
        .bind(enabled)
        .bind(lapsed_next)
        .bind(now)
        .bind(lapsed_next)
        .bind(name.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", name)));
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        name: &JobName,
        last_run_at: DateTime<Utc>,
        last_status: RunStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET last_run_at = ?, last_status = ?, next_run_at = ? WHERE name = ?",
        )
        .bind(to_millis(last_run_at))
        .bind(last_status.as_str())
        .bind(next_run_at.map(to_millis))
        .bind(name.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", name)));
        }
        Ok(())
    }

    async fn update_next_run(
        &self,
        name: &JobName,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE jobs SET next_run_at = ? WHERE name = ?")
            .bind(next_run_at.map(to_millis))
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", name)));
        }
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE enabled = 1 AND next_run_at IS NOT NULL \
             AND next_run_at <= ? ORDER BY next_run_at, name",
            JOB_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn save_run(&self, run: StoredRun) -> Result<(), StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RUN_COLUMNS
        ))
        .bind(run.id.to_string())
        .bind(run.job_name.as_str())
        .bind(&run.command)
        .bind(run.status.as_str())
        .bind(to_millis(run.started_at))
        .bind(run.ended_at.map(to_millis))
        .bind(run.attempts as i64)
        .bind(run.exit_code.map(i64::from))
        .bind(&run.error)
        .bind(&run.stdout)
        .bind(&run.stderr)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("run: {}", run.id)))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_run(&self, id: &RunId) -> Result<StoredRun, StorageError> {
        let row: RunRow = sqlx::query_as(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("run: {}", id)))?;

        run_from_row(row)
    }

    async fn list_runs(
        &self,
        job: Option<&JobName>,
        limit: usize,
    ) -> Result<Vec<StoredRun>, StorageError> {
        let rows: Vec<RunRow> = match job {
            Some(name) => sqlx::query_as(&format!(
                "SELECT {} FROM runs WHERE job_name = ? ORDER BY started_at DESC LIMIT ?",
                RUN_COLUMNS
            ))
            .bind(name.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?,
            None => sqlx::query_as(&format!(
                "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?",
                RUN_COLUMNS
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?,
        };

        rows.into_iter().map(run_from_row).collect()
    }

    async fn update_run(&self, run: StoredRun) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?, ended_at = ?, attempts = ?, exit_code = ?, error = ?,
                stdout = ?, stderr = ?
            WHERE id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.ended_at.map(to_millis))
        .bind(run.attempts as i64)
        .bind(run.exit_code.map(i64::from))
        .bind(&run.error)
        .bind(&run.stdout)
        .bind(&run.stderr)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run: {}", run.id)));
        }
        Ok(())
    }

    async fn get_incomplete_runs(&self) -> Result<Vec<StoredRun>, StorageError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE status = 'running'",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(run_from_row).collect()
    }

    async fn mark_run_interrupted(
        &self,
        id: &RunId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'interrupted', ended_at = ?, \
             error = 'scheduler stopped before the run finished' WHERE id = ?",
        )
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run: {}", id)));
        }
        Ok(())
    }

    async fn prune_runs(&self, keep: usize) -> Result<usize, StorageError> {
        let result = sqlx::query(
            "DELETE FROM runs WHERE id IN \
             (SELECT id FROM runs ORDER BY started_at DESC LIMIT -1 OFFSET ?)",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() as usize)
    }
}
