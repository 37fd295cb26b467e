//! Job runs and per-partition checkpoints
//!
//! A checkpoint is the committed cursor of one partition within one run. It
//! only moves after a chunk has been written, so resuming from it never
//! rewrites a committed chunk and never loses an uncommitted one.
//!
//! Checkpoints are keyed by segment, not by partition name: names follow the
//! discovery order of a run, and a resume may discover a different segment
//! set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{BatchError, BatchResult};
use crate::job::JobStatus;
use crate::model::PartitionDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
        }
    }
}

impl From<String> for CheckpointStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "completed" => CheckpointStatus::Completed,
            _ => CheckpointStatus::InProgress,
        }
    }
}

/// Committed progress of one partition in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub run_id: i64,
    pub partition_name: String,
    pub segment: i32,
    /// Source records consumed by committed chunks, skips included
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    pub chunk_count: u64,
    /// Identity of the last record of the last committed chunk
    pub last_id: Option<i32>,
    pub status: CheckpointStatus,
}

impl Checkpoint {
    pub fn new(job_name: &str, run_id: i64, partition: &PartitionDescriptor) -> Self {
        Self {
            job_name: job_name.to_string(),
            run_id,
            partition_name: partition.name.clone(),
            segment: partition.segment,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            chunk_count: 0,
            last_id: None,
            status: CheckpointStatus::InProgress,
        }
    }

    /// Cursor after one more committed chunk
    pub fn advanced(&self, read: u64, written: u64, skipped: u64, last_id: Option<i32>) -> Self {
        Self {
            read_count: self.read_count + read,
            write_count: self.write_count + written,
            skip_count: self.skip_count + skipped,
            chunk_count: self.chunk_count + 1,
            last_id: last_id.or(self.last_id),
            ..self.clone()
        }
    }

    pub fn completed(&self) -> Self {
        Self {
            status: CheckpointStatus::Completed,
            ..self.clone()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CheckpointStatus::Completed
    }
}

/// Run identity and checkpoint persistence
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Allocate the next run id for `job_name`; ids only ever increase
    async fn start_run(&self, job_name: &str) -> BatchResult<i64>;

    /// Mark an existing run as restarted
    async fn reopen_run(&self, job_name: &str, run_id: i64) -> BatchResult<()>;

    async fn finish_run(&self, job_name: &str, run_id: i64, status: JobStatus) -> BatchResult<()>;

    /// Checkpoint of `segment` within the run, whatever partition name it
    /// was saved under
    async fn load_checkpoint(
        &self,
        job_name: &str,
        run_id: i64,
        segment: i32,
    ) -> BatchResult<Option<Checkpoint>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()>;
}

#[derive(Default)]
struct MemoryState {
    last_run_id: i64,
    runs: HashMap<(String, i64), Option<JobStatus>>,
    checkpoints: HashMap<(String, i64, i32), Checkpoint>,
}

/// Process-local repository; state dies with the process
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Terminal status recorded for a run, `None` while it is still open
    pub fn run_status(&self, job_name: &str, run_id: i64) -> Option<JobStatus> {
        self.state()
            .runs
            .get(&(job_name.to_string(), run_id))
            .copied()
            .flatten()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn start_run(&self, job_name: &str) -> BatchResult<i64> {
        let mut state = self.state();
        state.last_run_id += 1;
        let run_id = state.last_run_id;
        state.runs.insert((job_name.to_string(), run_id), None);
        Ok(run_id)
    }

    async fn reopen_run(&self, job_name: &str, run_id: i64) -> BatchResult<()> {
        let mut state = self.state();
        match state.runs.get_mut(&(job_name.to_string(), run_id)) {
            Some(status) => {
                *status = None;
                Ok(())
            },
            None => Err(BatchError::UnknownRun {
                job_name: job_name.to_string(),
                run_id,
            }),
        }
    }

    async fn finish_run(&self, job_name: &str, run_id: i64, status: JobStatus) -> BatchResult<()> {
        self.state()
            .runs
            .insert((job_name.to_string(), run_id), Some(status));
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        job_name: &str,
        run_id: i64,
        segment: i32,
    ) -> BatchResult<Option<Checkpoint>> {
        let key = (job_name.to_string(), run_id, segment);
        Ok(self.state().checkpoints.get(&key).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()> {
        let key = (
            checkpoint.job_name.clone(),
            checkpoint.run_id,
            checkpoint.segment,
        );
        self.state().checkpoints.insert(key, checkpoint.clone());
        Ok(())
    }
}

/// Repository backed by the `batch_job_run` and `batch_partition_checkpoint` tables
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Arc<PgPool>,
}

impl PgJobRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint, sqlx::Error> {
    Ok(Checkpoint {
        job_name: row.try_get("job_name")?,
        run_id: row.try_get("run_id")?,
        partition_name: row.try_get("partition_name")?,
        segment: row.try_get("segment")?,
        read_count: count(row.try_get("read_count")?),
        write_count: count(row.try_get("write_count")?),
        skip_count: count(row.try_get("skip_count")?),
        chunk_count: count(row.try_get("chunk_count")?),
        last_id: row.try_get("last_id")?,
        status: row.try_get::<String, _>("status")?.into(),
    })
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn start_run(&self, job_name: &str) -> BatchResult<i64> {
        let run_id: i64 =
            sqlx::query_scalar("INSERT INTO batch_job_run (job_name) VALUES ($1) RETURNING run_id")
                .bind(job_name)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| BatchError::checkpoint(format!("Failed to start run: {e}")))?;

        Ok(run_id)
    }

    async fn reopen_run(&self, job_name: &str, run_id: i64) -> BatchResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batch_job_run
            SET status = 'restarted', finished_at = NULL
            WHERE job_name = $1 AND run_id = $2
            "#,
        )
        .bind(job_name)
        .bind(run_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| BatchError::checkpoint(format!("Failed to reopen run: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BatchError::UnknownRun {
                job_name: job_name.to_string(),
                run_id,
            });
        }

        Ok(())
    }

    async fn finish_run(&self, job_name: &str, run_id: i64, status: JobStatus) -> BatchResult<()> {
        sqlx::query(
            r#"
            UPDATE batch_job_run
            SET status = $1, finished_at = NOW()
            WHERE job_name = $2 AND run_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(job_name)
        .bind(run_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| BatchError::checkpoint(format!("Failed to finish run: {e}")))?;

        Ok(())
    }

    async fn load_checkpoint(
        &self,
        job_name: &str,
        run_id: i64,
        segment: i32,
    ) -> BatchResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT job_name, run_id, partition_name, segment, read_count, write_count,
                   skip_count, chunk_count, last_id, status
            FROM batch_partition_checkpoint
            WHERE job_name = $1 AND run_id = $2 AND segment = $3
            "#,
        )
        .bind(job_name)
        .bind(run_id)
        .bind(segment)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| BatchError::checkpoint(format!("Failed to load checkpoint: {e}")))?;

        row.as_ref()
            .map(checkpoint_from_row)
            .transpose()
            .map_err(|e| BatchError::checkpoint(format!("Malformed checkpoint row: {e}")))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_partition_checkpoint (
                job_name, run_id, partition_name, segment, read_count, write_count,
                skip_count, chunk_count, last_id, status, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (job_name, run_id, segment) DO UPDATE
            SET partition_name = EXCLUDED.partition_name,
                read_count = EXCLUDED.read_count,
                write_count = EXCLUDED.write_count,
                skip_count = EXCLUDED.skip_count,
                chunk_count = EXCLUDED.chunk_count,
                last_id = EXCLUDED.last_id,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(&checkpoint.job_name)
        .bind(checkpoint.run_id)
        .bind(&checkpoint.partition_name)
        .bind(checkpoint.segment)
        .bind(db_count(checkpoint.read_count))
        .bind(db_count(checkpoint.write_count))
        .bind(db_count(checkpoint.skip_count))
        .bind(db_count(checkpoint.chunk_count))
        .bind(checkpoint.last_id)
        .bind(checkpoint.status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| BatchError::checkpoint(format!("Failed to save checkpoint: {e}")))?;

        Ok(())
    }
}
