//! Partitioned job orchestrator
//!
//! Discovers partitions once, runs one [`ChunkStep`] per partition with a
//! bounded number in flight, then folds the partition outcomes into a single
//! job status. Partitions are independent: one failing neither stops nor
//! rolls back the others.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::JobRepository;
use crate::config::JobConfig;
use crate::error::BatchResult;
use crate::model::PartitionDescriptor;
use crate::partitioner::SegmentPartitioner;
use crate::step::{ChunkStep, PartitionResult, PartitionStatus, StepContext};

/// Terminal status of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// Completed only if every partition drained; any failure fails the job
    pub fn aggregate(partitions: &[PartitionResult]) -> Self {
        if partitions
            .iter()
            .any(|p| p.status == PartitionStatus::Failed)
        {
            JobStatus::Failed
        } else if partitions
            .iter()
            .all(|p| p.status == PartitionStatus::Drained)
        {
            JobStatus::Completed
        } else {
            JobStatus::Stopped
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one run, with one entry per partition in segment order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_name: String,
    pub run_id: i64,
    pub execution_id: Uuid,
    pub status: JobStatus,
    pub partitions: Vec<PartitionResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn total_read(&self) -> u64 {
        self.partitions.iter().map(|p| p.read_count).sum()
    }

    pub fn total_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.write_count).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.partitions.iter().map(|p| p.skip_count).sum()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn partition(&self, segment: i32) -> Option<&PartitionResult> {
        self.partitions.iter().find(|p| p.segment == segment)
    }
}

pub struct PartitionedJob {
    name: String,
    partitioner: SegmentPartitioner,
    step: Arc<ChunkStep>,
    repository: Arc<dyn JobRepository>,
    grid_size: usize,
    worker_pool_size: usize,
}

impl PartitionedJob {
    pub fn new(
        config: &JobConfig,
        partitioner: SegmentPartitioner,
        step: ChunkStep,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            partitioner,
            step: Arc::new(step),
            repository,
            grid_size: config.grid_size,
            worker_pool_size: config.worker_pool_size.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a fresh run under a newly allocated run id
    ///
    /// Returns `Err` only when the run could not start at all (run id
    /// allocation, segment discovery). Partition failures are reported in the
    /// returned [`JobResult`].
    pub async fn run(&self, cancel: &CancellationToken) -> BatchResult<JobResult> {
        let run_id = self.repository.start_run(&self.name).await?;
        self.execute(run_id, cancel).await
    }

    /// Re-run an existing run id from its checkpoints
    pub async fn resume(&self, run_id: i64, cancel: &CancellationToken) -> BatchResult<JobResult> {
        self.repository.reopen_run(&self.name, run_id).await?;
        info!(job = %self.name, run_id, "Resuming run");
        self.execute(run_id, cancel).await
    }

    async fn execute(&self, run_id: i64, cancel: &CancellationToken) -> BatchResult<JobResult> {
        let execution_id = Uuid::new_v4();
        let span = info_span!("job", job = %self.name, run_id, %execution_id);

        async move {
            let started_at = Utc::now();

            let partitions = match self.partitioner.partition(self.grid_size).await {
                Ok(partitions) => partitions,
                Err(e) => {
                    error!(error = %e, "Partitioning failed, no partition started");
                    if let Err(finish_err) = self
                        .repository
                        .finish_run(&self.name, run_id, JobStatus::Failed)
                        .await
                    {
                        warn!(error = %finish_err, "Could not record failed run");
                    }
                    return Err(e);
                },
            };

            info!(
                partitions = partitions.len(),
                concurrency = self.worker_pool_size,
                "Starting partitions"
            );

            let results = self.run_partitions(run_id, partitions, cancel).await;
            let status = JobStatus::aggregate(&results);

            self.repository
                .finish_run(&self.name, run_id, status)
                .await?;

            let result = JobResult {
                job_name: self.name.clone(),
                run_id,
                execution_id,
                status,
                partitions: results,
                started_at,
                finished_at: Utc::now(),
            };

            info!(
                status = %result.status,
                read = result.total_read(),
                written = result.total_written(),
                skipped = result.total_skipped(),
                duration_secs = result.duration_seconds(),
                "Job finished"
            );

            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Run every partition with at most `worker_pool_size` in flight
    async fn run_partitions(
        &self,
        run_id: i64,
        partitions: Vec<PartitionDescriptor>,
        cancel: &CancellationToken,
    ) -> Vec<PartitionResult> {
        let context = StepContext {
            job_name: self.name.clone(),
            run_id,
        };
        let total = partitions.len();

        let mut results: Vec<PartitionResult> = stream::iter(partitions)
            .map(|partition| {
                let step = self.step.clone();
                let context = context.clone();
                let cancel = cancel.clone();

                async move {
                    let task = {
                        let partition = partition.clone();
                        tokio::spawn(async move { step.execute(&context, &partition, &cancel).await })
                    };

                    match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(partition = %partition.name, error = %e, "Step task aborted");
                            PartitionResult::failed(&partition, format!("step task aborted: {e}"))
                        },
                    }
                }
            })
            .buffer_unordered(self.worker_pool_size)
            .inspect(|result| {
                info!(
                    partition = %result.partition,
                    status = ?result.status,
                    total,
                    "Partition finished"
                );
            })
            .collect()
            .await;

        results.sort_by_key(|r| r.segment);
        results
    }
}
