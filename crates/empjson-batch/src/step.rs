//! Chunk-oriented step engine
//!
//! Drives one partition through `Reading -> Transforming -> Writing ->
//! Committed` until the reader is drained. A chunk is committed by the writer
//! first and by the checkpoint second; the checkpoint therefore never claims
//! a chunk the writer did not persist.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::{Checkpoint, JobRepository};
use crate::config::JobConfig;
use crate::error::{BatchError, BatchResult};
use crate::model::{FlatRecord, PartitionDescriptor, UpdateRecord};
use crate::reader::{ItemReader, RecordSource};
use crate::transform::ItemProcessor;
use crate::writer::ItemWriter;

/// Where a step currently is in its chunk loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Reading,
    Transforming,
    Writing,
    Committed,
    Drained,
    Failed,
    Stopped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Drained | StepState::Failed | StepState::Stopped)
    }

    /// Transitions the chunk loop is allowed to make
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Reading, Transforming) | (Reading, Writing) | (Reading, Drained) | (Reading, Stopped) => true,
            (Transforming, Reading) | (Transforming, Writing) => true,
            (Writing, Committed) => true,
            (Committed, Reading) | (Committed, Drained) | (Committed, Stopped) => true,
            _ => false,
        }
    }
}

/// Terminal outcome of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    Drained,
    Failed,
    Stopped,
}

/// Per-partition audit line of a job result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub partition: String,
    pub segment: i32,
    pub status: PartitionStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    pub chunk_count: u64,
    pub error: Option<String>,
}

impl PartitionResult {
    fn from_checkpoint(checkpoint: &Checkpoint, status: PartitionStatus, error: Option<String>) -> Self {
        Self {
            partition: checkpoint.partition_name.clone(),
            segment: checkpoint.segment,
            status,
            read_count: checkpoint.read_count,
            write_count: checkpoint.write_count,
            skip_count: checkpoint.skip_count,
            chunk_count: checkpoint.chunk_count,
            error,
        }
    }

    pub(crate) fn failed(partition: &PartitionDescriptor, error: String) -> Self {
        Self {
            partition: partition.name.clone(),
            segment: partition.segment,
            status: PartitionStatus::Failed,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            chunk_count: 0,
            error: Some(error),
        }
    }
}

/// Job identity a step executes under
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_name: String,
    pub run_id: i64,
}

/// Sizing and timeouts of a step
#[derive(Debug, Clone)]
pub struct StepSettings {
    pub chunk_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&JobConfig> for StepSettings {
    fn from(config: &JobConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// One chunk pulled from the reader and transformed
struct Chunk {
    consumed: u64,
    skipped: u64,
    last_id: Option<i32>,
    items: Vec<UpdateRecord>,
    end_of_input: bool,
}

async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> BatchResult<T>
where
    F: Future<Output = BatchResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BatchError::timeout(operation, limit))?
}

/// Reader -> processor -> writer loop for one partition at a time
pub struct ChunkStep {
    source: Arc<dyn RecordSource>,
    processor: Arc<dyn ItemProcessor>,
    writer: Arc<dyn ItemWriter>,
    repository: Arc<dyn JobRepository>,
    settings: StepSettings,
}

impl ChunkStep {
    pub fn new(
        source: Arc<dyn RecordSource>,
        processor: Arc<dyn ItemProcessor>,
        writer: Arc<dyn ItemWriter>,
        repository: Arc<dyn JobRepository>,
        settings: StepSettings,
    ) -> Self {
        Self {
            source,
            processor,
            writer,
            repository,
            settings,
        }
    }

    /// Run one partition to a terminal state
    ///
    /// Never returns an error: failures are folded into the result so the job
    /// can report every partition.
    pub async fn execute(
        &self,
        context: &StepContext,
        partition: &PartitionDescriptor,
        cancel: &CancellationToken,
    ) -> PartitionResult {
        let span = info_span!(
            "step",
            run_id = context.run_id,
            partition = %partition.name,
            segment = partition.segment
        );

        async move {
            let checkpoint = match bounded(
                "load checkpoint",
                self.settings.read_timeout,
                self.repository
                    .load_checkpoint(&context.job_name, context.run_id, partition.segment),
            )
            .await
            {
                Ok(Some(checkpoint)) if checkpoint.segment != partition.segment => {
                    let e = BatchError::checkpoint(format!(
                        "checkpoint for segment {} returned for segment {}",
                        checkpoint.segment, partition.segment
                    ));
                    error!(error = %e, "Checkpoint belongs to another segment");
                    return PartitionResult::failed(partition, e.to_string());
                },
                Ok(Some(checkpoint)) => {
                    if checkpoint.partition_name != partition.name {
                        debug!(
                            saved_as = %checkpoint.partition_name,
                            "Segment moved to another partition index since the checkpoint was saved"
                        );
                    }
                    Checkpoint {
                        partition_name: partition.name.clone(),
                        ..checkpoint
                    }
                },
                Ok(None) => Checkpoint::new(&context.job_name, context.run_id, partition),
                Err(e) => {
                    error!(error = %e, "Could not load checkpoint");
                    return PartitionResult::failed(partition, e.to_string());
                },
            };

            if checkpoint.is_completed() {
                info!(
                    read = checkpoint.read_count,
                    "Partition already drained in this run, nothing to do"
                );
                return PartitionResult::from_checkpoint(&checkpoint, PartitionStatus::Drained, None);
            }

            if checkpoint.chunk_count > 0 {
                info!(
                    chunks = checkpoint.chunk_count,
                    last_id = ?checkpoint.last_id,
                    "Resuming partition from checkpoint"
                );
            }

            self.run_chunks(partition, checkpoint, cancel).await
        }
        .instrument(span)
        .await
    }

    async fn run_chunks(
        &self,
        partition: &PartitionDescriptor,
        mut checkpoint: Checkpoint,
        cancel: &CancellationToken,
    ) -> PartitionResult {
        let mut state = StepState::Reading;

        let mut reader = match bounded(
            "open reader",
            self.settings.read_timeout,
            self.source.open(partition, checkpoint.last_id),
        )
        .await
        {
            Ok(reader) => reader,
            Err(e) => return self.fail(&checkpoint, &mut state, e),
        };

        loop {
            if cancel.is_cancelled() {
                self.transition(&mut state, StepState::Stopped);
                info!(chunks = checkpoint.chunk_count, "Cancelled before next chunk");
                return PartitionResult::from_checkpoint(&checkpoint, PartitionStatus::Stopped, None);
            }
            self.transition(&mut state, StepState::Reading);

            let chunk = match self.read_chunk(reader.as_mut(), &mut state).await {
                Ok(chunk) => chunk,
                Err(e) => return self.fail(&checkpoint, &mut state, e),
            };

            if chunk.consumed == 0 {
                return self.drain(checkpoint, &mut state).await;
            }

            self.transition(&mut state, StepState::Writing);
            if let Err(e) = bounded(
                "write batch",
                self.settings.write_timeout,
                self.writer.write(&chunk.items),
            )
            .await
            {
                return self.fail(&checkpoint, &mut state, e);
            }

            let next = checkpoint.advanced(
                chunk.consumed,
                chunk.items.len() as u64,
                chunk.skipped,
                chunk.last_id,
            );
            if let Err(e) = self.save(&next).await {
                return self.fail(&checkpoint, &mut state, e);
            }
            checkpoint = next;
            self.transition(&mut state, StepState::Committed);

            debug!(
                chunk = checkpoint.chunk_count,
                read = chunk.consumed,
                written = chunk.items.len(),
                skipped = chunk.skipped,
                "Chunk committed"
            );

            if chunk.end_of_input {
                return self.drain(checkpoint, &mut state).await;
            }
        }
    }

    /// Pull up to `chunk_size` records, transforming each as it arrives
    async fn read_chunk(
        &self,
        reader: &mut dyn ItemReader,
        state: &mut StepState,
    ) -> BatchResult<Chunk> {
        let mut chunk = Chunk {
            consumed: 0,
            skipped: 0,
            last_id: None,
            items: Vec::with_capacity(self.settings.chunk_size),
            end_of_input: false,
        };

        while (chunk.consumed as usize) < self.settings.chunk_size {
            let record = bounded("read record", self.settings.read_timeout, reader.read()).await?;
            let Some(record) = record else {
                chunk.end_of_input = true;
                break;
            };

            self.transition(state, StepState::Transforming);
            chunk.consumed += 1;
            chunk.last_id = Some(record.id);

            match self.transform(&record) {
                Some(item) => chunk.items.push(item),
                None => chunk.skipped += 1,
            }
            self.transition(state, StepState::Reading);
        }

        Ok(chunk)
    }

    fn transform(&self, record: &FlatRecord) -> Option<UpdateRecord> {
        match self.processor.process(record) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(record_id = e.record_id(), error = %e, "Skipping record");
                None
            },
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> BatchResult<()> {
        bounded(
            "save checkpoint",
            self.settings.write_timeout,
            self.repository.save_checkpoint(checkpoint),
        )
        .await
    }

    async fn drain(&self, checkpoint: Checkpoint, state: &mut StepState) -> PartitionResult {
        let completed = checkpoint.completed();
        if let Err(e) = self.save(&completed).await {
            return self.fail(&checkpoint, state, e);
        }
        self.transition(state, StepState::Drained);

        info!(
            read = completed.read_count,
            written = completed.write_count,
            skipped = completed.skip_count,
            chunks = completed.chunk_count,
            "Partition drained"
        );

        PartitionResult::from_checkpoint(&completed, PartitionStatus::Drained, None)
    }

    /// The checkpoint passed in is the last committed one; it is left as is
    fn fail(&self, checkpoint: &Checkpoint, state: &mut StepState, err: BatchError) -> PartitionResult {
        let failed_in = *state;
        self.transition(state, StepState::Failed);

        error!(
            state = ?failed_in,
            chunks = checkpoint.chunk_count,
            error = %err,
            "Partition failed"
        );

        PartitionResult::from_checkpoint(checkpoint, PartitionStatus::Failed, Some(err.to_string()))
    }

    fn transition(&self, state: &mut StepState, next: StepState) {
        if *state == next {
            return;
        }
        debug_assert!(
            state.can_transition_to(next),
            "illegal step transition {:?} -> {:?}",
            state,
            next
        );
        *state = next;
    }
}
