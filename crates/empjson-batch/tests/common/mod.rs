//! Shared fixtures for job-level tests
#![allow(dead_code)]

use async_trait::async_trait;
use empjson_batch::checkpoint::JobRepository;
use empjson_batch::config::JobConfig;
use empjson_batch::error::{BatchError, BatchResult};
use empjson_batch::model::{AddressGroup, FlatRecord, PartitionDescriptor, UpdateRecord};
use empjson_batch::partitioner::{SegmentPartitioner, SegmentSource};
use empjson_batch::reader::{ItemReader, RecordSource};
use empjson_batch::step::{ChunkStep, StepSettings};
use empjson_batch::transform::EmployeeDocumentProcessor;
use empjson_batch::writer::{InMemoryDocumentWriter, ItemWriter};
use empjson_batch::PartitionedJob;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,empjson_batch=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn home_address(line_one: &str, zip: i32) -> AddressGroup {
    AddressGroup {
        type_code: Some("HOME".to_string()),
        line_one: Some(line_one.to_string()),
        line_two: None,
        zip: Some(zip),
    }
}

/// Employee with a current HOME address and no permanent address
pub fn employee(id: i32, segment: i32) -> FlatRecord {
    FlatRecord {
        id,
        segment,
        first_name: Some(format!("First{id}")),
        last_name: Some(format!("Last{id}")),
        age: Some(20 + id % 40),
        date_of_birth: None,
        current: home_address(&format!("{id} Main St"), 10000 + id),
        permanent: AddressGroup::default(),
    }
}

/// `count` employees of one segment with consecutive ids from `first_id`
pub fn employees(segment: i32, first_id: i32, count: i32) -> Vec<FlatRecord> {
    (first_id..first_id + count)
        .map(|id| employee(id, segment))
        .collect()
}

/// Segment source answering with the segments present in a record set
pub struct FixedSegments(pub Vec<Option<i32>>);

impl FixedSegments {
    pub fn of(records: &[FlatRecord]) -> Self {
        let segments: BTreeSet<i32> = records.iter().map(|r| r.segment).collect();
        Self(segments.into_iter().map(Some).collect())
    }
}

#[async_trait]
impl SegmentSource for FixedSegments {
    async fn distinct_segments(&self) -> BatchResult<Vec<Option<i32>>> {
        Ok(self.0.clone())
    }
}

/// Writer that rejects, as a whole, any batch touching a poisoned id
///
/// Stops failing after `failures` rejected batches. Every accepted write of an
/// id is counted so tests can detect re-writes.
pub struct FailingWriter {
    inner: InMemoryDocumentWriter,
    poisoned: HashSet<i32>,
    failures: AtomicUsize,
    writes: Mutex<HashMap<i32, usize>>,
}

impl FailingWriter {
    pub fn new(inner: InMemoryDocumentWriter, poisoned: impl IntoIterator<Item = i32>, failures: usize) -> Self {
        Self {
            inner,
            poisoned: poisoned.into_iter().collect(),
            failures: AtomicUsize::new(failures),
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn reliable(inner: InMemoryDocumentWriter) -> Self {
        Self::new(inner, [], 0)
    }

    pub fn write_count(&self, id: i32) -> usize {
        self.writes.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn max_write_count(&self) -> usize {
        self.writes.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl ItemWriter for FailingWriter {
    async fn write(&self, items: &[UpdateRecord]) -> BatchResult<()> {
        let poisoned = items.iter().any(|item| self.poisoned.contains(&item.id));
        if poisoned {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BatchError::Write {
                    batch_size: items.len(),
                    source: sqlx::Error::PoolTimedOut,
                });
            }
        }

        self.inner.write(items).await?;

        let mut writes = self.writes.lock().unwrap();
        for item in items {
            *writes.entry(item.id).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Writer that cancels a token once it has accepted `after` batches
pub struct CancellingWriter {
    inner: InMemoryDocumentWriter,
    cancel: CancellationToken,
    after: usize,
    batches: AtomicUsize,
}

impl CancellingWriter {
    pub fn new(inner: InMemoryDocumentWriter, cancel: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            cancel,
            after,
            batches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ItemWriter for CancellingWriter {
    async fn write(&self, items: &[UpdateRecord]) -> BatchResult<()> {
        self.inner.write(items).await?;
        if self.batches.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.cancel.cancel();
        }
        Ok(())
    }
}

/// Record source that tracks how many partitions are open at once
pub struct TrackedSource {
    inner: Arc<dyn RecordSource>,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl TrackedSource {
    pub fn new(inner: Arc<dyn RecordSource>, delay: Duration) -> Self {
        Self {
            inner,
            open: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for TrackedSource {
    async fn open(
        &self,
        partition: &PartitionDescriptor,
        resume_after: Option<i32>,
    ) -> BatchResult<Box<dyn ItemReader>> {
        let reader = self.inner.open(partition, resume_after).await?;
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(TrackedReader {
            inner: reader,
            open: self.open.clone(),
            delay: self.delay,
        }))
    }
}

struct TrackedReader {
    inner: Box<dyn ItemReader>,
    open: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl ItemReader for TrackedReader {
    async fn read(&mut self) -> BatchResult<Option<FlatRecord>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read().await
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn job_config(chunk_size: usize, worker_pool_size: usize) -> JobConfig {
    JobConfig {
        name: "importEmployeeJob".to_string(),
        chunk_size,
        fetch_size: chunk_size,
        worker_pool_size,
        grid_size: worker_pool_size,
        read_timeout_secs: 5,
        write_timeout_secs: 5,
    }
}

pub fn build_job(
    config: &JobConfig,
    segments: Arc<dyn SegmentSource>,
    source: Arc<dyn RecordSource>,
    writer: Arc<dyn ItemWriter>,
    repository: Arc<dyn JobRepository>,
) -> PartitionedJob {
    let step = ChunkStep::new(
        source,
        Arc::new(EmployeeDocumentProcessor),
        writer,
        repository.clone(),
        StepSettings::from(config),
    );
    PartitionedJob::new(config, SegmentPartitioner::new(segments), step, repository)
}
