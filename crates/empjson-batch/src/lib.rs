//! Empjson Batch Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Partitioned, chunk-oriented migration of flat employee records into JSON
//! documents stored on the employee table.
//!
//! # Pipeline
//!
//! - **Partitioner**: one partition per distinct segment of the source view
//! - **Reader**: keyset-paged cursor over one segment, in identity order
//! - **Transformer**: flat record to [`model::EmployeeDoc`] JSON
//! - **Writer**: one batched update per chunk, all or nothing
//! - **Step**: chunk loop with a checkpoint after every committed chunk
//! - **Job**: bounded fan-out over partitions and status aggregation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use empjson_batch::{
//!     checkpoint::PgJobRepository, config::BatchConfig, db, job::PartitionedJob,
//!     partitioner::{PgSegmentSource, SegmentPartitioner}, reader::PgRecordSource,
//!     step::{ChunkStep, StepSettings}, transform::EmployeeDocumentProcessor,
//!     writer::PgDocumentWriter,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BatchConfig::load()?;
//!     let pool = Arc::new(db::create_pool(&config.database).await?);
//!     db::run_migrations(&pool).await?;
//!
//!     let repository = Arc::new(PgJobRepository::new(pool.clone()));
//!     let step = ChunkStep::new(
//!         Arc::new(PgRecordSource::new(pool.clone(), &config.layout, config.job.fetch_size)),
//!         Arc::new(EmployeeDocumentProcessor),
//!         Arc::new(PgDocumentWriter::new(pool.clone(), &config.layout)),
//!         repository.clone(),
//!         StepSettings::from(&config.job),
//!     );
//!     let partitioner =
//!         SegmentPartitioner::new(Arc::new(PgSegmentSource::new(pool.clone(), &config.layout)));
//!
//!     let job = PartitionedJob::new(&config.job, partitioner, step, repository);
//!     let result = job.run(&CancellationToken::new()).await?;
//!     println!("{} ({} written)", result.status, result.total_written());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod model;
pub mod partitioner;
pub mod reader;
pub mod step;
pub mod transform;
pub mod writer;

pub use error::{BatchError, BatchResult, TransformError};
pub use job::{JobResult, JobStatus, PartitionedJob};
pub use step::{PartitionResult, PartitionStatus};
