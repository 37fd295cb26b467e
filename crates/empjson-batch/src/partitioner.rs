//! Segment partitioner
//!
//! One partition per distinct segment value actually present in the source.
//! Segments are disjoint by construction, so partitions never overlap and
//! never write the same identity.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::LayoutConfig;
use crate::error::{BatchError, BatchResult};
use crate::model::PartitionDescriptor;

/// Discovers the segment values present in the workload
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Distinct segment values; `None` stands for a NULL segment
    async fn distinct_segments(&self) -> BatchResult<Vec<Option<i32>>>;
}

/// Splits the workload into one partition per segment
pub struct SegmentPartitioner {
    source: Arc<dyn SegmentSource>,
}

impl SegmentPartitioner {
    pub fn new(source: Arc<dyn SegmentSource>) -> Self {
        Self { source }
    }

    /// Compute the partition set
    ///
    /// `grid_size` is only a hint: the partition count is the number of
    /// distinct segments. Rows with a NULL segment belong to no partition, so
    /// their presence fails discovery instead of silently skipping them.
    pub async fn partition(&self, grid_size: usize) -> BatchResult<Vec<PartitionDescriptor>> {
        let discovered = self.source.distinct_segments().await?;

        let mut segments = BTreeSet::new();
        for segment in discovered {
            match segment {
                Some(value) => {
                    segments.insert(value);
                },
                None => {
                    return Err(BatchError::discovery(
                        "source contains rows with a NULL segment; they would belong to no partition",
                    ))
                },
            }
        }

        let partitions: Vec<PartitionDescriptor> = segments
            .into_iter()
            .enumerate()
            .map(|(index, segment)| PartitionDescriptor::new(index, segment))
            .collect();

        if partitions.len() != grid_size {
            debug!(
                grid_size,
                partitions = partitions.len(),
                "Partition count follows discovered segments, not grid size"
            );
        }

        info!(partitions = partitions.len(), "Partitioned workload by segment");

        Ok(partitions)
    }
}

/// Segment discovery against the source view
pub struct PgSegmentSource {
    pool: Arc<PgPool>,
    query: String,
}

impl PgSegmentSource {
    pub fn new(pool: Arc<PgPool>, layout: &LayoutConfig) -> Self {
        let query = format!(
            "SELECT DISTINCT {segment} FROM {view} ORDER BY 1",
            segment = layout.segment_column,
            view = layout.source_view,
        );
        Self { pool, query }
    }
}

#[async_trait]
impl SegmentSource for PgSegmentSource {
    async fn distinct_segments(&self) -> BatchResult<Vec<Option<i32>>> {
        sqlx::query_scalar::<_, Option<i32>>(&self.query)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| BatchError::discovery(e.to_string()))
    }
}
