//! Partition reader
//!
//! Streams one segment of the source view in identity order. The Postgres
//! implementation pages with a keyset cursor (`id > last seen`), so at most
//! one page of `fetch_size` rows is held in memory and a resume only needs
//! the last committed identity.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use crate::config::LayoutConfig;
use crate::error::{BatchError, BatchResult};
use crate::model::{FlatRecord, PartitionDescriptor};

/// Forward-only cursor over one partition
#[async_trait]
pub trait ItemReader: Send {
    /// Next record, or `None` once the partition is exhausted
    async fn read(&mut self) -> BatchResult<Option<FlatRecord>>;
}

/// Opens readers scoped to a partition
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Open a reader positioned after `resume_after` (identity), or at the
    /// start of the partition when `None`
    async fn open(
        &self,
        partition: &PartitionDescriptor,
        resume_after: Option<i32>,
    ) -> BatchResult<Box<dyn ItemReader>>;
}

/// Record source over the configured view
pub struct PgRecordSource {
    pool: Arc<PgPool>,
    fetch_size: usize,
    page_query: Arc<str>,
}

impl PgRecordSource {
    pub fn new(pool: Arc<PgPool>, layout: &LayoutConfig, fetch_size: usize) -> Self {
        Self {
            pool,
            fetch_size: fetch_size.max(1),
            page_query: page_query(layout).into(),
        }
    }
}

/// Keyset page query; `$1` segment, `$2` last seen identity (NULL at start),
/// `$3` page size
fn page_query(layout: &LayoutConfig) -> String {
    let columns: Vec<String> = FlatRecord::COLUMNS
        .iter()
        .map(|column| match *column {
            "id" => format!("{} AS id", layout.source_id_column),
            "segment" => format!("{} AS segment", layout.segment_column),
            other => other.to_string(),
        })
        .collect();

    format!(
        "SELECT {columns} FROM {view} \
         WHERE {segment} = $1 AND ($2::int4 IS NULL OR {id} > $2) \
         ORDER BY {id} LIMIT $3",
        columns = columns.join(", "),
        view = layout.source_view,
        segment = layout.segment_column,
        id = layout.source_id_column,
    )
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn open(
        &self,
        partition: &PartitionDescriptor,
        resume_after: Option<i32>,
    ) -> BatchResult<Box<dyn ItemReader>> {
        Ok(Box::new(PgCursorReader {
            pool: self.pool.clone(),
            query: self.page_query.clone(),
            segment: partition.segment,
            fetch_size: self.fetch_size,
            last_id: resume_after,
            buffer: VecDeque::with_capacity(self.fetch_size),
            exhausted: false,
        }))
    }
}

/// Keyset-paged reader over one segment
pub struct PgCursorReader {
    pool: Arc<PgPool>,
    query: Arc<str>,
    segment: i32,
    fetch_size: usize,
    last_id: Option<i32>,
    buffer: VecDeque<FlatRecord>,
    exhausted: bool,
}

impl PgCursorReader {
    async fn fetch_page(&mut self) -> BatchResult<()> {
        let query = self.query.clone();
        let rows = sqlx::query(&query)
            .bind(self.segment)
            .bind(self.last_id)
            .bind(self.fetch_size as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|source| BatchError::Read {
                segment: self.segment,
                source,
            })?;

        if rows.len() < self.fetch_size {
            self.exhausted = true;
        }

        for row in &rows {
            let record = FlatRecord::from_row(row).map_err(BatchError::RowMapping)?;
            self.last_id = Some(record.id);
            self.buffer.push_back(record);
        }

        trace!(segment = self.segment, rows = rows.len(), "Fetched page");
        Ok(())
    }
}

#[async_trait]
impl ItemReader for PgCursorReader {
    async fn read(&mut self) -> BatchResult<Option<FlatRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }
}

/// Reader over records already in memory, in identity order
pub struct VecReader {
    records: std::vec::IntoIter<FlatRecord>,
}

impl VecReader {
    pub fn new(records: Vec<FlatRecord>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl ItemReader for VecReader {
    async fn read(&mut self) -> BatchResult<Option<FlatRecord>> {
        Ok(self.records.next())
    }
}

/// Record source over an in-memory table
///
/// Applies the same scoping as the SQL reader: segment filter, identity
/// order, resume strictly after the given identity.
#[derive(Clone, Default)]
pub struct InMemoryRecordSource {
    records: Arc<Vec<FlatRecord>>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<FlatRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn open(
        &self,
        partition: &PartitionDescriptor,
        resume_after: Option<i32>,
    ) -> BatchResult<Box<dyn ItemReader>> {
        let mut scoped: Vec<FlatRecord> = self
            .records
            .iter()
            .filter(|r| r.segment == partition.segment)
            .filter(|r| resume_after.map_or(true, |after| r.id > after))
            .cloned()
            .collect();
        scoped.sort_by_key(|r| r.id);

        Ok(Box::new(VecReader::new(scoped)))
    }
}
