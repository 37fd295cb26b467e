//! Chunk writer
//!
//! A chunk is persisted by one statement in one transaction: either every
//! document of the batch lands or none does.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::LayoutConfig;
use crate::error::{BatchError, BatchResult};
use crate::model::UpdateRecord;

#[async_trait]
pub trait ItemWriter: Send + Sync {
    /// Persist the whole batch atomically; an empty batch is a no-op
    async fn write(&self, items: &[UpdateRecord]) -> BatchResult<()>;
}

/// Sets the document column of the target table, keyed by identity
pub struct PgDocumentWriter {
    pool: Arc<PgPool>,
    statement: String,
}

impl PgDocumentWriter {
    pub fn new(pool: Arc<PgPool>, layout: &LayoutConfig) -> Self {
        Self {
            pool,
            statement: update_statement(layout),
        }
    }
}

/// One parameter set per record, passed as two parallel arrays
fn update_statement(layout: &LayoutConfig) -> String {
    format!(
        "UPDATE {table} AS t SET {doc} = v.doc \
         FROM UNNEST($1::int4[], $2::text[]) AS v(id, doc) \
         WHERE t.{id} = v.id",
        table = layout.target_table,
        doc = layout.target_document_column,
        id = layout.target_id_column,
    )
}

#[async_trait]
impl ItemWriter for PgDocumentWriter {
    async fn write(&self, items: &[UpdateRecord]) -> BatchResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let batch_size = items.len();
        let write_error = |source| BatchError::Write { batch_size, source };

        let ids: Vec<i32> = items.iter().map(|item| item.id).collect();
        let documents: Vec<&str> = items.iter().map(|item| item.document.as_str()).collect();

        let mut tx = self.pool.begin().await.map_err(write_error)?;

        let result = sqlx::query(&self.statement)
            .bind(&ids)
            .bind(&documents)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

        tx.commit().await.map_err(write_error)?;

        let updated = result.rows_affected();
        if updated < batch_size as u64 {
            warn!(
                batch_size,
                updated, "Some identities were not found in the target table"
            );
        } else {
            debug!(batch_size, "Chunk written");
        }

        Ok(())
    }
}

/// Document store held in memory, keyed by identity
///
/// Batches are applied under one lock, so a batch is visible all at once.
#[derive(Clone, Default)]
pub struct InMemoryDocumentWriter {
    documents: Arc<Mutex<HashMap<i32, String>>>,
}

impl InMemoryDocumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<i32, String>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn document(&self, id: i32) -> Option<String> {
        self.documents().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents().is_empty()
    }
}

#[async_trait]
impl ItemWriter for InMemoryDocumentWriter {
    async fn write(&self, items: &[UpdateRecord]) -> BatchResult<()> {
        let mut documents = self.documents();
        for item in items {
            documents.insert(item.id, item.document.clone());
        }
        Ok(())
    }
}
