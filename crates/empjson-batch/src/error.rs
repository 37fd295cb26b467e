//! Error types for the batch engine
//!
//! Errors are split by blast radius: [`TransformError`] never leaves the
//! record it was raised for, [`BatchError`] fails a partition or, for
//! discovery, the whole run.

use std::time::Duration;
use thiserror::Error;

pub type BatchResult<T> = std::result::Result<T, BatchError>;

/// Partition- and job-level failures
#[derive(Error, Debug)]
pub enum BatchError {
    /// A source row could not be mapped into a flat record
    #[error("Row mapping failed: {0}")]
    RowMapping(#[source] sqlx::Error),

    /// Fetching the next page of source rows failed
    #[error("Read failed for segment {segment}: {source}")]
    Read {
        segment: i32,
        #[source]
        source: sqlx::Error,
    },

    /// The batched update failed as a unit
    #[error("Write of {batch_size} documents failed: {source}")]
    Write {
        batch_size: usize,
        #[source]
        source: sqlx::Error,
    },

    /// Segment discovery failed; no partition is started
    #[error("Segment discovery failed: {0}")]
    Discovery(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Unknown run {run_id} for job '{job_name}'")]
    UnknownRun { job_name: String, run_id: i64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BatchError {
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }
}

/// Record-level failure; the step turns it into a skip
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Record {id} could not be serialized: {source}")]
    Serialize {
        id: i32,
        #[source]
        source: serde_json::Error,
    },
}

impl TransformError {
    pub fn record_id(&self) -> i32 {
        match self {
            TransformError::Serialize { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_operation() {
        let err = BatchError::timeout("write batch", Duration::from_secs(5));
        assert_eq!(err.to_string(), "write batch timed out after 5s");
    }

    #[test]
    fn test_transform_error_keeps_record_id() {
        let err = TransformError::Serialize {
            id: 42,
            source: serde::ser::Error::custom("bad"),
        };
        assert_eq!(err.record_id(), 42);
        assert_eq!(err.to_string(), "Record 42 could not be serialized: bad");
    }
}
