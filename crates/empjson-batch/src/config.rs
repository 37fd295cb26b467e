//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BatchError, BatchResult};

// ============================================================================
// Job Configuration Constants
// ============================================================================

/// Default job name; runs and checkpoints are tracked under it.
pub const DEFAULT_JOB_NAME: &str = "importEmployeeJob";

/// Default number of source records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default number of rows fetched per reader round-trip.
pub const DEFAULT_FETCH_SIZE: usize = 1000;

/// Default number of partitions executed concurrently.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default timeout for one reader fetch, in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default timeout for one chunk write or checkpoint save, in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/employees";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Source / Target Layout Defaults
// ============================================================================

pub const DEFAULT_SOURCE_VIEW: &str = "vw_employee_record";
pub const DEFAULT_SOURCE_ID_COLUMN: &str = "id";
pub const DEFAULT_SEGMENT_COLUMN: &str = "segment";
pub const DEFAULT_TARGET_TABLE: &str = "employee";
pub const DEFAULT_TARGET_ID_COLUMN: &str = "id";
pub const DEFAULT_TARGET_DOCUMENT_COLUMN: &str = "json_string";

/// Full configuration of one batch process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobConfig,
    pub database: DatabaseConfig,
    pub layout: LayoutConfig,
}

/// Engine sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub chunk_size: usize,
    pub fetch_size: usize,
    pub worker_pool_size: usize,
    /// Parallelism hint handed to the partitioner
    pub grid_size: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl JobConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Names of the source view and target table
///
/// These are spliced into SQL text, so every name must pass
/// [`is_sql_identifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub source_view: String,
    /// Integer identity the reader pages on, ascending
    pub source_id_column: String,
    pub segment_column: String,
    pub target_table: String,
    pub target_id_column: String,
    pub target_document_column: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            source_view: DEFAULT_SOURCE_VIEW.to_string(),
            source_id_column: DEFAULT_SOURCE_ID_COLUMN.to_string(),
            segment_column: DEFAULT_SEGMENT_COLUMN.to_string(),
            target_table: DEFAULT_TARGET_TABLE.to_string(),
            target_id_column: DEFAULT_TARGET_ID_COLUMN.to_string(),
            target_document_column: DEFAULT_TARGET_DOCUMENT_COLUMN.to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Command-line values that take precedence over the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub worker_pool_size: Option<usize>,
    pub chunk_size: Option<usize>,
    pub fetch_size: Option<usize>,
}

impl BatchConfig {
    /// Load and validate configuration from `.env`, the environment and defaults
    pub fn load() -> BatchResult<Self> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Read `.env`, the environment and defaults without validating
    ///
    /// Callers layering overrides on top validate the merged result.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let worker_pool_size = env_or("BATCH_WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE);

        BatchConfig {
            job: JobConfig {
                name: env_string("BATCH_JOB_NAME", DEFAULT_JOB_NAME),
                chunk_size: env_or("BATCH_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
                fetch_size: env_or("BATCH_FETCH_SIZE", DEFAULT_FETCH_SIZE),
                worker_pool_size,
                grid_size: env_or("BATCH_GRID_SIZE", worker_pool_size),
                read_timeout_secs: env_or("BATCH_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS),
                write_timeout_secs: env_or("BATCH_WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            layout: LayoutConfig {
                source_view: env_string("SOURCE_VIEW", DEFAULT_SOURCE_VIEW),
                source_id_column: env_string("SOURCE_ID_COLUMN", DEFAULT_SOURCE_ID_COLUMN),
                segment_column: env_string("SOURCE_SEGMENT_COLUMN", DEFAULT_SEGMENT_COLUMN),
                target_table: env_string("TARGET_TABLE", DEFAULT_TARGET_TABLE),
                target_id_column: env_string("TARGET_ID_COLUMN", DEFAULT_TARGET_ID_COLUMN),
                target_document_column: env_string(
                    "TARGET_DOCUMENT_COLUMN",
                    DEFAULT_TARGET_DOCUMENT_COLUMN,
                ),
            },
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref url) = overrides.database_url {
            self.database.url = url.clone();
        }
        if let Some(workers) = overrides.worker_pool_size {
            self.job.worker_pool_size = workers;
        }
        if let Some(chunk_size) = overrides.chunk_size {
            self.job.chunk_size = chunk_size;
        }
        if let Some(fetch_size) = overrides.fetch_size {
            self.job.fetch_size = fetch_size;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> BatchResult<()> {
        if self.job.name.trim().is_empty() {
            return Err(BatchError::config("Job name cannot be empty"));
        }

        if self.job.chunk_size == 0 {
            return Err(BatchError::config("Chunk size must be greater than 0"));
        }

        if self.job.fetch_size == 0 {
            return Err(BatchError::config("Fetch size must be greater than 0"));
        }

        if self.job.worker_pool_size == 0 {
            return Err(BatchError::config("Worker pool size must be greater than 0"));
        }

        if self.job.read_timeout_secs == 0 || self.job.write_timeout_secs == 0 {
            return Err(BatchError::config("Read and write timeouts must be greater than 0"));
        }

        if self.database.url.is_empty() {
            return Err(BatchError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(BatchError::config("Database max_connections must be greater than 0"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(BatchError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        self.layout.validate()?;

        // Each in-flight partition holds a connection while it reads or writes.
        if (self.database.max_connections as usize) < self.job.worker_pool_size {
            tracing::warn!(
                max_connections = self.database.max_connections,
                worker_pool_size = self.job.worker_pool_size,
                "Connection pool is smaller than the worker pool; partitions will queue on connections"
            );
        }

        Ok(())
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> BatchResult<()> {
        let names = [
            ("source view", &self.source_view),
            ("source id column", &self.source_id_column),
            ("segment column", &self.segment_column),
            ("target table", &self.target_table),
            ("target id column", &self.target_id_column),
            ("target document column", &self.target_document_column),
        ];

        for (what, name) in names {
            if !is_sql_identifier(name) {
                return Err(BatchError::config(format!("Invalid {what} name: '{name}'")));
            }
        }

        Ok(())
    }
}

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_sql_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return false;
    }

    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            },
            _ => false,
        }
    })
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_JOB_NAME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            fetch_size: DEFAULT_FETCH_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            grid_size: DEFAULT_WORKER_POOL_SIZE,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            database: DatabaseConfig::default(),
            layout: LayoutConfig::default(),
        }
    }
}
