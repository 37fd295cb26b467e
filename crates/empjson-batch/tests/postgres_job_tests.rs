//! Postgres end-to-end tests
//!
//! Run the whole job against a throwaway Postgres container:
//! 1. A full run fills every document and records completed checkpoints
//! 2. A batch that fails mid-statement leaves the whole chunk untouched
//! 3. The keyset reader resumes strictly after the given identity
//! 4. NULL segments fail discovery
//!
//! Need Docker: `cargo test -p empjson-batch -- --ignored`

mod common;

use anyhow::Result;
use common::init_tracing;
use empjson_batch::checkpoint::PgJobRepository;
use empjson_batch::config::{DatabaseConfig, JobConfig, LayoutConfig};
use empjson_batch::model::PartitionDescriptor;
use empjson_batch::partitioner::{PgSegmentSource, SegmentPartitioner};
use empjson_batch::reader::{ItemReader, PgRecordSource, RecordSource};
use empjson_batch::step::{ChunkStep, StepSettings};
use empjson_batch::transform::EmployeeDocumentProcessor;
use empjson_batch::writer::PgDocumentWriter;
use empjson_batch::{db, BatchError, JobStatus, PartitionStatus, PartitionedJob};
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE employee (
    id            INTEGER PRIMARY KEY,
    segment       INTEGER,
    first_name    TEXT,
    last_name     TEXT,
    age           INTEGER,
    date_of_birth DATE,
    json_string   TEXT
);

CREATE TABLE employee_address (
    employee_id INTEGER NOT NULL REFERENCES employee (id),
    kind        TEXT NOT NULL,
    type_code   TEXT,
    line_one    TEXT,
    line_two    TEXT,
    zip         INTEGER
);

CREATE VIEW vw_employee_record AS
SELECT e.id, e.segment, e.first_name, e.last_name, e.age, e.date_of_birth,
       c.type_code AS cur_type_code, c.line_one AS cur_line_one,
       c.line_two AS cur_line_two, c.zip AS cur_zip,
       p.type_code AS per_type_code, p.line_one AS per_line_one,
       p.line_two AS per_line_two, p.zip AS per_zip
FROM employee e
LEFT JOIN employee_address c ON c.employee_id = e.id AND c.kind = 'current'
LEFT JOIN employee_address p ON p.employee_id = e.id AND p.kind = 'permanent';
"#;

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, Arc<PgPool>)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    let config = DatabaseConfig {
        url: format!("postgresql://postgres:postgres@{}:{}/postgres", host, port),
        max_connections: 8,
        min_connections: 1,
        ..DatabaseConfig::default()
    };
    let pool = Arc::new(db::create_pool(&config).await?);
    db::run_migrations(&pool).await?;

    sqlx::raw_sql(SCHEMA).execute(&*pool).await?;

    Ok((container, pool))
}

/// `count` employees of one segment starting at `first_id`
async fn seed(pool: &PgPool, segment: i32, first_id: i32, count: i32) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO employee (id, segment, first_name, last_name, age, date_of_birth)
        SELECT g, $1, 'First' || g, 'Last' || g, 20 + g % 40, DATE '1990-01-01' + g
        FROM generate_series($2::int4, $2::int4 + $3::int4 - 1) AS g
        "#,
    )
    .bind(segment)
    .bind(first_id)
    .bind(count)
    .execute(pool)
    .await?;
    Ok(())
}

async fn documents_in_segment(pool: &PgPool, segment: i32) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT count(*) FROM employee WHERE segment = $1 AND json_string IS NOT NULL",
    )
    .bind(segment)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

fn pg_job(pool: Arc<PgPool>, chunk_size: usize) -> PartitionedJob {
    let config = JobConfig {
        chunk_size,
        fetch_size: 250,
        worker_pool_size: 2,
        ..JobConfig::default()
    };
    let layout = LayoutConfig::default();
    let repository = Arc::new(PgJobRepository::new(pool.clone()));

    let step = ChunkStep::new(
        Arc::new(PgRecordSource::new(pool.clone(), &layout, config.fetch_size)),
        Arc::new(EmployeeDocumentProcessor),
        Arc::new(PgDocumentWriter::new(pool.clone(), &layout)),
        repository.clone(),
        StepSettings::from(&config),
    );
    let partitioner = SegmentPartitioner::new(Arc::new(PgSegmentSource::new(pool, &layout)));

    PartitionedJob::new(&config, partitioner, step, repository)
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_full_run_writes_every_document() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;

    seed(&pool, 1, 1, 1200).await?;
    seed(&pool, 2, 2001, 300).await?;
    sqlx::query(
        "INSERT INTO employee_address (employee_id, kind, type_code, line_one, zip) \
         VALUES (1, 'current', 'HOME', '1 Main St', 12345), \
                (2, 'current', 'HOME', '2 Main St', 12345), \
                (2, 'permanent', 'WORK', '9 Dock Rd', 54321)",
    )
    .execute(&*pool)
    .await?;

    let job = pg_job(pool.clone(), 500);
    let result = job.run(&CancellationToken::new()).await?;
    info!(run_id = result.run_id, status = %result.status, "Run finished");

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.partitions.len(), 2);
    assert_eq!(result.partition(1).unwrap().chunk_count, 3);
    assert_eq!(documents_in_segment(&pool, 1).await?, 1200);
    assert_eq!(documents_in_segment(&pool, 2).await?, 300);

    let doc: String = sqlx::query_scalar("SELECT json_string FROM employee WHERE id = 2")
        .fetch_one(&*pool)
        .await?;
    let doc: serde_json::Value = serde_json::from_str(&doc)?;
    assert_eq!(doc["firstName"], "First2");
    assert_eq!(doc["addresses"][0]["typeCode"], "HOME");
    assert_eq!(doc["addresses"][1]["typeCode"], "WORK");

    let doc: String = sqlx::query_scalar("SELECT json_string FROM employee WHERE id = 3")
        .fetch_one(&*pool)
        .await?;
    let doc: serde_json::Value = serde_json::from_str(&doc)?;
    assert_eq!(doc["addresses"], serde_json::json!([]));

    let open_checkpoints: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM batch_partition_checkpoint WHERE run_id = $1 AND status <> 'completed'",
    )
    .bind(result.run_id)
    .fetch_one(&*pool)
    .await?;
    assert_eq!(open_checkpoints, 0);

    let run_status: String =
        sqlx::query_scalar("SELECT status FROM batch_job_run WHERE run_id = $1")
            .bind(result.run_id)
            .fetch_one(&*pool)
            .await?;
    assert_eq!(run_status, "COMPLETED");

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_failed_batch_rolls_back_whole_chunk() -> Result<()> {
    init_tracing();
    let (_container, pool) = start_postgres().await?;

    seed(&pool, 1, 1, 1000).await?;
    seed(&pool, 2, 1001, 10).await?;

    sqlx::raw_sql(
        r#"
        CREATE FUNCTION reject_500() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'simulated connectivity error';
        END;
        $$ LANGUAGE plpgsql;

        CREATE TRIGGER reject_500 BEFORE UPDATE ON employee
        FOR EACH ROW WHEN (NEW.id = 500) EXECUTE FUNCTION reject_500();
        "#,
    )
    .execute(&*pool)
    .await?;

    let job = pg_job(pool.clone(), 1000);
    let result = job.run(&CancellationToken::new()).await?;

    assert_eq!(result.status, JobStatus::Failed);
    let failed = result.partition(1).unwrap();
    assert_eq!(failed.status, PartitionStatus::Failed);
    assert_eq!(failed.chunk_count, 0);
    assert_eq!(documents_in_segment(&pool, 1).await?, 0);
    assert_eq!(documents_in_segment(&pool, 2).await?, 10);

    sqlx::raw_sql("DROP TRIGGER reject_500 ON employee")
        .execute(&*pool)
        .await?;

    let resumed = job.resume(result.run_id, &CancellationToken::new()).await?;
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(documents_in_segment(&pool, 1).await?, 1000);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_keyset_reader_resumes_after_identity() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    seed(&pool, 1, 1, 10).await?;
    seed(&pool, 2, 11, 5).await?;

    let source = PgRecordSource::new(pool.clone(), &LayoutConfig::default(), 3);
    let mut reader = source.open(&PartitionDescriptor::new(0, 1), Some(4)).await?;

    let mut ids = Vec::new();
    while let Some(record) = reader.read().await? {
        assert_eq!(record.segment, 1);
        ids.push(record.id);
    }
    assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);

    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_null_segment_fails_discovery() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    seed(&pool, 1, 1, 3).await?;
    sqlx::query("UPDATE employee SET segment = NULL WHERE id = 2")
        .execute(&*pool)
        .await?;

    let err = pg_job(pool.clone(), 10)
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Discovery(_)));
    assert_eq!(documents_in_segment(&pool, 1).await?, 0);

    Ok(())
}
