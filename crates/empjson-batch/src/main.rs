//! Empjson Batch - employee record to JSON document migration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use empjson_batch::checkpoint::{InMemoryJobRepository, JobRepository, PgJobRepository};
use empjson_batch::config::{BatchConfig, ConfigOverrides};
use empjson_batch::db;
use empjson_batch::partitioner::{PgSegmentSource, SegmentPartitioner};
use empjson_batch::reader::PgRecordSource;
use empjson_batch::step::{ChunkStep, StepSettings};
use empjson_batch::transform::EmployeeDocumentProcessor;
use empjson_batch::writer::PgDocumentWriter;
use empjson_batch::{JobResult, PartitionedJob};
use empjson_common::logging::{init_logging, LogConfig, LogLevel};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "empjson-batch")]
#[command(author, version, about = "Migrate flat employee records into JSON documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database URL (overrides DATABASE_URL from .env)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Partitions executed concurrently
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Source records per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Rows fetched per reader round-trip
    #[arg(long, global = true)]
    fetch_size: Option<usize>,

    /// Keep run state in memory instead of the checkpoint tables
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Result format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run of the job
    Run,

    /// Restart an existing run from its checkpoints
    Resume {
        /// Run id printed by the run being restarted
        run_id: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database_url: self.database_url.clone(),
            worker_pool_size: self.workers,
            chunk_size: self.chunk_size,
            fetch_size: self.fetch_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("empjson-batch")
        .build()
        .merge_env()
        .context("Invalid logging configuration")?;

    let _guard = init_logging(&log_config)?;

    let mut config = BatchConfig::from_env();
    config.apply_overrides(&cli.overrides());
    config.validate().context("Invalid configuration")?;

    if cli.ephemeral && matches!(cli.command, Command::Resume { .. }) {
        bail!("--ephemeral runs keep no checkpoints and cannot be resumed");
    }

    let pool = Arc::new(
        db::create_pool(&config.database)
            .await
            .context("Failed to connect to database")?,
    );

    let repository: Arc<dyn JobRepository> = if cli.ephemeral {
        warn!("Ephemeral run: checkpoints are lost when the process exits");
        Arc::new(InMemoryJobRepository::new())
    } else {
        db::run_migrations(&pool).await?;
        Arc::new(PgJobRepository::new(pool.clone()))
    };

    let step = ChunkStep::new(
        Arc::new(PgRecordSource::new(
            pool.clone(),
            &config.layout,
            config.job.fetch_size,
        )),
        Arc::new(EmployeeDocumentProcessor),
        Arc::new(PgDocumentWriter::new(pool.clone(), &config.layout)),
        repository.clone(),
        StepSettings::from(&config.job),
    );
    let partitioner =
        SegmentPartitioner::new(Arc::new(PgSegmentSource::new(pool.clone(), &config.layout)));
    let job = PartitionedJob::new(&config.job, partitioner, step, repository);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight chunks");
                cancel.cancel();
            }
        });
    }

    info!(
        job = job.name(),
        chunk_size = config.job.chunk_size,
        workers = config.job.worker_pool_size,
        "Starting job"
    );

    let result = match cli.command {
        Command::Run => job.run(&cancel).await,
        Command::Resume { run_id } => job.resume(run_id, &cancel).await,
    }
    .context("Job could not run")?;

    match cli.output {
        OutputFormat::Text => print_table(&result),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    pool.close().await;

    if result.is_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_table(result: &JobResult) {
    println!(
        "Job {} run {} finished {} in {:.2}s",
        result.job_name,
        result.run_id,
        result.status,
        result.duration_seconds()
    );
    println!();
    println!(
        "{:<14} {:>8} {:>10} {:>10} {:>10} {:>8}  {}",
        "PARTITION", "SEGMENT", "READ", "WRITTEN", "SKIPPED", "CHUNKS", "STATUS"
    );
    for p in &result.partitions {
        println!(
            "{:<14} {:>8} {:>10} {:>10} {:>10} {:>8}  {:?}",
            p.partition, p.segment, p.read_count, p.write_count, p.skip_count, p.chunk_count, p.status
        );
        if let Some(ref error) = p.error {
            println!("{:<14} error: {}", "", error);
        }
    }
    println!(
        "{:<14} {:>8} {:>10} {:>10} {:>10}",
        "TOTAL",
        "",
        result.total_read(),
        result.total_written(),
        result.total_skipped()
    );
}
