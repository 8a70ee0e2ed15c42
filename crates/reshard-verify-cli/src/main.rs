//! reshard-verify CLI - Row-level diff between a sharded source and a target.

use clap::{Parser, Subcommand};
use reshard_verify::{Checksum, ChecksumResult, Config, ReadMode, VerifyError};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when differences are found and `--fail-on-diff` is set.
const EXIT_DIFFERENCES: u8 = 3;

#[derive(Parser)]
#[command(name = "reshard-verify")]
#[command(about = "Row-level diff between a sharded source database and a target")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight chunks after a shutdown signal
    #[arg(long, default_value = "30")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff source and target tables chunk by chunk
    Checksum {
        /// Only diff this table (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Override source database (e.g. customer/-80@replica)
        #[arg(long)]
        source_database: Option<String>,

        /// Override target database
        #[arg(long)]
        target_database: Option<String>,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override concurrent chunk workers per table
        #[arg(long)]
        reader_parallelism: Option<usize>,

        /// Abort on the first chunk that cannot be read
        #[arg(long)]
        consistent: bool,

        /// Exit with code 3 when differences are found
        #[arg(long)]
        fail_on_diff: bool,

        /// Print each diff to stdout as a JSON line
        #[arg(long)]
        print_diffs: bool,
    },

    /// Dump a table's source rows as JSON lines
    Read {
        /// Table to read
        #[arg(long)]
        table: String,

        /// Override source database
        #[arg(long)]
        source_database: Option<String>,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, VerifyError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(VerifyError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout);

    match cli.command {
        Commands::Checksum {
            tables,
            source_database,
            target_database,
            chunk_size,
            reader_parallelism,
            consistent,
            fail_on_diff,
            print_diffs,
        } => {
            // Apply overrides
            if let Some(database) = source_database {
                config.source.database = database;
            }
            if let Some(database) = target_database {
                config.target.database = database;
            }
            if chunk_size.is_some() {
                config.checksum.chunk_size = chunk_size;
            }
            if reader_parallelism.is_some() {
                config.checksum.reader_parallelism = reader_parallelism;
            }
            if consistent {
                config.checksum.consistent = true;
            }

            let checksum = Checksum::new(config)?.with_table_filter(tables);
            let (mut diffs, handle) = checksum.stream(cancel_token.clone()).await?;

            let result = until_shutdown(&cancel_token, shutdown_timeout, async move {
                while let Some(diff) = diffs.recv().await {
                    if print_diffs {
                        println!("{}", serde_json::to_string(&diff)?);
                    }
                }
                handle
                    .await
                    .map_err(|e| VerifyError::Task(format!("Checksum task failed: {}", e)))?
            })
            .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }

            if fail_on_diff && result.has_differences() {
                return Ok(ExitCode::from(EXIT_DIFFERENCES));
            }
        }

        Commands::Read {
            table,
            source_database,
        } => {
            if let Some(database) = source_database {
                config.source.database = database;
            }

            let checksum = Checksum::new(config)?
                .with_table_filter([table])
                .with_mode(ReadMode::Read);
            let (mut rows, handle) = checksum.stream(cancel_token.clone()).await?;

            let result = until_shutdown(&cancel_token, shutdown_timeout, async move {
                while let Some(diff) = rows.recv().await {
                    println!("{}", serde_json::to_string(&diff.row)?);
                }
                handle
                    .await
                    .map_err(|e| VerifyError::Task(format!("Read task failed: {}", e)))?
            })
            .await?;

            if cli.output_json {
                eprintln!("{}", serde_json::to_string_pretty(&result)?);
            }
        }

        Commands::HealthCheck => {
            let checksum = Checksum::new(config)?;
            let result = checksum.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    checksum.config().source.database,
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target ({}): {} ({}ms)",
                    checksum.config().target.database,
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(VerifyError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(result: &ChecksumResult) {
    let totals = result.totals();
    let status = if result.is_in_sync() {
        "In sync"
    } else if result.has_differences() {
        "Differences found"
    } else {
        "Incomplete"
    };

    println!("\nChecksum completed: {}", status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_ms as f64 / 1000.0);
    for table in &result.tables {
        println!(
            "  {} {} (insert: {}, update: {}, delete: {}, chunks: {}/{}{})",
            if table.diffs.has_differences() { "✗" } else { "✓" },
            table.table,
            table.diffs.inserts,
            table.diffs.updates,
            table.diffs.deletes,
            table.chunks_processed,
            table.chunks_generated,
            if table.chunks_skipped > 0 {
                format!(", {} skipped", table.chunks_skipped)
            } else {
                String::new()
            }
        );
    }
    println!("  Total rows to insert: {}", totals.inserts);
    println!("  Total rows to update: {}", totals.updates);
    println!("  Total rows to delete: {}", totals.deletes);
    if result.chunks_skipped() > 0 {
        println!(
            "  Skipped chunks: {} (counts are a lower bound)",
            result.chunks_skipped()
        );
    }
}

/// Drive `work` to completion, giving up `grace` after a shutdown signal.
async fn until_shutdown<T>(
    cancel: &CancellationToken,
    grace: Duration,
    work: impl Future<Output = Result<T, VerifyError>>,
) -> Result<T, VerifyError> {
    tokio::select! {
        result = work => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            eprintln!("Shutdown timeout elapsed, abandoning in-flight chunks");
            Err(VerifyError::Cancelled)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("invalid verbosity '{}'", other)),
    };

    // stdout carries diffs and rows; logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}'", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, VerifyError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, VerifyError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
