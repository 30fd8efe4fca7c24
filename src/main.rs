//! Command line front end for the replay archiver.

use clap::{Args, Parser, Subcommand};
use replay_archiver::{
    BlobStore, Config, Coordinator, Database, Error, Result, ReplayId, RunSummary,
    run_with_shutdown,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Pass ran to completion (abandoned IDs included)
const EXIT_OK: u8 = 0;
/// Bad configuration or a failure before any fetch was dispatched
const EXIT_STARTUP: u8 = 1;
/// Pass stopped by repeated storage failures
const EXIT_HALTED: u8 = 2;
/// Pass stopped by a termination signal
const EXIT_INTERRUPTED: u8 = 3;

#[derive(Parser)]
#[command(name = "replay-archiver")]
#[command(about = "Resumable, idempotent archiver for numbered replay files")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML config file (flags override its values)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ledger database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Blob store root directory
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Download URL template, `{id}` is replaced by the replay ID
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Highest replay ID known to exist
    #[arg(long, global = true)]
    max_id: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume an archival pass
    Run {
        /// First replay ID (inclusive)
        #[arg(long)]
        start: Option<u64>,
        /// Last replay ID (inclusive); open-ended when omitted
        #[arg(long)]
        end: Option<u64>,
        /// Number of concurrent workers
        #[arg(long)]
        concurrency: Option<usize>,
        /// Seconds before a tombstoned ID is tried again (0 retries every run)
        #[arg(long)]
        retry_cooldown: Option<u64>,
        /// Fetch attempts per ID before it is abandoned for this run
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show ledger statistics
    Status,
    /// Copy an archived replay out of the blob store
    Export(ExportArgs),
    /// Download archived replays again and compare their hash
    Refetch {
        /// Replay IDs to re-verify
        #[arg(required = true)]
        ids: Vec<u64>,
    },
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["replay_id", "sha256"])))]
#[command(group(clap::ArgGroup::new("target").required(true).args(["output_file", "output_dir"])))]
struct ExportArgs {
    /// Export the latest archived copy of this replay ID
    #[arg(long)]
    replay_id: Option<u64>,
    /// Export the blob with this content hash
    #[arg(long)]
    sha256: Option<String>,
    /// Destination file (must not exist)
    #[arg(long)]
    output_file: Option<PathBuf>,
    /// Destination directory; the blob's own file name is kept
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    let is_run = matches!(cli.command, Commands::Run { .. });
    let json = cli.global.json;

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "replay-archiver failed");
            eprintln!("error: {}", e);
            if is_run {
                print_startup_failure(&e, json);
            }
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// A run that failed before dispatch still reports its (empty) abandoned list
fn print_startup_failure(error: &Error, json: bool) {
    if json {
        let value = serde_json::json!({
            "error": error.to_string(),
            "abandoned": [],
        });
        match to_json(&value) {
            Ok(text) => println!("{}", text),
            Err(e) => tracing::error!(error = %e, "Failed to encode startup failure"),
        }
    } else {
        println!("abandoned:      0");
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// File config (or defaults) with global flag overrides applied
fn load_config(global: &GlobalArgs) -> Result<Config> {
    let mut config = match &global.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };

    if let Some(db) = &global.db {
        config.storage.database_path = db.clone();
    }
    if let Some(output) = &global.output {
        config.storage.archive_dir = output.clone();
    }
    if let Some(base_url) = &global.base_url {
        config.source.base_url = base_url.clone();
    }
    if let Some(max_id) = global.max_id {
        config.source.max_id = Some(max_id);
    }

    Ok(config)
}

async fn execute(cli: Cli) -> Result<u8> {
    let mut config = load_config(&cli.global)?;
    let json = cli.global.json;

    match cli.command {
        Commands::Run {
            start,
            end,
            concurrency,
            retry_cooldown,
            max_attempts,
        } => {
            if let Some(concurrency) = concurrency {
                config.archive.concurrency = concurrency;
            }
            if let Some(secs) = retry_cooldown {
                config.archive.tombstone_cooldown = Some(Duration::from_secs(secs));
            }
            if let Some(max_attempts) = max_attempts {
                config.retry.max_attempts = max_attempts;
            }
            let start = ReplayId(start.unwrap_or(config.archive.start_id));
            let end = end.or(config.archive.end_id).map(ReplayId);

            let coordinator = Coordinator::new(config).await?;
            let summary = run_with_shutdown(&coordinator, start, end).await?;
            print_summary(&summary, json)?;

            Ok(if summary.halted.is_some() {
                EXIT_HALTED
            } else if summary.cancelled {
                EXIT_INTERRUPTED
            } else {
                EXIT_OK
            })
        }
        Commands::Status => {
            config.validate()?;
            let db = Database::new(&config.storage.database_path).await?;
            let stats = db.ledger_stats().await?;
            let unclean = db.was_unclean_shutdown().await?;
            db.close().await;

            if json {
                let value = serde_json::json!({
                    "ledger": stats,
                    "unclean_shutdown": unclean,
                });
                println!("{}", to_json(&value)?);
            } else {
                println!("archived IDs:    {}", stats.archived_ids);
                println!("tombstoned IDs:  {}", stats.tombstoned_ids);
                println!("ledger records:  {}", stats.total_records);
                println!("archived bytes:  {}", stats.archived_bytes);
                match stats.max_replay_id {
                    Some(max) => println!("highest ID:      {}", max),
                    None => println!("highest ID:      -"),
                }
                if unclean {
                    println!("warning: the last run did not shut down cleanly");
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Export(args) => {
            config.validate()?;
            let db = Database::new(&config.storage.database_path).await?;
            let blobs =
                BlobStore::new(&config.storage.archive_dir, config.storage.blob_extension.clone())
                    .await?;

            let sha256 = match (args.replay_id, args.sha256) {
                (_, Some(sha256)) => sha256,
                (Some(id), None) => db
                    .latest_success(ReplayId(id))
                    .await?
                    .and_then(|record| record.sha256)
                    .ok_or_else(|| Error::NotFound(format!("no archived copy of replay {}", id)))?,
                (None, None) => {
                    return Err(Error::config("export", "--replay-id or --sha256 is required"));
                }
            };
            db.close().await;

            let destination = match (args.output_file, args.output_dir) {
                (Some(file), _) => file,
                (None, Some(dir)) => dir.join(blobs.file_name_for(&sha256)?),
                (None, None) => {
                    return Err(Error::config("export", "--output-file or --output-dir is required"));
                }
            };

            let written = blobs.export(&sha256, &destination).await?;
            println!("{}", written.display());
            Ok(EXIT_OK)
        }
        Commands::Refetch { ids } => {
            let ids: Vec<ReplayId> = ids.into_iter().map(ReplayId).collect();
            let coordinator = Coordinator::new(config).await?;
            let report = coordinator.refetch(&ids).await?;

            if json {
                println!("{}", to_json(&report)?);
            } else {
                println!("unchanged:  {}", report.unchanged.len());
                println!("changed:    {}", report.changed.len());
                for (id, previous, current) in &report.changed {
                    println!("  {} {} -> {}", id, previous, current);
                }
                println!("now absent: {}", report.now_absent.len());
                println!("failed:     {}", report.failed.len());
                for (id, reason) in &report.failed {
                    println!("  {} {}", id, reason);
                }
                println!("skipped:    {}", report.skipped.len());
            }
            Ok(EXIT_OK)
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", to_json(summary)?);
        return Ok(());
    }

    let end = summary
        .end
        .map_or_else(|| "-".to_string(), |end| end.to_string());
    println!("range:          {}..={}", summary.start, end);
    println!(
        "archived:       {} ({} deduplicated, {} bytes)",
        summary.succeeded, summary.deduplicated, summary.bytes_archived
    );
    println!("tombstoned:     {}", summary.tombstoned);
    println!("abandoned:      {}", summary.abandoned.len());
    for abandoned in &summary.abandoned {
        println!(
            "  {} after {} attempts: {}",
            abandoned.id, abandoned.attempts, abandoned.last_error
        );
    }
    if !summary.storage_errors.is_empty() {
        println!("storage errors: {}", summary.storage_errors.len());
        for failed in &summary.storage_errors {
            println!("  {}: {}", failed.id, failed.error);
        }
    }
    if !summary.interrupted.is_empty() || summary.not_attempted > 0 {
        println!(
            "unfinished:     {} interrupted, {} not attempted",
            summary.interrupted.len(),
            summary.not_attempted
        );
    }
    if let Some(reason) = &summary.halted {
        println!("halted:         {}", reason);
    } else if summary.cancelled {
        println!("interrupted by signal, rerun to resume");
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
