//! kb-ingest: incremental mirror of Google Drive and Slack files into a
//! local knowledge-base directory.
//!
//! Each enabled source gets its own poll loop that lists what changed since
//! its watermark, fetches new items through a temp file and an atomic
//! rename, and records every settled item in SQLite so nothing is fetched
//! twice across restarts.

#![warn(clippy::all)]

mod cli;
mod config;
mod events;
mod fetch;
mod poll;
pub mod retry;
mod shutdown;
mod source;
mod state;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use indicatif::MultiProgress;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{Config, StorePaths};
use events::{EventLog, MessageLog};
use fetch::Fetcher;
use poll::{PollConfig, PollLoop};
use source::drive::DriveSource;
use source::google_auth::{ServiceAccountAuth, DRIVE_READONLY_SCOPE};
use source::slack::SlackSource;
use source::Source;
use state::{SourceLock, SqliteStateDb, StateDb, StateTracker};
use types::SourceKind;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("kb-ingest/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

async fn build_source(
    kind: SourceKind,
    config: &Config,
    client: &reqwest::Client,
) -> anyhow::Result<Arc<dyn Source>> {
    match kind {
        SourceKind::Drive => {
            let drive = config
                .drive
                .as_ref()
                .context("Drive is not configured")?;
            let auth = ServiceAccountAuth::from_file(
                &drive.credentials,
                DRIVE_READONLY_SCOPE,
                client.clone(),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to load service account key {}",
                    drive.credentials.display()
                )
            })?;
            tracing::info!(account = %auth.client_email(), "Using Google service account");
            Ok(Arc::new(DriveSource::new(
                client.clone(),
                auth,
                drive.target_folders.clone(),
            )))
        }
        SourceKind::Slack => {
            let slack = config
                .slack
                .as_ref()
                .context("Slack is not configured")?;
            Ok(Arc::new(SlackSource::new(
                client.clone(),
                slack.bot_token.clone(),
                slack.target_channels.clone(),
            )))
        }
    }
}

/// Everything one source needs, prepared before any loop starts so a
/// startup failure stops the process before anything is fetched.
async fn prepare_loop(
    kind: SourceKind,
    config: &Config,
    client: &reqwest::Client,
    events: &EventLog,
    progress: Option<&MultiProgress>,
) -> anyhow::Result<(PollLoop, SourceLock)> {
    let paths = config.store_paths();
    let lock = SourceLock::acquire(&paths.state_dir, kind).await?;

    let source = build_source(kind, config, client).await?;
    source
        .check_auth()
        .await
        .with_context(|| format!("{} authentication failed", kind))?;

    // One connection per loop; WAL lets them share the file.
    let db: Arc<dyn StateDb> = Arc::new(SqliteStateDb::open(&paths.db_path()).await?);
    let tracker = StateTracker::load(kind, db).await?;
    tracing::info!(
        source = %kind,
        known = tracker.known_count(),
        watermark = %tracker.watermark(),
        "Loaded state"
    );

    let messages = match (kind, &config.slack) {
        (SourceKind::Slack, Some(slack)) => Some(MessageLog::new(slack.message_log.clone())),
        _ => None,
    };

    let poll = PollLoop::new(
        source,
        tracker,
        Fetcher::new(config.fetch_config(kind)),
        events.clone(),
        messages,
        PollConfig {
            interval: config.poll_interval,
            concurrency: config.concurrency,
            dry_run: config.dry_run,
            full_rescan: config.full_rescan(kind),
            progress: progress.cloned(),
        },
    )
    .await?;
    Ok((poll, lock))
}

/// Run the poll loops until stopped. A fatal error stops only its own
/// loop; the process exits non-zero if any loop ended that way.
async fn run_sources(config: Config) -> anyhow::Result<()> {
    let sources = config.enabled_sources();
    tracing::info!(
        sources = ?sources,
        knowledge_base = %config.knowledge_base.display(),
        state_dir = %config.state_dir.display(),
        dry_run = config.dry_run,
        "Starting kb-ingest"
    );
    tracing::debug!(config = ?config, "Resolved configuration");

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.state_dir.display()))?;

    let shutdown_token = shutdown::install_signal_handler()?;
    let client = http_client()?;
    let events = EventLog::new(config.event_log.clone());
    let progress = (!config.no_progress_bar).then(MultiProgress::new);

    let mut prepared = Vec::with_capacity(sources.len());
    for kind in sources {
        prepared.push((
            kind,
            prepare_loop(kind, &config, &client, &events, progress.as_ref()).await?,
        ));
    }

    let mut loops = JoinSet::new();
    for (kind, (poll, lock)) in prepared {
        let token = shutdown_token.clone();
        let once = config.once;
        loops.spawn(async move {
            let result = poll.run(token, once).await;
            drop(lock);
            (kind, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((kind, Err(e))) => {
                tracing::error!(
                    source = %kind,
                    class = ?e.class(),
                    error = %e,
                    "Poll loop stopped with a fatal error"
                );
                failed += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "Poll loop task failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} poll loop(s) stopped with a fatal error", failed);
    }
    tracing::info!("Stopped");
    Ok(())
}

/// Open the state database, or explain that none exists yet.
async fn open_existing_db(paths: &StorePaths) -> anyhow::Result<Option<SqliteStateDb>> {
    let db_path = paths.db_path();
    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        println!("Run a poll first to create the database.");
        return Ok(None);
    }
    Ok(Some(SqliteStateDb::open(&db_path).await?))
}

async fn run_status(paths: StorePaths) -> anyhow::Result<()> {
    let Some(db) = open_existing_db(&paths).await? else {
        return Ok(());
    };

    println!("State Database: {}", db.path().display());
    println!("Knowledge base: {}", paths.knowledge_base.display());
    for kind in SourceKind::ALL {
        let summary = db.get_summary(kind).await?;
        println!();
        println!("{}:", kind);
        println!("  Fetched:   {} ({} bytes)", summary.fetched, summary.total_bytes);
        println!("  Skipped:   {}", summary.skipped);
        if kind == SourceKind::Slack {
            println!("  Messages:  {}", summary.logged_messages);
        }
        println!("  Watermark: {}", summary.watermark);
        if let Some(started) = &summary.last_cycle_started {
            println!(
                "  Last cycle started:   {}",
                started.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        if let Some(completed) = &summary.last_cycle_completed {
            println!(
                "  Last cycle completed: {}",
                completed.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }
    Ok(())
}

async fn run_reset_state(paths: StorePaths, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = paths.db_path();
    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the state database at:");
        println!("  {}", db_path.display());
        println!("Every item will be listed and fetched (or adopted) again.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    // Refuse while a poll loop owns any source.
    let mut locks = Vec::new();
    for kind in SourceKind::ALL {
        locks.push(
            SourceLock::acquire(&paths.state_dir, kind)
                .await
                .context("A poll loop is running; stop it first")?,
        );
    }

    std::fs::remove_file(&db_path)?;
    println!("State database deleted.");

    let wal_path = db_path.with_extension("db-wal");
    let shm_path = db_path.with_extension("db-shm");
    let _ = std::fs::remove_file(&wal_path);
    let _ = std::fs::remove_file(&shm_path);
    drop(locks);
    Ok(())
}

async fn run_reset_skipped(paths: StorePaths, args: cli::ResetSkippedArgs) -> anyhow::Result<()> {
    let Some(db) = open_existing_db(&paths).await? else {
        return Ok(());
    };
    for record in db.get_skipped(args.source).await? {
        println!(
            "  {} {} {} [{}] skipped {}: {}",
            record.source,
            record.item_id,
            record.name,
            record.kind.as_str(),
            record.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.reason.as_deref().unwrap_or("no reason recorded")
        );
    }
    let count = db.reset_skipped(args.source).await?;
    match args.source {
        Some(kind) => println!("Cleared {} skipped {} item(s).", count, kind),
        None => println!("Cleared {} skipped item(s).", count),
    }
    if count > 0 {
        println!("They are evaluated again the next time they are listed.");
    }
    Ok(())
}

async fn run_verify(paths: StorePaths, args: cli::VerifyArgs) -> anyhow::Result<()> {
    let Some(db) = open_existing_db(&paths).await? else {
        return Ok(());
    };
    let fetched = db.get_fetched(None).await?;

    println!("Verifying {} fetched items...", fetched.len());
    println!();

    let mut missing = 0;
    let mut corrupted = 0;
    let mut verified = 0;
    let mut repaired = 0;

    for record in &fetched {
        let Some(path) = &record.local_path else {
            println!("NO PATH: {} {} - no local path recorded", record.source, record.item_id);
            missing += 1;
            if args.repair && db.forget(record.source, &record.item_id).await? {
                repaired += 1;
            }
            continue;
        };

        let on_disk = fetch::file::existing_size(path).await;
        let problem = if on_disk.is_none() {
            println!("MISSING: {} ({} {})", path.display(), record.source, record.item_id);
            missing += 1;
            true
        } else if record.size_bytes.is_some() && on_disk != record.size_bytes {
            println!(
                "SIZE MISMATCH: {} ({} {}) - {} bytes on disk, {} recorded",
                path.display(),
                record.source,
                record.item_id,
                on_disk.unwrap_or_default(),
                record.size_bytes.unwrap_or_default()
            );
            corrupted += 1;
            true
        } else if args.checksums {
            match verify_checksum(path, record.checksum.as_deref()).await {
                Ok(true) => {
                    verified += 1;
                    false
                }
                Ok(false) => {
                    println!("CORRUPTED: {} ({} {})", path.display(), record.source, record.item_id);
                    corrupted += 1;
                    true
                }
                Err(e) => {
                    println!("ERROR: {} - {}", path.display(), e);
                    corrupted += 1;
                    true
                }
            }
        } else {
            verified += 1;
            false
        };

        if problem && args.repair && db.forget(record.source, &record.item_id).await? {
            repaired += 1;
        }
    }

    println!();
    println!("Results:");
    println!("  Verified:  {}", verified);
    println!("  Missing:   {}", missing);
    if args.checksums {
        println!("  Corrupted: {}", corrupted);
    }
    if args.repair {
        println!("  Forgotten: {}", repaired);
        if repaired > 0 {
            println!("Forgotten items are fetched again the next time they are listed.");
        }
    }

    let unresolved = missing + corrupted - repaired;
    if unresolved > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn verify_checksum(path: &Path, expected: Option<&str>) -> anyhow::Result<bool> {
    let Some(expected) = expected else {
        return Ok(true);
    };
    let hashed = fetch::file::hash_file(path).await?;
    Ok(hashed.checksum.eq_ignore_ascii_case(expected))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.effective_command() {
        Command::Status => run_status(StorePaths::load(&cli.config).await?).await,
        Command::Verify(args) => run_verify(StorePaths::load(&cli.config).await?, args).await,
        Command::ResetState(args) => {
            run_reset_state(StorePaths::load(&cli.config).await?, args).await
        }
        Command::ResetSkipped(args) => {
            run_reset_skipped(StorePaths::load(&cli.config).await?, args).await
        }
        Command::Run => {
            let config = Config::load(&cli.config, &cli.run, |key| std::env::var(key).ok()).await?;
            run_sources(config).await
        }
    }
}
