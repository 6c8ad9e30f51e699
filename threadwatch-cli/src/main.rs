//! threadwatch – command line front end.
//!
//! Startup order:
//! 1. Parse arguments and configuration from environment variables.
//! 2. Initialise tracing (JSON when `THREADWATCH_LOG_JSON` is set).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Open the tracker and run the requested command.

mod config;
mod db;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use threadwatch_core::updates;
use threadwatch_core::{
    CommandLogin, CommandParser, Entity, EntityId, RefreshEvent, RefreshRun, Site, Tracker,
    TrackerOptions,
};
use threadwatch_fetch::release::RunningBuild;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::SqliteStore;

type AppTracker = Tracker<SqliteStore, CommandLogin>;

#[derive(Parser, Debug)]
#[command(author, version, about = "threadwatch: keeps tracked forum threads up to date", long_about = None)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every tracked thread for changes.
    Refresh {
        /// Fetch every thread in full instead of probing.
        #[arg(long)]
        full: bool,
    },
    /// Track the threads referenced in the given URLs.
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Track the threads in a `.url` shortcut, bookmarks export or text file.
    Import { file: PathBuf },
    /// Stop tracking a thread.
    Remove { id: EntityId },
    /// List tracked threads.
    List,
    /// Clear the updated flag of a thread.
    Ack { id: EntityId },
    /// Count unread alerts and conversations.
    Notifs,
    /// Look for a newer release.
    CheckUpdate {
        /// Download and unpack the update into this directory.
        #[arg(long)]
        download: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: THREADWATCH_LOG='{}' is not a valid tracing filter ({}); falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    info!(version = env!("CARGO_PKG_VERSION"), "threadwatch starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("creating {}", cfg.data_dir.display()))?;
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Tracker ─────────────────────────────────────────────────────────────
    let tracker = open_tracker(&cfg, store).await?;
    match cli.command {
        Command::Refresh { full } => refresh(&tracker, full, cli.json).await,
        Command::Add { urls } => {
            let added = tracker.add(&urls.join("\n")).await?;
            print_entities(&added, cli.json)
        }
        Command::Import { file } => {
            let added = tracker.import_file(&file).await?;
            print_entities(&added, cli.json)
        }
        Command::Remove { id } => {
            if !tracker.remove(id).await? {
                bail!("thread {id} is not tracked");
            }
            Ok(())
        }
        Command::List => print_entities(&tracker.list().await?, cli.json),
        Command::Ack { id } => {
            if !tracker.acknowledge(id).await? {
                bail!("thread {id} is not tracked");
            }
            Ok(())
        }
        Command::Notifs => {
            let counts = tracker.check_notifs().await?;
            println!(
                "{}",
                counts.summary().unwrap_or_else(|| "No unread notifications.".to_owned())
            );
            Ok(())
        }
        Command::CheckUpdate { download } => check_update(&tracker, download.as_deref()).await,
    }
}

async fn open_tracker(cfg: &Config, store: SqliteStore) -> anyhow::Result<AppTracker> {
    let (parser_program, parser_args) = program(&cfg.parser_cmd, "THREADWATCH_PARSER_CMD")?;
    let (login_program, login_args) = program(&cfg.login_cmd, "THREADWATCH_LOGIN_CMD")?;
    let site = Site::new(&cfg.domain).with_context(|| format!("invalid domain {}", cfg.domain))?;

    let tracker = Tracker::open(
        store,
        CommandLogin::new(login_program, login_args),
        CommandParser::new(parser_program, parser_args),
        TrackerOptions {
            site,
            data_dir: cfg.data_dir.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            parser_workers: cfg.parser_workers,
        },
    )
    .await?;
    Ok(tracker)
}

fn program<'a>(cmd: &'a [String], var: &str) -> anyhow::Result<(&'a str, Vec<String>)> {
    match cmd.split_first() {
        Some((program, args)) => Ok((program.as_str(), args.to_vec())),
        None => bail!("{var} is empty"),
    }
}

async fn refresh(tracker: &AppTracker, full: bool, json: bool) -> anyhow::Result<()> {
    let mut events = tracker.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RefreshEvent::Progress { completed, total } => {
                    info!(completed, total, "progress");
                }
                RefreshEvent::RemoteNotFound { id, name, status } => {
                    warn!(id, %name, status, "thread is gone upstream; `threadwatch remove {id}` to stop tracking it");
                }
                RefreshEvent::ParseTimeout { id } => warn!(id, "parsing timed out, thread skipped"),
                RefreshEvent::Finished { .. } => break,
                _ => {}
            }
        }
    });

    let canceller = tracker.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping refresh");
            canceller.cancel();
        }
    });
    let run = tracker.refresh(full).await;
    interrupt.abort();
    reporter.abort();
    print_run(&run?, json)
}

async fn check_update(tracker: &AppTracker, download: Option<&Path>) -> anyhow::Result<()> {
    let build = RunningBuild {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        is_release: !cfg!(debug_assertions),
        asset_kind: std::env::consts::OS.to_owned(),
    };
    let install_dir = std::env::current_exe()?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let Some(update) = tracker.check_update(&build, &install_dir).await? else {
        println!("threadwatch {} is up to date.", build.version);
        return Ok(());
    };
    println!("threadwatch {} is available ({}).", update.version, update.asset.name);
    if !update.changelog.is_empty() {
        println!("\n{}", update.changelog);
    }

    if let Some(dest) = download {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });
        let files = updates::download_update(tracker.client(), &update, dest, &cancel, |done, total| {
            info!(done, total, "downloading update");
        })
        .await;
        interrupt.abort();
        println!("Unpacked {} files into {}.", files?.len(), dest.display());
    }
    Ok(())
}

fn print_entities(entities: &[Entity], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entities)?);
        return Ok(());
    }
    for e in entities {
        let flag = if e.updated { "*" } else { " " };
        println!("{flag} {:>8}  {:<40}  {:<14}  {}", e.id, e.name, e.version, e.status);
    }
    Ok(())
}

fn print_run(run: &RefreshRun, json: bool) -> anyhow::Result<()> {
    if json {
        let value = serde_json::json!({
            "total": run.total,
            "completed": run.completed,
            "committed": run.committed,
            "changes": run.changes,
            "soft_failures": run.soft_failures.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "notifications": run.notifications.map(|n| serde_json::json!({
                "alerts": n.alerts,
                "conversations": n.conversations,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("Checked {}/{} threads, {} updated.", run.completed, run.total, run.committed);
    for change in &run.changes {
        println!("  changed: {} (was {} {})", change.name, change.version, change.status);
    }
    for failure in &run.soft_failures {
        println!("  skipped: {failure}");
    }
    if let Some(summary) = run.notifications.and_then(|n| n.summary()) {
        println!("{summary}");
    }
    Ok(())
}
