//! warmupd CLI entry point.

use warmupd::config::{LoggingConfig, WarmupdConfig};
use warmupd::model::AccountImport;
use warmupd::scheduler::WarmupScheduler;
use warmupd::store::WarmupStore;
use warmupd::transport::{
    MailServerTransport, MailTransport, MemoryTransport, ResilientTransport, RetryPolicy,
};
use warmupd::warmup::Engine;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "warmupd")]
#[command(about = "Email account warmup daemon")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic warmup scheduler until interrupted
    Daemon {
        /// Use an in-memory mail server instead of real SMTP/IMAP
        #[arg(long)]
        dry_run: bool,
    },
    /// Import accounts from a TOML file
    Import { file: PathBuf },
    /// Run one warmup cycle for an account now
    Run { account_id: String },
    /// Print an account's warmup status as JSON
    Status { account_id: String },
    /// Enable or disable warmup for an account
    Toggle {
        account_id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Check an account's SMTP and IMAP credentials
    Verify { account_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WarmupdConfig::load(cli.config.as_deref())?;
    let _log_guard = init_logging(&config.logging);

    match cli.command {
        Command::Daemon { dry_run } => run_daemon(&config, dry_run).await,
        Command::Import { file } => import_accounts(&config, &file).await,
        Command::Run { account_id } => {
            let (engine, _shutdown) = build_engine(&config, false).await?;
            let report = engine
                .run_cycle(&account_id, Utc::now())
                .await
                .with_context(|| format!("warmup cycle failed for {account_id}"))?;
            print_json(&report)
        }
        Command::Status { account_id } => {
            let (engine, _shutdown) = build_engine(&config, false).await?;
            let status = engine
                .status(&account_id, Utc::now())
                .await
                .with_context(|| format!("failed to load status for {account_id}"))?;
            print_json(&status)
        }
        Command::Toggle { account_id, active } => {
            let (engine, _shutdown) = build_engine(&config, false).await?;
            let state = engine
                .toggle(&account_id, active, Utc::now())
                .await
                .with_context(|| format!("failed to toggle warmup for {account_id}"))?;
            println!("{account_id}: {state}");
            Ok(())
        }
        Command::Verify { account_id } => {
            let (engine, _shutdown) = build_engine(&config, false).await?;
            let state = engine
                .verify(&account_id, Utc::now())
                .await
                .with_context(|| format!("verification failed for {account_id}"))?;
            println!("{account_id}: {state}");
            Ok(())
        }
    }
}

/// Install the global subscriber. The returned guard flushes the file writer
/// and must live until exit.
fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "warmupd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

async fn open_store(config: &WarmupdConfig) -> anyhow::Result<Arc<WarmupStore>> {
    WarmupStore::open(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| {
            format!(
                "failed to open warmup database at {}",
                config.database.path.display()
            )
        })
}

async fn build_engine(
    config: &WarmupdConfig,
    dry_run: bool,
) -> anyhow::Result<(Arc<Engine>, watch::Sender<bool>)> {
    let store = open_store(config).await?;

    let transport: Arc<dyn MailTransport> = if dry_run {
        tracing::warn!("dry run: mail goes to an in-memory server, nothing leaves this process");
        Arc::new(ResilientTransport::new(MemoryTransport::new(), RetryPolicy::none()))
    } else {
        Arc::new(ResilientTransport::new(
            MailServerTransport::new(config.transport.timeout()),
            config.transport.retry_policy(),
        ))
    };

    let rng = match config.rng_seed {
        Some(seed) => {
            tracing::info!(seed, "using fixed random seed");
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_os_rng(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::new(Engine::new(
        store,
        transport,
        config.engine_settings(),
        rng,
        shutdown_rx,
    ));
    Ok((engine, shutdown_tx))
}

async fn run_daemon(config: &WarmupdConfig, dry_run: bool) -> anyhow::Result<()> {
    let (engine, shutdown) = build_engine(config, dry_run).await?;
    let scheduler = WarmupScheduler::new(
        engine,
        config.scheduler_interval(),
        config.shutdown_grace(),
        shutdown,
    );

    scheduler.start().await;
    tracing::info!(
        database = %config.database.path.display(),
        dry_run,
        "warmupd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    scheduler.shutdown().await;
    Ok(())
}

async fn import_accounts(config: &WarmupdConfig, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let import: AccountImport =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", file.display()))?;

    let store = open_store(config).await?;
    let now = Utc::now();
    for entry in import.accounts {
        let address = entry.email_address.clone();
        let (account, warmup) = entry
            .into_account(now)
            .with_context(|| format!("invalid account {address}"))?;
        store
            .insert_account(&account, &warmup)
            .await
            .with_context(|| format!("failed to import {address}"))?;
        tracing::info!(account_id = %account.id, email = %account.email_address, "account imported");
        println!("{}\t{}", account.id, account.email_address);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
