mod adhoc;
mod alerts;
mod api;
mod archive;
mod config;
mod db;
mod detector;
mod models;
mod monitor;
mod probe;
mod resolver;
mod scheduler;
mod tasks;

use std::{
    net::SocketAddr,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    api::AppState,
    config::{AppConfig, LoggingConfig},
    db::SqliteGateway,
    monitor::SystemClock,
    probe::IcmpPinger,
    resolver::{Resolver, ShareMounts},
    scheduler::{scheduler_loop, SharedState},
    tasks::TaskContext,
};

#[derive(Parser)]
#[command(name = "orbit-vc")]
#[command(about = "Agentless version control for files on remote administrative shares", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the HTTP API (default)
    Serve,

    /// Run one registered task now
    Run {
        /// Task name, see `tasks`
        task: String,
    },

    /// List registered tasks
    Tasks,

    /// Report the first address that answers an echo request
    Ping {
        /// Addresses in priority order; comma separated lists are accepted
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Size, hash and modification time of a remote file
    FileInfo {
        /// Comma separated addresses in priority order
        addresses: String,
        /// Device-local path, e.g. C:\data\app.ini
        path: String,
        /// Copy the file here before measuring it
        dest: Option<PathBuf>,
    },

    /// Copy a local file onto a device
    Restore {
        /// Comma separated addresses in priority order
        addresses: String,
        /// Device-local destination path
        dest: String,
        /// Local source file
        source: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load()?);
    let _guard = init_tracing(&config.logging)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await.map(|()| ExitCode::SUCCESS),
        Command::Run { task } => run_once(config, &task).await,
        Command::Tasks => {
            for task in tasks::registry() {
                println!("{:<16} {}", task.name(), task.description());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Ping { addresses } => {
            let addresses: Vec<String> = addresses
                .iter()
                .flat_map(|a| adhoc::parse_address_list(a))
                .collect();
            let pinger = IcmpPinger::new(&config.probe);
            let result = probe::probe_first_reachable(&pinger, &addresses).await;
            emit(&result, result.success)
        }
        Command::FileInfo { addresses, path, dest } => {
            let resolver = resolver_for(&config);
            let addresses = adhoc::parse_address_list(&addresses);
            let result = tokio::task::spawn_blocking(move || {
                adhoc::file_info(&resolver, &addresses, &path, dest.as_deref())
            })
            .await?;
            emit(&result, result.success)
        }
        Command::Restore { addresses, dest, source } => {
            let resolver = resolver_for(&config);
            let addresses = adhoc::parse_address_list(&addresses);
            let result = tokio::task::spawn_blocking(move || {
                adhoc::restore(&resolver, &addresses, &dest, &source)
            })
            .await?;
            emit(&result, result.success)
        }
    }
}

fn emit<T: Serialize>(value: &T, success: bool) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string(value)?);
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn resolver_for(config: &AppConfig) -> Resolver {
    Resolver::new(ShareMounts::new(config.share_mount_root.clone()))
}

async fn task_context(config: Arc<AppConfig>) -> anyhow::Result<TaskContext> {
    let pool = db::create_pool(&config.database_url)
        .await
        .context("failed to open database")?;
    db::run_migrations(&pool).await.context("failed to run migrations")?;

    Ok(TaskContext {
        pinger: Arc::new(IcmpPinger::new(&config.probe)),
        gateway: Arc::new(SqliteGateway::new(pool)),
        clock: Arc::new(SystemClock),
        config,
    })
}

async fn run_once(config: Arc<AppConfig>, name: &str) -> anyhow::Result<ExitCode> {
    let task = tasks::find(name).with_context(|| format!("unknown task: {name}"))?;
    let ctx = task_context(config).await?;
    let state = SharedState::default();
    match scheduler::run_task(&state, task, &ctx).await {
        Ok(report) => emit(&report, true),
        Err(e) => {
            emit(&serde_json::json!({"task": name, "error": format!("{e:#}")}), false)
        }
    }
}

async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let ctx = task_context(Arc::clone(&config)).await?;
    let scheduler_state = SharedState::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let scheduler = tokio::spawn(scheduler_loop(
        ctx.clone(),
        scheduler_state.clone(),
        wait_for(shutdown_rx.clone()),
    ));

    let app = api::router(AppState {
        ctx,
        scheduler: scheduler_state,
        resolver: Arc::new(resolver_for(&config)),
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "orbit-vc listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for(shutdown_rx))
        .await?;
    scheduler.await.context("scheduler task panicked")?;
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// JSON to stderr plus a daily rolling file in the configured directory.
fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&cfg.directory)
        .with_context(|| format!("failed to create log directory {}", cfg.directory.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&cfg.directory, "orbit-vc.log"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level)))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}
