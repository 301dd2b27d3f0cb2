#![forbid(unsafe_code)]

//! `game-warden` — game-server watchdog daemon binary.
//!
//! Bootstraps configuration, the build registry and its deploy watcher,
//! the reattach store, and the watchdog itself; then supervises until a
//! shutdown signal arrives and either detaches (leaving the server
//! running for the next daemon instance) or terminates it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use game_warden::config::GlobalConfig;
use game_warden::control::RestartCoordinator;
use game_warden::hooks::{LoggingEventConsumer, LoggingJobManager, NullCommandRegistrar};
use game_warden::persistence::{db, reattach_store::ReattachStore};
use game_warden::registry::{watcher::DeployWatcher, BuildRegistry};
use game_warden::session::ProcessSessionFactory;
use game_warden::watchdog::Watchdog;
use game_warden::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "game-warden", about = "Game server watchdog daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("game-warden daemon bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.db_path()).await?);
    let store = ReattachStore::new(Arc::clone(&pool));
    info!("database connected");

    // ── Build registry + deploy watcher ─────────────────
    let registry = Arc::new(BuildRegistry::load_from_dir(&config.builds_dir)?);
    let _deploy_watcher = DeployWatcher::start(&config.builds_dir, Arc::clone(&registry))?;
    info!(builds = registry.len(), "build registry ready");

    // ── Assemble the watchdog ───────────────────────────
    let ct = CancellationToken::new();
    let session_scope = CancellationToken::new();

    let factory = Arc::new(ProcessSessionFactory::new(
        config.server_executable.clone(),
        config.server_args.clone(),
        config.host.clone(),
        session_scope.clone(),
    ));
    let server_control = RestartCoordinator::new();
    let command_registrar = NullCommandRegistrar::default();

    let watchdog = Watchdog::new(
        config.launch_parameters(),
        Arc::clone(&registry),
        factory,
        store,
        Arc::new(LoggingEventConsumer),
        Arc::new(LoggingJobManager::default()),
        &server_control,
        &command_registrar,
        ct.clone(),
    )?;

    // ── Launch and supervise ────────────────────────────
    if config.auto_start {
        if let Err(err) = watchdog.launch(&ct).await {
            error!(%err, "initial launch failed");
        }
    }

    let run_handle = tokio::spawn(Arc::clone(&watchdog).run(ct.clone()));
    info!("watchdog supervising");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    // Persist handoff state before anything is torn down; a failure
    // here must be loud, the next instance depends on the record.
    if let Err(err) = server_control.notify_restart().await {
        error!(%err, "pre-restart persistence failed");
    }

    if config.leave_running_on_exit {
        if let Err(err) = watchdog.detach().await {
            error!(%err, "detach failed, terminating instead");
            let _ = watchdog.terminate(true, &ct).await;
        }
    } else if let Err(err) = watchdog.terminate(true, &ct).await {
        error!(%err, "terminate on shutdown failed");
    }

    watchdog.release_restart_registration();
    ct.cancel();
    session_scope.cancel();
    let _ = run_handle.await;

    info!("game-warden shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
