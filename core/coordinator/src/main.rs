//! chat-tally coordinator entrypoint.
//!
//! A small single-writer service: one coordinator task owning every session,
//! a SQLite mirror for cold starts, and a Unix socket for monitors and
//! observers. Runs on a current-thread runtime; nothing here needs parallelism.

use std::env;
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally_coordinator::server::{prepare_socket_dir, remove_existing_socket, serve};
use tally_coordinator::{Coordinator, LogBadge, SqliteKv};
use tally_core::{load_config, TallyConfig};

const DEBUG_LOG_ENV: &str = "CHAT_TALLY_DEBUG_LOG";

fn main() {
    init_logging();

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            TallyConfig::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(run(config));
}

async fn run(config: TallyConfig) {
    let socket_path = match config.socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve coordinator socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare coordinator socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                error = %err,
                path = %socket_path.display(),
                "Failed to bind coordinator socket"
            );
            std::process::exit(1);
        }
    };

    let (coordinator, handle) = Coordinator::new(Box::new(LogBadge), config.badge.color.clone());
    let coordinator = match open_storage(&config) {
        Some(storage) => coordinator.with_persistence(Box::new(storage)),
        None => coordinator,
    };
    let coordinator_task = tokio::spawn(coordinator.run());

    info!(path = %socket_path.display(), "chat-tally coordinator started");

    serve(listener, handle.clone(), shutdown_signal()).await;

    handle.shutdown();
    if let Err(err) = coordinator_task.await {
        warn!(error = %err, "Coordinator task ended abnormally");
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove socket on shutdown");
    }
    info!("chat-tally coordinator stopped");
}

/// Storage problems never stop the coordinator; it runs in memory instead.
fn open_storage(config: &TallyConfig) -> Option<SqliteKv> {
    let path = match config.storage_path() {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, "Failed to resolve storage path; running without persistence");
            return None;
        }
    };
    match SqliteKv::new(path.clone()) {
        Ok(storage) => {
            info!(path = %path.display(), "Storage mirror opened");
            Some(storage)
        }
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "Failed to open storage; running without persistence"
            );
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
