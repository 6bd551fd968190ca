//! TideKV server binary.
//!
//! Wires the storage engine, reaper, append-only file and TCP listener
//! together and runs until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tidekv::commands::CommandHandler;
use tidekv::config::Config;
use tidekv::connection::{handle_connection, ConnectionStats};
use tidekv::persistence::{start_fsync_task, AppendOnlyFile};
use tidekv::storage::{Reaper, StorageEngine};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(version = tidekv::VERSION, "TideKV starting");

    let storage = Arc::new(StorageEngine::new());
    let mut handler = CommandHandler::new(Arc::clone(&storage));

    let mut fsync_task = None;
    let mut log = None;
    if let Some(path) = config.aof_path() {
        let aof = AppendOnlyFile::open(path, config.appendfsync)
            .with_context(|| format!("failed to open AOF {}", path.display()))?;

        let stats = aof
            .replay(|request| {
                let reply = handler.apply(request);
                if reply.is_error() {
                    warn!(%reply, "Replayed command failed");
                }
            })
            .context("failed to replay AOF")?;
        info!(
            commands = stats.commands,
            keys = storage.len(),
            "State restored from AOF"
        );

        let aof = Arc::new(aof);
        fsync_task = start_fsync_task(Arc::clone(&aof));
        handler = handler.with_aof(Arc::clone(&aof));
        log = Some(aof);
    } else {
        info!("AOF disabled");
    }

    let _reaper = Reaper::start(Arc::clone(&storage), config.reaper_config());

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "Listening");

    tokio::select! {
        _ = accept_loop(listener, handler, Arc::clone(&stats)) => {}
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping server"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    }

    if let Some(task) = fsync_task {
        task.abort();
    }
    if let Some(aof) = log {
        if let Err(e) = aof.sync() {
            error!(error = %e, path = %aof.path().display(), "Final AOF fsync failed");
        }
    }

    let storage_stats = storage.stats();
    let connection_stats = stats.snapshot();
    info!(
        connections = connection_stats.accepted,
        commands = connection_stats.commands,
        strings = storage_stats.strings,
        hashes = storage_stats.hashes,
        expired = storage_stats.expired,
        "Server shutdown complete"
    );
    Ok(())
}

async fn accept_loop(listener: TcpListener, handler: CommandHandler, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    handler.clone(),
                    Arc::clone(&stats),
                ));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
