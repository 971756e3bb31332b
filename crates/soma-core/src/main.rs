// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! soma - repository tree keepers and deployment workflow daemon
//!
//! Loads configuration from the environment (and `.env`), opens the SQLite
//! database, starts every handler and TreeKeeper and runs until Ctrl-C or a
//! `system shutdown` request.

use std::path::Path;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use soma_core::{Config, Database, SomaRuntime};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "soma_core=info,soma_tree=info".into())
}

/// Install the subscriber; with a log directory, also write a daily `soma.log`.
fn init_logging(log_path: Option<&Path>) -> Option<WorkerGuard> {
    let stdout = tracing_subscriber::fmt::layer();
    match log_path {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "soma.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(stdout)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = Config::from_env()?;
    let _guard = init_logging(config.log_path.as_deref());
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        database_url = %config.database_url,
        observer = config.observer,
        read_only = config.read_only,
        "Starting soma"
    );

    let db = Database::connect(&config).await?;
    info!("Database schema verified");

    let runtime = SomaRuntime::builder()
        .config(config)
        .database(db)
        .build()?
        .start()
        .await?;

    info!("soma ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        _ = runtime.wait() => {
            info!("Shutdown requested");
        }
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("soma shut down");

    Ok(())
}
