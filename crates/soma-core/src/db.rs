// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database access: the shared read pool and the process-wide write gate.
//!
//! SQLite allows one writer at a time. Every write transaction is opened
//! through [`Database::begin_write`], which holds the gate until the
//! transaction is committed or dropped. Workflow transitions therefore
//! observe and change a row without interleaving, which is what a
//! `SELECT ... FOR UPDATE` would give on a server database.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::migrations;

/// Pool handle plus the write gate shared by every clone and every dedicated pool.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    options: SqliteConnectOptions,
    timeout: Duration,
    write_gate: Arc<Mutex<()>>,
}

impl Database {
    /// Connect the shared pool and apply migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(config.database_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(config.database_timeout)
            .connect_with(options.clone())
            .await?;

        migrations::run(&pool).await?;
        info!(
            max_connections = config.database_max_connections,
            "Database connection established"
        );

        Ok(Self {
            pool,
            options,
            timeout: config.database_timeout,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Connect to a database file, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config {
            database_url: format!("sqlite:{}", path.as_ref().to_string_lossy()),
            ..Config::default()
        };
        Self::connect(&config).await
    }

    /// A separate pool on the same database, sharing the write gate.
    ///
    /// TreeKeepers own one each so long jobs do not starve the read handlers.
    pub async fn dedicated(&self, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(self.timeout)
            .connect_with(self.options.clone())
            .await?;
        Ok(Self {
            pool,
            options: self.options.clone(),
            timeout: self.timeout,
            write_gate: self.write_gate.clone(),
        })
    }

    /// The pool, for reads and auto-commit statements.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a write transaction. Foreign key checks are deferred to commit.
    pub async fn begin_write(&self) -> Result<WriteTx> {
        let guard = self.write_gate.clone().lock_owned().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut *tx)
            .await?;
        Ok(WriteTx { tx, _guard: guard })
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A write transaction holding the write gate.
///
/// Dropping it without [`WriteTx::commit`] rolls back and releases the gate.
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTx {
    /// The connection to run statements on.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commit and release the gate.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back and release the gate.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
