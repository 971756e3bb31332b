// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for soma-core.
//!
//! The schema ships embedded in the binary. [`run`] is safe to call on every
//! start; already-applied migrations are skipped.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use soma_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:soma.db").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
