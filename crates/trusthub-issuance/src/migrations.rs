// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded migrations creating the tables of the three process types.
//!
//! Table and column layout matches what
//! [`SqliteEntityStore`](trusthub_statemachine::SqliteEntityStore) and
//! [`PostgresEntityStore`](trusthub_statemachine::PostgresEntityStore) read and write.

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all hub migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all hub migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run pending PostgreSQL migrations.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run pending SQLite migrations.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
