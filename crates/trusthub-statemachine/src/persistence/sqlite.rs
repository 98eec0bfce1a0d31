// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed entity store.

use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{
    COLUMNS, Criteria, EntityRow, EntityStore, RowValues, limit_offset, map_insert_error,
    validate_table_name,
};
use crate::entity::{EntityState, Payload, StatefulEntity};
use crate::error::{Result, StoreError};
use crate::lease::expiry_after;

/// SQLite-backed store for one entity type, one table per type.
pub struct SqliteEntityStore<S, P> {
    pool: SqlitePool,
    table: String,
    _entity: PhantomData<fn() -> (S, P)>,
}

impl<S, P> Clone for SqliteEntityStore<S, P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.clone(),
            _entity: PhantomData,
        }
    }
}

impl<S: EntityState, P: Payload> SqliteEntityStore<S, P> {
    /// Create a store over an existing pool. The table is not created; call
    /// [`ensure_schema`](Self::ensure_schema) once at startup.
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool,
            table,
            _entity: PhantomData,
        })
    }

    /// Open (creating if needed) a database file and ensure the table exists.
    pub async fn from_path(path: impl AsRef<Path>, table: impl Into<String>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        let store = Self::new(pool, table)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the entity table and its polling index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                state_count INTEGER NOT NULL DEFAULT 0,
                state_timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                trace_context TEXT NOT NULL DEFAULT '{{}}',
                error_detail TEXT,
                lease_holder TEXT,
                lease_expiry INTEGER,
                cancel_requested BOOLEAN NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_state_ts ON {table} (state, state_timestamp)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_lease_holder ON {table} (lease_holder)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Table this store reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn fetch(&self, id: &str) -> Result<Option<EntityRow>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = ?",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Lease-conflict or not-found, decided after a conditional write matched no row.
    async fn lease_miss(&self, id: &str) -> StoreError {
        match self.fetch(id).await {
            Ok(Some(_)) => StoreError::Lease {
                entity_id: id.to_string(),
            },
            Ok(None) => StoreError::NotFound {
                entity_id: id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl<S: EntityState, P: Payload> EntityStore<S, P> for SqliteEntityStore<S, P> {
    async fn find(&self, id: &str) -> Result<Option<StatefulEntity<S, P>>> {
        self.fetch(id).await?.map(EntityRow::into_entity).transpose()
    }

    async fn create(&self, entity: &StatefulEntity<S, P>) -> Result<()> {
        let values = RowValues::of(entity)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, state, state_count, state_timestamp, created_at, updated_at,
                            trace_context, error_detail, lease_holder, lease_expiry,
                            cancel_requested, version, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.table
        ))
        .bind(&entity.id)
        .bind(values.state)
        .bind(values.state_count)
        .bind(values.state_timestamp)
        .bind(values.created_at)
        .bind(values.updated_at)
        .bind(&values.trace_context)
        .bind(&entity.error_detail)
        .bind(&values.lease_holder)
        .bind(values.lease_expiry)
        .bind(entity.cancel_requested)
        .bind(entity.version)
        .bind(&values.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &entity.id))?;

        Ok(())
    }

    async fn update(&self, entity: &StatefulEntity<S, P>) -> Result<StatefulEntity<S, P>> {
        let values = RowValues::of(entity)?;
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            UPDATE {}
            SET state = ?1, state_count = ?2, state_timestamp = ?3, updated_at = ?4,
                trace_context = ?5, error_detail = ?6, lease_holder = ?7, lease_expiry = ?8,
                payload = ?9, version = version + 1
            WHERE id = ?10 AND version = ?11
            RETURNING {COLUMNS}
            "#,
            self.table
        ))
        .bind(values.state)
        .bind(values.state_count)
        .bind(values.state_timestamp)
        .bind(values.updated_at)
        .bind(&values.trace_context)
        .bind(&entity.error_detail)
        .bind(&values.lease_holder)
        .bind(values.lease_expiry)
        .bind(&values.payload)
        .bind(&entity.id)
        .bind(entity.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_entity(),
            None => Err(StoreError::Concurrency {
                entity_id: entity.id.clone(),
                expected_version: entity.version,
            }),
        }
    }

    async fn query(&self, criteria: &Criteria<S>) -> Result<Vec<StatefulEntity<S, P>>> {
        let (cutoffs, fallback) = criteria.due_cutoffs();
        let cutoffs = cutoffs.map(|c| serde_json::Value::from(c).to_string());
        let (limit, offset) = limit_offset(criteria);
        let order = criteria.order.as_sql();

        // ORDER BY direction cannot be bound; it comes from a closed enum.
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM {}
            WHERE (?1 IS NULL OR state IN (SELECT value FROM json_each(?1)))
              AND (?2 IS NULL OR lease_holder IS NULL OR lease_expiry IS NULL OR lease_expiry <= ?2)
              AND (?3 IS NULL OR state_timestamp <=
                   COALESCE(json_extract(?3, '$[' || state_count || ']'), ?4))
              AND (?5 IS NULL OR lease_holder = ?5)
            ORDER BY state_timestamp {order}, id {order}
            LIMIT ?6 OFFSET ?7
            "#,
            self.table
        ))
        .bind(criteria.state_codes_json())
        .bind(criteria.not_leased_at.map(|t| t.timestamp_millis()))
        .bind(cutoffs)
        .bind(fallback)
        .bind(&criteria.lease_holder)
        .bind(limit.unwrap_or(-1))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            UPDATE {}
            SET lease_holder = ?1, lease_expiry = ?2, version = version + 1
            WHERE id = ?3
              AND (lease_holder IS NULL OR lease_expiry IS NULL OR lease_expiry <= ?4)
            RETURNING {COLUMNS}
            "#,
            self.table
        ))
        .bind(holder)
        .bind(expiry_after(now, duration).timestamp_millis())
        .bind(id)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_entity(),
            None => Err(self.lease_miss(id).await),
        }
    }

    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            UPDATE {}
            SET lease_expiry = ?1, version = version + 1
            WHERE id = ?2 AND lease_holder = ?3
            RETURNING {COLUMNS}
            "#,
            self.table
        ))
        .bind(expiry_after(now, duration).timestamp_millis())
        .bind(id)
        .bind(holder)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_entity(),
            None => Err(self.lease_miss(id).await),
        }
    }

    async fn release_lease(&self, id: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET lease_holder = NULL, lease_expiry = NULL, version = version + 1
            WHERE id = ?1 AND lease_holder = ?2
            "#,
            self.table
        ))
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_leases_held_by(&self, holder: &str) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET lease_holder = NULL, lease_expiry = NULL, version = version + 1
            WHERE lease_holder = ?1
            "#,
            self.table
        ))
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_if_free(
        &self,
        id: &str,
        cancelled: S,
        terminal: &[S],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let terminal_codes: Vec<i32> = terminal.iter().map(|s| s.code()).collect();
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET state = ?1, state_count = 0, state_timestamp = ?2, updated_at = ?2,
                error_detail = NULL, lease_holder = NULL, lease_expiry = NULL,
                version = version + 1
            WHERE id = ?3
              AND state NOT IN (SELECT value FROM json_each(?4))
              AND (lease_holder IS NULL OR lease_expiry IS NULL OR lease_expiry <= ?2)
            "#,
            self.table
        ))
        .bind(cancelled.code())
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(serde_json::Value::from(terminal_codes).to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.fetch(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity_id: id.to_string(),
            }),
        }
    }

    async fn request_cancel(&self, id: &str, terminal: &[S]) -> Result<bool> {
        let terminal_codes: Vec<i32> = terminal.iter().map(|s| s.code()).collect();
        let result = sqlx::query(&format!(
            "UPDATE {} SET cancel_requested = 1 \
             WHERE id = ?1 AND state NOT IN (SELECT value FROM json_each(?2))",
            self.table
        ))
        .bind(id)
        .bind(serde_json::Value::from(terminal_codes).to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.fetch(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity_id: id.to_string(),
            }),
        }
    }
}
