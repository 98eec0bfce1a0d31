// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity store interface and backends.
//!
//! The store is the only state shared between engines and between service
//! instances. Every mutating operation is a single conditional write, so two
//! workers racing on the same entity cannot both succeed:
//!
//! - [`EntityStore::lease`] claims an entity only if it is free or expired.
//! - [`EntityStore::update`] writes only if the stored `version` still equals
//!   the version the caller read.
//!
//! Backends: [`InMemoryEntityStore`] (single process, tests),
//! [`SqliteEntityStore`] and [`PostgresEntityStore`] (one table per entity type).

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::InMemoryEntityStore;
pub use self::postgres::PostgresEntityStore;
pub use self::sqlite::SqliteEntityStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::{EntityState, Payload, StatefulEntity, TraceContext};
use crate::error::{Result, StoreError};
use crate::lease::Lease;
use crate::retry::DueFilter;

/// Persistence contract for one entity type.
#[async_trait]
pub trait EntityStore<S, P>: Send + Sync {
    /// Load an entity by id.
    async fn find(&self, id: &str) -> Result<Option<StatefulEntity<S, P>>>;

    /// Insert a new entity. Fails with [`StoreError::AlreadyExists`] on a duplicate id.
    async fn create(&self, entity: &StatefulEntity<S, P>) -> Result<()>;

    /// Persist `entity` if the stored version still equals `entity.version`.
    ///
    /// Writes state, bookkeeping, lease and payload, and returns the entity with
    /// its new version. The pending-cancellation flag is never written here.
    /// Fails with [`StoreError::Concurrency`] on a version mismatch.
    async fn update(&self, entity: &StatefulEntity<S, P>) -> Result<StatefulEntity<S, P>>;

    /// List entities matching `criteria`.
    async fn query(&self, criteria: &Criteria<S>) -> Result<Vec<StatefulEntity<S, P>>>;

    /// Acquire the lease if it is free or expired at `now`, and return the
    /// leased entity. Fails with [`StoreError::Lease`] when another holder
    /// owns a live lease.
    async fn lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>>;

    /// Extend a lease `holder` still owns to `now + duration`.
    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>>;

    /// Drop the lease if `holder` owns it. Returns whether a lease was dropped.
    async fn release_lease(&self, id: &str, holder: &str) -> Result<bool>;

    /// Drop every lease owned by `holder`. Returns the number released.
    async fn release_leases_held_by(&self, holder: &str) -> Result<u64>;

    /// Move the entity to `cancelled` if it is free at `now` and not in one of
    /// the `terminal` states. Returns whether it was cancelled.
    async fn cancel_if_free(
        &self,
        id: &str,
        cancelled: S,
        terminal: &[S],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set the pending-cancellation flag unless the entity is in one of the
    /// `terminal` states. Does not touch `version`, so the current lease
    /// holder's persist still succeeds. Returns whether the flag was set.
    async fn request_cancel(&self, id: &str, terminal: &[S]) -> Result<bool>;
}

/// Sort direction on `state_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Selection criteria for [`EntityStore::query`]. All filters are optional
/// and combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria<S> {
    /// Only entities in one of these states.
    pub states: Option<Vec<S>>,
    /// Only entities without a live lease at this instant.
    pub not_leased_at: Option<DateTime<Utc>>,
    /// Only entities that are due.
    pub due: Option<DueFilter>,
    /// Only entities leased by this holder.
    pub lease_holder: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Results to skip.
    pub offset: usize,
    /// Order on `state_timestamp`; ties break on id.
    pub order: SortOrder,
}

impl<S> Default for Criteria<S> {
    fn default() -> Self {
        Self {
            states: None,
            not_leased_at: None,
            due: None,
            lease_holder: None,
            limit: None,
            offset: 0,
            order: SortOrder::Asc,
        }
    }
}

impl<S: EntityState> Criteria<S> {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `states`.
    pub fn in_states(mut self, states: &[S]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    /// Exclude entities with a live lease at `now`.
    pub fn not_leased_at(mut self, now: DateTime<Utc>) -> Self {
        self.not_leased_at = Some(now);
        self
    }

    /// Restrict to due entities.
    pub fn due(mut self, filter: DueFilter) -> Self {
        self.due = Some(filter);
        self
    }

    /// Restrict to entities leased by `holder`.
    pub fn leased_by(mut self, holder: impl Into<String>) -> Self {
        self.lease_holder = Some(holder.into());
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the sort order.
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Evaluate the criteria against one entity (limit and offset excluded).
    pub fn matches<P>(&self, entity: &StatefulEntity<S, P>) -> bool {
        if let Some(states) = &self.states
            && !states.contains(&entity.state)
        {
            return false;
        }
        if let Some(now) = self.not_leased_at
            && entity.is_leased_at(now)
        {
            return false;
        }
        if let Some(due) = &self.due
            && !due.admits(entity.state_count, entity.state_timestamp)
        {
            return false;
        }
        if let Some(holder) = &self.lease_holder
            && entity.lease.as_ref().is_none_or(|l| &l.holder != holder)
        {
            return false;
        }
        true
    }

    pub(crate) fn state_codes_json(&self) -> Option<String> {
        self.states.as_ref().map(|states| {
            let codes: Vec<i32> = states.iter().map(|s| s.code()).collect();
            serde_json::Value::from(codes).to_string()
        })
    }

    pub(crate) fn state_codes(&self) -> Option<Vec<i32>> {
        self.states
            .as_ref()
            .map(|states| states.iter().map(|s| s.code()).collect())
    }

    pub(crate) fn due_cutoffs(&self) -> (Option<Vec<i64>>, Option<i64>) {
        match &self.due {
            Some(due) => (
                Some(due.cutoffs.iter().map(|c| c.timestamp_millis()).collect()),
                Some(due.fallback.timestamp_millis()),
            ),
            None => (None, None),
        }
    }
}

/// Column list shared by every SQL statement that returns an entity.
pub(crate) const COLUMNS: &str = "id, state, state_count, state_timestamp, created_at, \
     updated_at, trace_context, error_detail, lease_holder, lease_expiry, \
     cancel_requested, version, payload";

/// Raw entity row as stored by the SQL backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub id: String,
    pub state: i32,
    pub state_count: i64,
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub trace_context: String,
    pub error_detail: Option<String>,
    pub lease_holder: Option<String>,
    pub lease_expiry: Option<i64>,
    pub cancel_requested: bool,
    pub version: i64,
    pub payload: String,
}

impl EntityRow {
    pub(crate) fn into_entity<S: EntityState, P: Payload>(self) -> Result<StatefulEntity<S, P>> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            entity_id: self.id.clone(),
            reason,
        };
        let state = S::from_code(self.state)
            .ok_or_else(|| corrupt(format!("unknown state code {}", self.state)))?;
        let state_count = u32::try_from(self.state_count)
            .map_err(|_| corrupt(format!("state_count out of range: {}", self.state_count)))?;
        let instant = |millis: i64, column: &str| {
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| corrupt(format!("{column} out of range: {millis}")))
        };
        let state_timestamp = instant(self.state_timestamp, "state_timestamp")?;
        let created_at = instant(self.created_at, "created_at")?;
        let updated_at = instant(self.updated_at, "updated_at")?;
        let lease = match (self.lease_holder.clone(), self.lease_expiry) {
            (Some(holder), Some(expiry)) => Some(Lease {
                holder,
                expiry: instant(expiry, "lease_expiry")?,
            }),
            _ => None,
        };
        let trace_context: TraceContext = serde_json::from_str(&self.trace_context)?;
        let payload: P = serde_json::from_str(&self.payload)?;

        Ok(StatefulEntity {
            id: self.id,
            state,
            state_count,
            state_timestamp,
            created_at,
            updated_at,
            trace_context,
            error_detail: self.error_detail,
            lease,
            cancel_requested: self.cancel_requested,
            version: self.version,
            payload,
        })
    }
}

/// Bind values for writing an entity, shared by the SQL backends.
pub(crate) struct RowValues {
    pub state: i32,
    pub state_count: i64,
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub trace_context: String,
    pub lease_holder: Option<String>,
    pub lease_expiry: Option<i64>,
    pub payload: String,
}

impl RowValues {
    pub(crate) fn of<S: EntityState, P: Payload>(entity: &StatefulEntity<S, P>) -> Result<Self> {
        Ok(Self {
            state: entity.state.code(),
            state_count: i64::from(entity.state_count),
            state_timestamp: entity.state_timestamp.timestamp_millis(),
            created_at: entity.created_at.timestamp_millis(),
            updated_at: entity.updated_at.timestamp_millis(),
            trace_context: serde_json::to_string(&entity.trace_context)?,
            lease_holder: entity.lease.as_ref().map(|l| l.holder.clone()),
            lease_expiry: entity.lease.as_ref().map(|l| l.expiry.timestamp_millis()),
            payload: serde_json::to_string(&entity.payload)?,
        })
    }
}

/// Accept only plain SQL identifiers as table names.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

/// Map a unique-key violation on insert to [`StoreError::AlreadyExists`].
pub(crate) fn map_insert_error(error: sqlx::Error, entity_id: &str) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists {
            entity_id: entity_id.to_string(),
        },
        _ => StoreError::Database(error),
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn limit_offset<S>(criteria: &Criteria<S>) -> (Option<i64>, i64) {
    (criteria.limit.map(to_i64), to_i64(criteria.offset))
}
