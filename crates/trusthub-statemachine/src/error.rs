// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trusthub-statemachine.
//!
//! Lease and concurrency conflicts are expected races between workers, not
//! failures; callers check [`StoreError::is_conflict`] before logging.

use thiserror::Error;

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by an [`EntityStore`](crate::persistence::EntityStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No entity with this id.
    #[error("Entity '{entity_id}' not found")]
    NotFound {
        /// The entity id that was not found.
        entity_id: String,
    },

    /// An entity with this id already exists.
    #[error("Entity '{entity_id}' already exists")]
    AlreadyExists {
        /// The duplicate entity id.
        entity_id: String,
    },

    /// Another holder owns a live lease on the entity.
    #[error("Entity '{entity_id}' is leased by another holder")]
    Lease {
        /// The contested entity id.
        entity_id: String,
    },

    /// The stored version no longer matches the version the caller read.
    #[error("Entity '{entity_id}' was modified concurrently (expected version {expected_version})")]
    Concurrency {
        /// The entity id.
        entity_id: String,
        /// Version the caller expected to overwrite.
        expected_version: i64,
    },

    /// A stored row could not be mapped back to an entity.
    #[error("Entity '{entity_id}' has a corrupt record: {reason}")]
    CorruptRecord {
        /// The entity id.
        entity_id: String,
        /// What could not be decoded.
        reason: String,
    },

    /// A store was configured with a table name that is not a plain identifier.
    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload or trace context (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ENTITY_NOT_FOUND",
            Self::AlreadyExists { .. } => "ENTITY_ALREADY_EXISTS",
            Self::Lease { .. } => "LEASE_CONFLICT",
            Self::Concurrency { .. } => "CONCURRENT_MODIFICATION",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::InvalidTableName(_) => "INVALID_TABLE_NAME",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether this error is a benign race with another worker.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Lease { .. } | Self::Concurrency { .. })
    }
}

/// Wiring errors detected while building a
/// [`TransitionRegistry`](crate::registry::TransitionRegistry).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// A required role (initial, failed, cancelled) was never assigned.
    #[error("{entity_type}: no {role} state configured")]
    MissingState {
        /// Entity type being built.
        entity_type: String,
        /// The missing role.
        role: &'static str,
    },

    /// A handler was registered for a terminal state.
    #[error("{entity_type}: cannot register a handler for terminal state {state}")]
    HandlerOnTerminalState {
        /// Entity type being built.
        entity_type: String,
        /// The terminal state.
        state: String,
    },

    /// Two handlers were registered for the same state.
    #[error("{entity_type}: duplicate handler for state {state}")]
    DuplicateHandler {
        /// Entity type being built.
        entity_type: String,
        /// The state with two handlers.
        state: String,
    },

    /// A handler declares a next state that the transition graph does not allow.
    #[error("{entity_type}: handler for {from} declares illegal next state {to}")]
    IllegalDeclaredTransition {
        /// Entity type being built.
        entity_type: String,
        /// Handler state.
        from: String,
        /// Declared next state.
        to: String,
    },

    /// The transition graph leaves a terminal state.
    #[error("{entity_type}: terminal state {from} cannot transition to {to}")]
    TransitionFromTerminal {
        /// Entity type being built.
        entity_type: String,
        /// Terminal state.
        from: String,
        /// Target state.
        to: String,
    },
}

/// Errors returned by the trigger API ([`EntityService`](crate::service::EntityService)).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// No entity with this id.
    #[error("Entity '{0}' not found")]
    NotFound(String),

    /// The entity already reached a terminal state.
    #[error("Entity '{entity_id}' is already in terminal state {state}")]
    AlreadyTerminal {
        /// The entity id.
        entity_id: String,
        /// Its terminal state.
        state: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
