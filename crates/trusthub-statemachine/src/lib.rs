// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trusthub State Machine - Persistent Process Engine
//!
//! This crate drives long-lived entities (credential issuance processes,
//! holder credential requests, status-list publication jobs) through their
//! states. All progress is derived from persisted state, so processing
//! survives restarts, and several service instances can run the same engines
//! against one database without a coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Protocol / REST layers (not in this crate)           │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 │ create_entity / cancel_entity / query
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           EntityService                              │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 │
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     EntityStore (one table per type)                 │
//! │        InMemoryEntityStore | SqliteEntityStore | PostgresEntityStore │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 ▲  query due → lease → persist outcome
//!                 │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  EngineSupervisor                                                    │
//! │  ┌───────────────────┐ ┌───────────────────┐ ┌───────────────────┐   │
//! │  │ ProcessEngine<A>  │ │ ProcessEngine<B>  │ │ ProcessEngine<C>  │   │
//! │  │ TransitionRegistry│ │ TransitionRegistry│ │ TransitionRegistry│   │
//! │  └───────────────────┘ └───────────────────┘ └───────────────────┘   │
//! │                 shared WorkerPool (handler permits)                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Entity Lifecycle
//!
//! ```text
//!   INITIAL ──► ...intermediate states... ──► terminal success
//!      │                  │
//!      │ Fatal / retries exhausted
//!      └──────────────────┴──────────────► FAILED
//!      │                  │
//!      │ cancel_entity (external trigger)
//!      └──────────────────┴──────────────► CANCELLED
//! ```
//!
//! Terminal states are never selected again. A handler returns `Success`,
//! `Retry` or `Fatal`; a `Retry` waits `min(base * 2^state_count, max)` from
//! the last attempt and turns into a failure once `state_count > max_retries`.
//!
//! # Configuration
//!
//! [`EngineConfig::from_env`](config::EngineConfig::from_env) reads, for a
//! given prefix:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `{PREFIX}_BATCH_SIZE` | `5` | Entities selected per poll cycle |
//! | `{PREFIX}_POLL_INTERVAL_MS` | `1000` | Pause between poll cycles |
//! | `{PREFIX}_LEASE_DURATION_MS` | `60000` | Lease length; must exceed handler latency |
//! | `{PREFIX}_MAX_RETRIES` | `7` | Retries per state before failing |
//! | `{PREFIX}_BASE_DELAY_MS` | `1000` | Backoff delay for the first attempt |
//! | `{PREFIX}_MAX_DELAY_MS` | `60000` | Backoff cap |
//! | `{PREFIX}_CONCURRENCY` | `1` | Entities of a batch processed at once |
//!
//! # Modules
//!
//! - [`clock`]: Time sources
//! - [`entity`]: The persisted entity and its state/payload traits
//! - [`lease`]: Lease predicates
//! - [`persistence`]: Entity store trait and backends
//! - [`registry`]: Per-type transition tables and handlers
//! - [`retry`]: Backoff and retry budget
//! - [`engine`]: The poll loop
//! - [`supervisor`]: Lifecycle of several engines
//! - [`service`]: Trigger API
//! - [`telemetry`]: Transition events

#![deny(missing_docs)]

/// Time sources.
pub mod clock;

/// Engine configuration loaded from environment variables.
pub mod config;

/// The process engine poll loop.
pub mod engine;

/// Entity model.
pub mod entity;

/// Error types.
pub mod error;

/// Lease predicates.
pub mod lease;

/// Entity store trait and its backends.
pub mod persistence;

/// Transition registry and state handlers.
pub mod registry;

/// Retry and backoff policy.
pub mod retry;

/// Trigger API for external callers.
pub mod service;

/// Supervisor running one engine per entity type.
pub mod supervisor;

/// Transition events.
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{CycleReport, ProcessEngine, ProcessEngineBuilder};
pub use entity::{EntityState, Payload, StatefulEntity, TraceContext};
pub use error::{RegistryError, ServiceError, StoreError};
pub use lease::Lease;
pub use persistence::{
    Criteria, EntityStore, InMemoryEntityStore, PostgresEntityStore, SortOrder, SqliteEntityStore,
};
pub use registry::{
    FnHandler, RegistryBuilder, StateHandler, TransitionRegistry, TransitionResult, handler_fn,
};
pub use retry::{DueFilter, RetryPolicy};
pub use service::{CancelOutcome, EntityService};
pub use supervisor::{
    EngineSupervisor, ManagedEngine, RunningSupervisor, ShutdownReport, SupervisorError,
    WorkerPool,
};
pub use telemetry::{Outcome, TracingListener, TransitionEvent, TransitionListener};
