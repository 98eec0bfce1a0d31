// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persisted process entity shared by every entity type.
//!
//! An entity type is a pair of a state enum ([`EntityState`]) and a payload
//! ([`Payload`]). The engine only reads and writes the bookkeeping fields;
//! the payload is visible to handlers alone.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::lease::Lease;

/// State enum of one entity type.
///
/// States are persisted by their integer code.
pub trait EntityState:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Persisted code of this state.
    fn code(&self) -> i32;

    /// Decode a persisted state code.
    fn from_code(code: i32) -> Option<Self>;
}

/// Business data carried by an entity, persisted as JSON.
pub trait Payload: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where
    T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Correlation metadata propagated with the entity (W3C trace headers and similar).
pub type TraceContext = HashMap<String, String>;

/// One long-running process instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StatefulEntity<S, P> {
    /// Opaque unique identifier, immutable.
    pub id: String,
    /// Current state; drives dispatch.
    pub state: S,
    /// Attempts made from the current state; reset when the state changes.
    pub state_count: u32,
    /// Time of the last persisted transition attempt.
    pub state_timestamp: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Correlation metadata, opaque to the engine.
    pub trace_context: TraceContext,
    /// Last failure message; cleared on success.
    pub error_detail: Option<String>,
    /// Current ownership claim, if any.
    pub lease: Option<Lease>,
    /// Set when a cancellation arrived while the entity was leased.
    pub cancel_requested: bool,
    /// Optimistic-concurrency stamp, bumped by every conditional write.
    pub version: i64,
    /// Entity-type-specific business data.
    pub payload: P,
}

impl<S: Copy, P> StatefulEntity<S, P> {
    /// A fresh entity in `state` at `now`.
    pub fn new(id: impl Into<String>, state: S, payload: P, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            trace_context: TraceContext::new(),
            error_detail: None,
            lease: None,
            cancel_requested: false,
            version: 0,
            payload,
        }
    }

    /// Attach correlation metadata.
    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = trace_context;
        self
    }

    /// Move to another state: count reset, error cleared.
    pub fn transition_to(&mut self, state: S, now: DateTime<Utc>) {
        self.state = state;
        self.state_count = 0;
        self.error_detail = None;
        self.state_timestamp = now;
        self.updated_at = now;
    }

    /// Stay in the current state after a failed attempt.
    pub fn record_retry(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.state_count = self.state_count.saturating_add(1);
        self.error_detail = Some(reason.into());
        self.state_timestamp = now;
        self.updated_at = now;
    }

    /// Move to a failure state, keeping the reason.
    pub fn fail(&mut self, failed: S, reason: impl Into<String>, now: DateTime<Utc>) {
        self.transition_to(failed, now);
        self.error_detail = Some(reason.into());
    }

    /// Whether a live lease exists at `now`, whoever holds it.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_live(now))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal state set used by unit tests across the crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) enum TestState {
        Initial,
        Approved,
        Issued,
        Failed,
        Cancelled,
    }

    impl fmt::Display for TestState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Self::Initial => "INITIAL",
                Self::Approved => "APPROVED",
                Self::Issued => "ISSUED",
                Self::Failed => "FAILED",
                Self::Cancelled => "CANCELLED",
            };
            f.write_str(name)
        }
    }

    impl EntityState for TestState {
        fn code(&self) -> i32 {
            match self {
                Self::Initial => 100,
                Self::Approved => 200,
                Self::Issued => 300,
                Self::Failed => 400,
                Self::Cancelled => 500,
            }
        }

        fn from_code(code: i32) -> Option<Self> {
            match code {
                100 => Some(Self::Initial),
                200 => Some(Self::Approved),
                300 => Some(Self::Issued),
                400 => Some(Self::Failed),
                500 => Some(Self::Cancelled),
                _ => None,
            }
        }
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            TestState::Initial,
            TestState::Approved,
            TestState::Issued,
            TestState::Failed,
            TestState::Cancelled,
        ] {
            assert_eq!(TestState::from_code(state.code()), Some(state));
        }
        assert_eq!(TestState::from_code(42), None);
    }

    #[test]
    fn test_retry_increments_and_transition_resets() {
        let t0 = Utc::now();
        let mut entity = StatefulEntity::new("e-1", TestState::Initial, (), t0);

        entity.record_retry("issuer unreachable", t0 + chrono::Duration::seconds(1));
        entity.record_retry("issuer unreachable", t0 + chrono::Duration::seconds(3));
        assert_eq!(entity.state_count, 2);
        assert_eq!(entity.error_detail.as_deref(), Some("issuer unreachable"));

        let t1 = t0 + chrono::Duration::seconds(7);
        entity.transition_to(TestState::Approved, t1);
        assert_eq!(entity.state, TestState::Approved);
        assert_eq!(entity.state_count, 0);
        assert_eq!(entity.error_detail, None);
        assert_eq!(entity.state_timestamp, t1);
        assert_eq!(entity.created_at, t0);
    }

    #[test]
    fn test_fail_keeps_reason() {
        let now = Utc::now();
        let mut entity = StatefulEntity::new("e-1", TestState::Approved, (), now);
        entity.record_retry("timeout", now);

        entity.fail(TestState::Failed, "retries exhausted: timeout", now);

        assert_eq!(entity.state, TestState::Failed);
        assert_eq!(entity.state_count, 0);
        assert_eq!(
            entity.error_detail.as_deref(),
            Some("retries exhausted: timeout")
        );
    }
}
