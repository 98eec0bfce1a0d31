// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition events.
//!
//! The engine emits one [`TransitionEvent`] per persisted outcome. Events are
//! handed to a [`TransitionListener`]; the default one writes them to
//! `tracing`, where a subscriber can forward them to metrics or traces.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

/// How an entity left a processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Moved to the handler's next state.
    Success,
    /// Stayed in its state for another attempt.
    Retry,
    /// Moved to the failed state because the handler reported a fatal error.
    Fatal,
    /// Moved to the failed state because its retry budget ran out.
    Exhausted,
    /// Moved to the cancelled state.
    Cancelled,
}

impl Outcome {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Fatal => "fatal",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    /// Entity id.
    pub entity_id: String,
    /// Entity type name from the registry.
    pub entity_type: String,
    /// State before the attempt.
    pub from_state: String,
    /// State after the attempt.
    pub to_state: String,
    /// Outcome classification.
    pub outcome: Outcome,
    /// `state_count` after the attempt.
    pub state_count: u32,
    /// Error recorded on the entity, if any.
    pub error_detail: Option<String>,
    /// Wall time spent from lease to persist.
    pub duration_ms: u64,
}

/// Receiver for transition events.
pub trait TransitionListener: Send + Sync {
    /// Called after the outcome was persisted. Must not block.
    fn on_transition(&self, event: &TransitionEvent);
}

/// Listener that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl TransitionListener for TracingListener {
    fn on_transition(&self, event: &TransitionEvent) {
        match event.outcome {
            Outcome::Success | Outcome::Cancelled => info!(
                entity_id = %event.entity_id,
                entity_type = %event.entity_type,
                from_state = %event.from_state,
                to_state = %event.to_state,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                "Entity transitioned"
            ),
            Outcome::Retry => info!(
                entity_id = %event.entity_id,
                entity_type = %event.entity_type,
                state = %event.from_state,
                state_count = event.state_count,
                error = event.error_detail.as_deref().unwrap_or_default(),
                duration_ms = event.duration_ms,
                "Entity will be retried"
            ),
            Outcome::Fatal | Outcome::Exhausted => warn!(
                entity_id = %event.entity_id,
                entity_type = %event.entity_type,
                from_state = %event.from_state,
                to_state = %event.to_state,
                outcome = %event.outcome,
                error = event.error_detail.as_deref().unwrap_or_default(),
                duration_ms = event.duration_ms,
                "Entity failed"
            ),
        }
    }
}
