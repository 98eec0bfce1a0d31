// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State transition registry: one flat table per entity type.
//!
//! A registry maps each non-terminal state to the handler that processes it,
//! and records the legal transition graph. Wiring mistakes (a handler that
//! declares an illegal next state, a handler on a terminal state, ...) are
//! rejected by [`RegistryBuilder::build`], so they never surface while the
//! engine runs.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = TransitionRegistry::builder("issuance")
//!     .initial(State::Submitted)
//!     .failed(State::Errored)
//!     .cancelled(State::Cancelled)
//!     .terminal(State::Delivered)
//!     .transition(State::Submitted, &[State::Approved])
//!     .transition(State::Approved, &[State::Delivered])
//!     .handler(State::Submitted, &[State::Approved], handler_fn(validate))
//!     .handler(State::Approved, &[State::Delivered], handler_fn(deliver))
//!     .build()?;
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{EntityState, Payload, StatefulEntity};
use crate::error::RegistryError;

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult<S, P> {
    /// Move to `next` with the updated payload.
    Success {
        /// Next state; must be one of the handler's declared next states.
        next: S,
        /// Payload to persist.
        payload: P,
    },
    /// Stay in the current state and try again after the backoff delay.
    Retry(String),
    /// Move to the entity type's failed state.
    Fatal(String),
}

impl<S, P> TransitionResult<S, P> {
    /// `Success` shorthand.
    pub fn success(next: S, payload: P) -> Self {
        Self::Success { next, payload }
    }

    /// `Retry` shorthand.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    /// `Fatal` shorthand.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// Processing function for one state.
///
/// Handlers never persist: they return a [`TransitionResult`] and the engine
/// writes it. An `Err` is treated like [`TransitionResult::Retry`].
#[async_trait]
pub trait StateHandler<S, P>: Send + Sync {
    /// Compute the outcome for `entity`.
    async fn handle(&self, entity: &StatefulEntity<S, P>) -> anyhow::Result<TransitionResult<S, P>>;
}

/// [`StateHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking the entity by value as a [`StateHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<S, P, F, Fut> StateHandler<S, P> for FnHandler<F>
where
    S: EntityState,
    P: Payload,
    F: Fn(StatefulEntity<S, P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TransitionResult<S, P>>> + Send,
{
    async fn handle(
        &self,
        entity: &StatefulEntity<S, P>,
    ) -> anyhow::Result<TransitionResult<S, P>> {
        (self.f)(entity.clone()).await
    }
}

struct Registration<S, P> {
    declared: HashSet<S>,
    handler: Arc<dyn StateHandler<S, P>>,
}

/// Immutable transition table for one entity type.
pub struct TransitionRegistry<S, P> {
    entity_type: String,
    initial: S,
    failed: S,
    cancelled: S,
    terminal: HashSet<S>,
    transitions: HashMap<S, HashSet<S>>,
    handlers: HashMap<S, Registration<S, P>>,
}

impl<S: EntityState, P: Payload> TransitionRegistry<S, P> {
    /// Start building the registry for `entity_type`.
    pub fn builder(entity_type: impl Into<String>) -> RegistryBuilder<S, P> {
        RegistryBuilder {
            entity_type: entity_type.into(),
            initial: None,
            failed: None,
            cancelled: None,
            terminal: Vec::new(),
            transitions: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Name used in logs, events and errors.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// State new entities are created in.
    pub fn initial_state(&self) -> S {
        self.initial
    }

    /// State `Fatal` outcomes and exhausted retries move to.
    pub fn failed_state(&self) -> S {
        self.failed
    }

    /// State external cancellation moves to.
    pub fn cancelled_state(&self) -> S {
        self.cancelled
    }

    /// Whether `state` is never polled again.
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// All terminal states, ordered by state code.
    pub fn terminal_states(&self) -> Vec<S> {
        sorted(self.terminal.iter().copied())
    }

    /// Legal next states out of `state`, ordered by state code.
    pub fn legal_next_states(&self, state: S) -> Vec<S> {
        sorted(self.transitions.get(&state).into_iter().flatten().copied())
    }

    /// Next states the handler for `state` declared at registration.
    pub fn declared_next_states(&self, state: S) -> Vec<S> {
        sorted(
            self.handlers
                .get(&state)
                .into_iter()
                .flat_map(|r| r.declared.iter().copied()),
        )
    }

    /// Whether the handler for `from` may return `Success(to)`.
    pub fn allows(&self, from: S, to: S) -> bool {
        self.handlers
            .get(&from)
            .is_some_and(|r| r.declared.contains(&to))
    }

    /// States with a registered handler, ordered by state code. These are the
    /// states the engine polls.
    pub fn handled_states(&self) -> Vec<S> {
        sorted(self.handlers.keys().copied())
    }

    /// Handler for `state`, if any.
    pub fn handler_for(&self, state: S) -> Option<Arc<dyn StateHandler<S, P>>> {
        self.handlers.get(&state).map(|r| Arc::clone(&r.handler))
    }
}

impl<S, P> std::fmt::Debug for TransitionRegistry<S, P>
where
    S: EntityState,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionRegistry")
            .field("entity_type", &self.entity_type)
            .field("initial", &self.initial)
            .field("failed", &self.failed)
            .field("cancelled", &self.cancelled)
            .field("terminal", &self.terminal)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`TransitionRegistry`].
pub struct RegistryBuilder<S, P> {
    entity_type: String,
    initial: Option<S>,
    failed: Option<S>,
    cancelled: Option<S>,
    terminal: Vec<S>,
    transitions: Vec<(S, Vec<S>)>,
    handlers: Vec<(S, Vec<S>, Arc<dyn StateHandler<S, P>>)>,
}

impl<S: EntityState, P: Payload> RegistryBuilder<S, P> {
    /// Set the initial state.
    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    /// Set the failed state. It is terminal.
    pub fn failed(mut self, state: S) -> Self {
        self.failed = Some(state);
        self
    }

    /// Set the cancelled state. It is terminal.
    pub fn cancelled(mut self, state: S) -> Self {
        self.cancelled = Some(state);
        self
    }

    /// Mark an additional terminal state (typically the success state).
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.push(state);
        self
    }

    /// Declare legal transitions out of `from`. Repeated calls accumulate.
    pub fn transition(mut self, from: S, to: &[S]) -> Self {
        self.transitions.push((from, to.to_vec()));
        self
    }

    /// Register the handler for `state` and the next states it may return.
    pub fn handler<H>(mut self, state: S, next: &[S], handler: H) -> Self
    where
        H: StateHandler<S, P> + 'static,
    {
        let handler: Arc<dyn StateHandler<S, P>> = Arc::new(handler);
        self.handlers.push((state, next.to_vec(), handler));
        self
    }

    /// Validate the wiring and freeze the registry.
    pub fn build(self) -> Result<TransitionRegistry<S, P>, RegistryError> {
        let entity_type = self.entity_type;
        let missing = |role: &'static str| RegistryError::MissingState {
            entity_type: entity_type.clone(),
            role,
        };
        let initial = self.initial.ok_or_else(|| missing("initial"))?;
        let failed = self.failed.ok_or_else(|| missing("failed"))?;
        let cancelled = self.cancelled.ok_or_else(|| missing("cancelled"))?;

        let mut terminal: HashSet<S> = self.terminal.into_iter().collect();
        terminal.insert(failed);
        terminal.insert(cancelled);

        let mut transitions: HashMap<S, HashSet<S>> = HashMap::new();
        for (from, to) in self.transitions {
            if let Some(target) = to.first()
                && terminal.contains(&from)
            {
                return Err(RegistryError::TransitionFromTerminal {
                    entity_type,
                    from: from.to_string(),
                    to: target.to_string(),
                });
            }
            transitions.entry(from).or_default().extend(to);
        }

        let mut handlers = HashMap::new();
        for (state, declared, handler) in self.handlers {
            if terminal.contains(&state) {
                return Err(RegistryError::HandlerOnTerminalState {
                    entity_type,
                    state: state.to_string(),
                });
            }
            if handlers.contains_key(&state) {
                return Err(RegistryError::DuplicateHandler {
                    entity_type,
                    state: state.to_string(),
                });
            }
            let legal = transitions.get(&state);
            if let Some(illegal) = declared
                .iter()
                .find(|next| !legal.is_some_and(|l| l.contains(next)))
            {
                return Err(RegistryError::IllegalDeclaredTransition {
                    entity_type,
                    from: state.to_string(),
                    to: illegal.to_string(),
                });
            }
            handlers.insert(
                state,
                Registration {
                    declared: declared.into_iter().collect(),
                    handler,
                },
            );
        }

        Ok(TransitionRegistry {
            entity_type,
            initial,
            failed,
            cancelled,
            terminal,
            transitions,
            handlers,
        })
    }
}

fn sorted<S: EntityState>(states: impl Iterator<Item = S>) -> Vec<S> {
    let mut states: Vec<S> = states.collect();
    states.sort_by_key(|s| s.code());
    states.dedup();
    states
}
