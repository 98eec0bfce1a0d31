// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger API: the write paths into the store other than the engine itself.
//!
//! Protocol and REST layers create entities and request cancellation through
//! [`EntityService`]; they never change an entity's state directly.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::entity::{EntityState, Payload, StatefulEntity, TraceContext};
use crate::error::{ServiceError, StoreError};
use crate::persistence::{Criteria, EntityStore};
use crate::registry::TransitionRegistry;

/// Result of [`EntityService::cancel_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The entity was free and is now cancelled.
    Cancelled,
    /// The entity is being processed; the engine cancels it once its lease holder
    /// reports back.
    Pending,
}

/// Creates, cancels and looks up entities of one type.
pub struct EntityService<S, P> {
    store: Arc<dyn EntityStore<S, P>>,
    registry: Arc<TransitionRegistry<S, P>>,
    clock: Arc<dyn Clock>,
}

impl<S, P> Clone for EntityService<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: EntityState, P: Payload> EntityService<S, P> {
    /// Create a service.
    pub fn new(
        store: Arc<dyn EntityStore<S, P>>,
        registry: Arc<TransitionRegistry<S, P>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Create an entity in the initial state under a fresh UUID.
    pub async fn create_entity(
        &self,
        payload: P,
        trace_context: TraceContext,
    ) -> Result<String, ServiceError> {
        let id = Uuid::new_v4().to_string();
        self.create_entity_with_id(id.clone(), payload, trace_context)
            .await?;
        Ok(id)
    }

    /// Create an entity in the initial state under a caller-chosen id
    /// (for example a protocol-level process id).
    pub async fn create_entity_with_id(
        &self,
        id: impl Into<String>,
        payload: P,
        trace_context: TraceContext,
    ) -> Result<StatefulEntity<S, P>, ServiceError> {
        let entity = StatefulEntity::new(
            id,
            self.registry.initial_state(),
            payload,
            self.clock.now(),
        )
        .with_trace_context(trace_context);
        self.store.create(&entity).await?;

        info!(
            entity_id = %entity.id,
            entity_type = %self.registry.entity_type(),
            state = %entity.state,
            "Entity created"
        );
        Ok(entity)
    }

    /// Cancel an entity.
    ///
    /// A free entity is moved to the cancelled state at once. A leased entity
    /// gets the pending flag, which the engine honors before its next transition.
    pub async fn cancel_entity(&self, id: &str) -> Result<CancelOutcome, ServiceError> {
        let terminal = self.registry.terminal_states();
        let cancelled = self
            .store
            .cancel_if_free(id, self.registry.cancelled_state(), &terminal, self.clock.now())
            .await
            .map_err(not_found_or_store)?;
        if cancelled {
            info!(
                entity_id = %id,
                entity_type = %self.registry.entity_type(),
                "Entity cancelled"
            );
            return Ok(CancelOutcome::Cancelled);
        }

        // a terminal persist may land between the two store calls
        let flagged = self
            .store
            .request_cancel(id, &terminal)
            .await
            .map_err(not_found_or_store)?;
        if !flagged {
            let entity = self
                .store
                .find(id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
            return Err(ServiceError::AlreadyTerminal {
                entity_id: id.to_string(),
                state: entity.state.to_string(),
            });
        }
        debug!(
            entity_id = %id,
            entity_type = %self.registry.entity_type(),
            "Entity is leased, cancellation queued"
        );
        Ok(CancelOutcome::Pending)
    }

    /// Entities currently in `state`, oldest first.
    pub async fn query_by_state(
        &self,
        state: S,
    ) -> Result<Vec<StatefulEntity<S, P>>, ServiceError> {
        Ok(self.store.query(&Criteria::new().in_states(&[state])).await?)
    }

    /// Look up an entity.
    pub async fn find(&self, id: &str) -> Result<Option<StatefulEntity<S, P>>, ServiceError> {
        Ok(self.store.find(id).await?)
    }

    /// List entities matching `criteria`.
    pub async fn query(
        &self,
        criteria: &Criteria<S>,
    ) -> Result<Vec<StatefulEntity<S, P>>, ServiceError> {
        Ok(self.store.query(criteria).await?)
    }

    /// Entity type served.
    pub fn entity_type(&self) -> &str {
        self.registry.entity_type()
    }
}

fn not_found_or_store(e: StoreError) -> ServiceError {
    match e {
        StoreError::NotFound { entity_id } => ServiceError::NotFound(entity_id),
        other => ServiceError::Store(other),
    }
}
