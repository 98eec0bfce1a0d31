// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process entity store.
//!
//! Shares the conditional-write semantics of the SQL backends; each operation
//! runs under one short critical section and never across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Criteria, EntityStore, SortOrder};
use crate::entity::{EntityState, Payload, StatefulEntity};
use crate::error::{Result, StoreError};
use crate::lease::{self, Lease};

/// Entity store backed by a `HashMap`. Wrap it in an `Arc` to share it
/// between engines.
pub struct InMemoryEntityStore<S, P> {
    entities: Mutex<HashMap<String, StatefulEntity<S, P>>>,
}

impl<S, P> Default for InMemoryEntityStore<S, P> {
    fn default() -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
        }
    }
}

impl<S, P> InMemoryEntityStore<S, P> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }

    fn entities(&self) -> MutexGuard<'_, HashMap<String, StatefulEntity<S, P>>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound {
        entity_id: id.to_string(),
    }
}

#[async_trait]
impl<S: EntityState, P: Payload> EntityStore<S, P> for InMemoryEntityStore<S, P> {
    async fn find(&self, id: &str) -> Result<Option<StatefulEntity<S, P>>> {
        Ok(self.entities().get(id).cloned())
    }

    async fn create(&self, entity: &StatefulEntity<S, P>) -> Result<()> {
        let mut entities = self.entities();
        if entities.contains_key(&entity.id) {
            return Err(StoreError::AlreadyExists {
                entity_id: entity.id.clone(),
            });
        }
        entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update(&self, entity: &StatefulEntity<S, P>) -> Result<StatefulEntity<S, P>> {
        let mut entities = self.entities();
        let stored = entities
            .get_mut(&entity.id)
            .ok_or_else(|| StoreError::Concurrency {
                entity_id: entity.id.clone(),
                expected_version: entity.version,
            })?;
        if stored.version != entity.version {
            return Err(StoreError::Concurrency {
                entity_id: entity.id.clone(),
                expected_version: entity.version,
            });
        }

        let mut updated = entity.clone();
        updated.version += 1;
        updated.created_at = stored.created_at;
        updated.cancel_requested = stored.cancel_requested;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn query(&self, criteria: &Criteria<S>) -> Result<Vec<StatefulEntity<S, P>>> {
        let mut matched: Vec<StatefulEntity<S, P>> = self
            .entities()
            .values()
            .filter(|e| criteria.matches(e))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            a.state_timestamp
                .cmp(&b.state_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        if criteria.order == SortOrder::Desc {
            matched.reverse();
        }

        Ok(matched
            .into_iter()
            .skip(criteria.offset)
            .take(criteria.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>> {
        let mut entities = self.entities();
        let stored = entities.get_mut(id).ok_or_else(|| not_found(id))?;
        if !lease::is_free(stored, now) {
            return Err(StoreError::Lease {
                entity_id: id.to_string(),
            });
        }
        stored.lease = Some(Lease::new(holder, now, duration));
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn renew_lease(
        &self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<StatefulEntity<S, P>> {
        let mut entities = self.entities();
        let stored = entities.get_mut(id).ok_or_else(|| not_found(id))?;
        let renewed = stored
            .lease
            .as_mut()
            .is_some_and(|l| l.renew(holder, now, duration));
        if !renewed {
            return Err(StoreError::Lease {
                entity_id: id.to_string(),
            });
        }
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn release_lease(&self, id: &str, holder: &str) -> Result<bool> {
        let mut entities = self.entities();
        match entities.get_mut(id) {
            Some(stored) if lease::is_leased_by(stored, holder) => {
                stored.lease = None;
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_leases_held_by(&self, holder: &str) -> Result<u64> {
        let mut released = 0;
        for stored in self.entities().values_mut() {
            if lease::is_leased_by(stored, holder) {
                stored.lease = None;
                stored.version += 1;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn cancel_if_free(
        &self,
        id: &str,
        cancelled: S,
        terminal: &[S],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entities = self.entities();
        let stored = entities.get_mut(id).ok_or_else(|| not_found(id))?;
        if terminal.contains(&stored.state) || !lease::is_free(stored, now) {
            return Ok(false);
        }
        stored.transition_to(cancelled, now);
        stored.lease = None;
        stored.version += 1;
        Ok(true)
    }

    async fn request_cancel(&self, id: &str, terminal: &[S]) -> Result<bool> {
        let mut entities = self.entities();
        let stored = entities.get_mut(id).ok_or_else(|| not_found(id))?;
        if terminal.contains(&stored.state) {
            return Ok(false);
        }
        stored.cancel_requested = true;
        Ok(true)
    }
}
