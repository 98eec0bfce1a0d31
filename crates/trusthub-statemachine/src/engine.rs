// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The process engine: the poll loop that drives one entity type.
//!
//! Each cycle:
//! 1. Select up to `batch_size` due, unleased entities in a handled state,
//!    oldest `state_timestamp` first.
//! 2. Lease each one. Losing the race to another worker is not an error.
//! 3. Run the handler for the entity's state (or cancel it if a cancellation
//!    is pending).
//! 4. Persist the outcome with the lease cleared. A version conflict means
//!    another worker's view wins and the entity is abandoned for this cycle.
//!
//! Nothing raised inside a handler escapes the engine: errors and panics
//! become `Retry`, bounded by the retry budget.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::entity::{EntityState, Payload, StatefulEntity};
use crate::error::StoreError;
use crate::persistence::{Criteria, EntityStore};
use crate::registry::{TransitionRegistry, TransitionResult};
use crate::service::EntityService;
use crate::supervisor::WorkerPool;
use crate::telemetry::{Outcome, TracingListener, TransitionEvent, TransitionListener};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entities returned by the selection query.
    pub selected: usize,
    /// Entities this engine leased.
    pub leased: usize,
    /// Entities another worker leased first.
    pub lease_conflicts: usize,
    /// Entities moved to their next state.
    pub succeeded: usize,
    /// Entities left in their state for another attempt.
    pub retried: usize,
    /// Entities moved to the failed state.
    pub failed: usize,
    /// Entities moved to the cancelled state.
    pub cancelled: usize,
    /// Leased entities whose outcome could not be persisted.
    pub abandoned: usize,
}

impl CycleReport {
    fn record(&mut self, processed: Processed) {
        match processed {
            Processed::LeaseConflict => self.lease_conflicts += 1,
            Processed::LeaseFailed => {}
            Processed::Abandoned => {
                self.leased += 1;
                self.abandoned += 1;
            }
            Processed::Persisted(outcome) => {
                self.leased += 1;
                match outcome {
                    Outcome::Success => self.succeeded += 1,
                    Outcome::Retry => self.retried += 1,
                    Outcome::Fatal | Outcome::Exhausted => self.failed += 1,
                    Outcome::Cancelled => self.cancelled += 1,
                }
            }
        }
    }
}

enum Processed {
    LeaseConflict,
    LeaseFailed,
    Abandoned,
    Persisted(Outcome),
}

/// Drives the entities of one type through their transition graph.
pub struct ProcessEngine<S, P> {
    store: Arc<dyn EntityStore<S, P>>,
    registry: Arc<TransitionRegistry<S, P>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    holder_id: String,
    listener: Arc<dyn TransitionListener>,
    worker_pool: Option<WorkerPool>,
}

impl<S: EntityState, P: Payload> ProcessEngine<S, P> {
    /// Start building an engine.
    pub fn builder() -> ProcessEngineBuilder<S, P> {
        ProcessEngineBuilder::new()
    }

    /// Entity type this engine drives.
    pub fn entity_type(&self) -> &str {
        self.registry.entity_type()
    }

    /// Lease holder id of this engine.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transition registry.
    pub fn registry(&self) -> &Arc<TransitionRegistry<S, P>> {
        &self.registry
    }

    /// Trigger API over the same store, registry and clock.
    pub fn service(&self) -> EntityService<S, P> {
        EntityService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        )
    }

    /// Run poll cycles until `shutdown` turns true (or its sender is dropped),
    /// then release every lease this engine still holds.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            entity_type = %self.entity_type(),
            holder_id = %self.holder_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_duration_ms = self.config.lease_duration.as_millis() as u64,
            "Process engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(report) if report.selected > 0 => debug!(
                    entity_type = %self.entity_type(),
                    selected = report.selected,
                    leased = report.leased,
                    succeeded = report.succeeded,
                    retried = report.retried,
                    failed = report.failed,
                    "Poll cycle completed"
                ),
                Ok(_) => {}
                Err(e) => error!(
                    entity_type = %self.entity_type(),
                    error = %e,
                    "Poll cycle failed"
                ),
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            entity_type = %self.entity_type(),
                            "Process engine received shutdown signal"
                        );
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        match self.store.release_leases_held_by(&self.holder_id).await {
            Ok(released) => info!(
                entity_type = %self.entity_type(),
                released,
                "Process engine stopped"
            ),
            Err(e) => warn!(
                entity_type = %self.entity_type(),
                error = %e,
                "Process engine stopped without releasing its leases; they will expire"
            ),
        }
    }

    /// Run one poll cycle.
    ///
    /// Returns an error only when the selection query fails; failures of
    /// individual entities are counted in the report.
    pub async fn poll_once(&self) -> std::result::Result<CycleReport, StoreError> {
        let now = self.clock.now();
        let criteria = Criteria::new()
            .in_states(&self.registry.handled_states())
            .not_leased_at(now)
            .due(self.config.retry.due_filter(now))
            .limit(self.config.batch_size);

        let candidates = self.store.query(&criteria).await?;
        let mut report = CycleReport {
            selected: candidates.len(),
            ..CycleReport::default()
        };
        if candidates.is_empty() {
            debug!(entity_type = %self.entity_type(), "No due entities");
            return Ok(report);
        }

        let processed: Vec<Processed> = stream::iter(candidates)
            .map(|candidate| self.process(candidate))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for p in processed {
            report.record(p);
        }

        Ok(report)
    }

    async fn process(&self, candidate: StatefulEntity<S, P>) -> Processed {
        let _permit = match &self.worker_pool {
            Some(pool) => pool.acquire().await,
            None => None,
        };

        let span = info_span!(
            "process_entity",
            entity_type = %self.entity_type(),
            entity_id = %candidate.id,
            state = %candidate.state,
            state_count = candidate.state_count,
            trace_context = ?candidate.trace_context,
        );
        self.process_leased(candidate).instrument(span).await
    }

    async fn process_leased(&self, candidate: StatefulEntity<S, P>) -> Processed {
        let started = Instant::now();
        let entity = match self
            .store
            .lease(
                &candidate.id,
                &self.holder_id,
                self.config.lease_duration,
                self.clock.now(),
            )
            .await
        {
            Ok(entity) => entity,
            Err(e) if e.is_conflict() => {
                debug!("Entity leased by another worker, skipping");
                return Processed::LeaseConflict;
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Failed to lease entity");
                return Processed::LeaseFailed;
            }
        };

        // Another worker or a direct cancellation wrote between selection and lease.
        if entity.version != candidate.version + 1 {
            debug!(
                expected_version = candidate.version + 1,
                version = entity.version,
                "Entity changed since selection, releasing"
            );
            self.release(&entity).await;
            return Processed::Abandoned;
        }

        if entity.cancel_requested {
            let mut next = entity.clone();
            next.transition_to(self.registry.cancelled_state(), self.clock.now());
            return self
                .persist(&entity, next, Outcome::Cancelled, started)
                .await;
        }

        let Some(handler) = self.registry.handler_for(entity.state) else {
            error!("No handler registered for selected state");
            self.release(&entity).await;
            return Processed::Abandoned;
        };

        let result = match AssertUnwindSafe(handler.handle(&entity))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => TransitionResult::Retry(format!("{e:#}")),
            Err(panic) => TransitionResult::Retry(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            )),
        };

        let (next, outcome) = self.apply(&entity, result).await;
        self.persist(&entity, next, outcome, started).await
    }

    /// Fold a handler result into the entity to persist.
    async fn apply(
        &self,
        entity: &StatefulEntity<S, P>,
        result: TransitionResult<S, P>,
    ) -> (StatefulEntity<S, P>, Outcome) {
        let now = self.clock.now();
        let failed = self.registry.failed_state();
        let mut next = entity.clone();

        match result {
            TransitionResult::Success { next: to, payload } => {
                if !self.registry.allows(entity.state, to) {
                    error!(
                        to_state = %to,
                        declared = ?self.registry.declared_next_states(entity.state),
                        "Handler returned an undeclared next state"
                    );
                    next.fail(
                        failed,
                        format!("illegal transition from {} to {}", entity.state, to),
                        now,
                    );
                    return (next, Outcome::Fatal);
                }
                if self.cancel_pending(&entity.id).await {
                    next.transition_to(self.registry.cancelled_state(), now);
                    return (next, Outcome::Cancelled);
                }
                next.payload = payload;
                next.transition_to(to, now);
                (next, Outcome::Success)
            }
            TransitionResult::Retry(reason) => {
                next.record_retry(reason, now);
                if self.config.retry.is_exhausted(&next) {
                    let reason = format!(
                        "retries exhausted after {} attempts: {}",
                        next.state_count,
                        next.error_detail.as_deref().unwrap_or_default()
                    );
                    next.fail(failed, reason, now);
                    (next, Outcome::Exhausted)
                } else {
                    (next, Outcome::Retry)
                }
            }
            TransitionResult::Fatal(reason) => {
                next.fail(failed, reason, now);
                (next, Outcome::Fatal)
            }
        }
    }

    /// Re-read the pending-cancellation flag.
    async fn cancel_pending(&self, id: &str) -> bool {
        match self.store.find(id).await {
            Ok(found) => found.is_some_and(|e| e.cancel_requested),
            Err(e) => {
                warn!(error = %e, "Failed to re-read cancellation flag");
                false
            }
        }
    }

    async fn persist(
        &self,
        leased: &StatefulEntity<S, P>,
        mut next: StatefulEntity<S, P>,
        outcome: Outcome,
        started: Instant,
    ) -> Processed {
        next.lease = None;
        match self.store.update(&next).await {
            Ok(saved) => {
                self.listener.on_transition(&TransitionEvent {
                    entity_id: saved.id.clone(),
                    entity_type: self.entity_type().to_string(),
                    from_state: leased.state.to_string(),
                    to_state: saved.state.to_string(),
                    outcome,
                    state_count: saved.state_count,
                    error_detail: saved.error_detail.clone(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
                Processed::Persisted(outcome)
            }
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Entity modified concurrently, abandoning");
                Processed::Abandoned
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Failed to persist outcome");
                self.release(leased).await;
                Processed::Abandoned
            }
        }
    }

    async fn release(&self, entity: &StatefulEntity<S, P>) {
        if let Err(e) = self.store.release_lease(&entity.id, &self.holder_id).await {
            debug!(error = %e, "Failed to release lease; it will expire");
        }
    }
}

impl<S, P> std::fmt::Debug for ProcessEngine<S, P>
where
    S: EntityState,
    P: Payload,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("entity_type", &self.registry.entity_type())
            .field("holder_id", &self.holder_id)
            .field("config", &self.config)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Builder for [`ProcessEngine`].
pub struct ProcessEngineBuilder<S, P> {
    store: Option<Arc<dyn EntityStore<S, P>>>,
    registry: Option<Arc<TransitionRegistry<S, P>>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    holder_id: Option<String>,
    listener: Arc<dyn TransitionListener>,
    worker_pool: Option<WorkerPool>,
}

impl<S: EntityState, P: Payload> ProcessEngineBuilder<S, P> {
    fn new() -> Self {
        Self {
            store: None,
            registry: None,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            holder_id: None,
            listener: Arc::new(TracingListener),
            worker_pool: None,
        }
    }

    /// Set the entity store (required).
    pub fn store(mut self, store: Arc<dyn EntityStore<S, P>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the transition registry (required).
    pub fn registry(mut self, registry: Arc<TransitionRegistry<S, P>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the engine configuration (default: [`EngineConfig::default`]).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the clock (default: [`SystemClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the lease holder id (default: a fresh UUID v4).
    pub fn holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    /// Set the transition listener (default: [`TracingListener`]).
    pub fn listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Gate handler execution on a pool shared with other engines.
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<ProcessEngine<S, P>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        self.config.validate()?;

        Ok(ProcessEngine {
            store,
            registry,
            config: self.config,
            clock: self.clock,
            holder_id: self
                .holder_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            listener: self.listener,
            worker_pool: self.worker_pool,
        })
    }
}
