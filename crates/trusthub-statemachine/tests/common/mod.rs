// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trusthub-statemachine integration tests.
//!
//! Provides a small credential-like state machine, scripted handlers and a
//! recording listener.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use trusthub_statemachine::{
    EngineConfig, EntityState, EntityStore, InMemoryEntityStore, ManualClock, ProcessEngine,
    RetryPolicy, StateHandler, StatefulEntity, TransitionEvent, TransitionListener,
    TransitionRegistry, TransitionResult,
};

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// States of the test process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Initial,
    Approved,
    Issued,
    Failed,
    Cancelled,
}

impl EntityState for Step {
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

impl fmt::Display for Step {
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

/// Payload of the test process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub subject: String,
    pub approvals: u32,
}

impl Claim {
    pub fn for_subject(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            approvals: 0,
        }
    }
}

/// What a scripted handler does on one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Advance(Step),
    Retry(&'static str),
    Fatal(&'static str),
    Error(&'static str),
    Panic(&'static str),
}

/// Handler that replays a script, then repeats its fallback reply.
pub struct Scripted {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn always(reply: Reply) -> Self {
        Self::new(Vec::new(), reply)
    }

    pub fn new(script: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter, readable after the handler moved into a registry.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl StateHandler<Step, Claim> for Scripted {
    async fn handle(
        &self,
        entity: &StatefulEntity<Step, Claim>,
    ) -> anyhow::Result<TransitionResult<Step, Claim>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Advance(next) => {
                let mut payload = entity.payload.clone();
                payload.approvals += 1;
                Ok(TransitionResult::success(next, payload))
            }
            Reply::Retry(reason) => Ok(TransitionResult::retry(reason)),
            Reply::Fatal(reason) => Ok(TransitionResult::fatal(reason)),
            Reply::Error(reason) => Err(anyhow::anyhow!(reason)),
            Reply::Panic(message) => panic!("{}", message),
        }
    }
}

/// Handler that records which entities are being handled at the same time.
pub struct Exclusive {
    pub active: Arc<Mutex<HashSet<String>>>,
    pub overlaps: Arc<AtomicUsize>,
    pub handled: Arc<Mutex<Vec<String>>>,
    pub max_in_flight: Arc<AtomicUsize>,
    pub work: Duration,
    pub next: Step,
}

impl Exclusive {
    pub fn new(next: Step, work: Duration) -> Self {
        Self {
            active: Arc::default(),
            overlaps: Arc::default(),
            handled: Arc::default(),
            max_in_flight: Arc::default(),
            work,
            next,
        }
    }

    /// A handler sharing this one's counters, for a second engine or state.
    pub fn sharing(&self, next: Step) -> Self {
        Self {
            active: Arc::clone(&self.active),
            overlaps: Arc::clone(&self.overlaps),
            handled: Arc::clone(&self.handled),
            max_in_flight: Arc::clone(&self.max_in_flight),
            work: self.work,
            next,
        }
    }
}

#[async_trait]
impl StateHandler<Step, Claim> for Exclusive {
    async fn handle(
        &self,
        entity: &StatefulEntity<Step, Claim>,
    ) -> anyhow::Result<TransitionResult<Step, Claim>> {
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(entity.id.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.max_in_flight.fetch_max(active.len(), Ordering::SeqCst);
        }

        tokio::time::sleep(self.work).await;

        self.active.lock().unwrap().remove(&entity.id);
        self.handled.lock().unwrap().push(entity.id.clone());
        Ok(TransitionResult::success(self.next, entity.payload.clone()))
    }
}

/// Listener keeping every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TransitionListener for RecordingListener {
    fn on_transition(&self, event: &TransitionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// INITIAL -> APPROVED -> ISSUED, with FAILED and CANCELLED as terminal sinks.
pub fn registry<A, B>(initial: A, approved: B) -> Arc<TransitionRegistry<Step, Claim>>
where
    A: StateHandler<Step, Claim> + 'static,
    B: StateHandler<Step, Claim> + 'static,
{
    Arc::new(
        TransitionRegistry::builder("test_process")
            .initial(Step::Initial)
            .failed(Step::Failed)
            .cancelled(Step::Cancelled)
            .terminal(Step::Issued)
            .transition(Step::Initial, &[Step::Approved])
            .transition(Step::Approved, &[Step::Issued])
            .handler(Step::Initial, &[Step::Approved], initial)
            .handler(Step::Approved, &[Step::Issued], approved)
            .build()
            .expect("valid registry"),
    )
}

/// Single-hop variant: INITIAL -> ISSUED.
pub fn single_hop_registry<H>(entity_type: &str, handler: H) -> Arc<TransitionRegistry<Step, Claim>>
where
    H: StateHandler<Step, Claim> + 'static,
{
    Arc::new(
        TransitionRegistry::builder(entity_type)
            .initial(Step::Initial)
            .failed(Step::Failed)
            .cancelled(Step::Cancelled)
            .terminal(Step::Issued)
            .transition(Step::Initial, &[Step::Issued])
            .handler(Step::Initial, &[Step::Issued], handler)
            .build()
            .expect("valid registry"),
    )
}

/// Configuration with entities due immediately and a fast poll loop.
pub fn eager_config() -> EngineConfig {
    EngineConfig {
        batch_size: 10,
        poll_interval: Duration::from_millis(5),
        lease_duration: Duration::from_secs(30),
        retry: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
        concurrency: 2,
    }
}

/// An engine over an in-memory store, driven by a manual clock.
pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<InMemoryEntityStore<Step, Claim>>,
    pub listener: Arc<RecordingListener>,
    pub engine: ProcessEngine<Step, Claim>,
}

impl Harness {
    pub fn new(registry: Arc<TransitionRegistry<Step, Claim>>, config: EngineConfig) -> Self {
        Self::with_store(Arc::new(InMemoryEntityStore::new()), registry, config)
    }

    /// Harness over a store the caller also hands to its handlers.
    pub fn with_store(
        store: Arc<InMemoryEntityStore<Step, Claim>>,
        registry: Arc<TransitionRegistry<Step, Claim>>,
        config: EngineConfig,
    ) -> Self {
        init_tracing();
        let clock = ManualClock::starting_now();
        let listener = Arc::new(RecordingListener::default());
        let engine = ProcessEngine::<Step, Claim>::builder()
            .store(store.clone())
            .registry(registry)
            .config(config)
            .clock(Arc::new(clock.clone()))
            .holder_id("engine-under-test")
            .listener(listener.clone())
            .build()
            .expect("engine");

        Self {
            clock,
            store,
            listener,
            engine,
        }
    }

    pub async fn create(&self, subject: &str) -> String {
        self.engine
            .service()
            .create_entity(Claim::for_subject(subject), Default::default())
            .await
            .expect("create entity")
    }

    pub async fn entity(&self, id: &str) -> StatefulEntity<Step, Claim> {
        self.store
            .find(id)
            .await
            .expect("find")
            .expect("entity exists")
    }

    /// Move the clock to the moment the entity becomes due.
    pub async fn advance_until_due(&self, id: &str) {
        let entity = self.entity(id).await;
        self.clock
            .set(self.engine.config().retry.next_due_at(&entity));
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
