// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine supervisor: runs one process engine per entity type.
//!
//! ```rust,ignore
//! let supervisor = EngineSupervisor::builder()
//!     .engine(Arc::new(issuance_engine))
//!     .engine(Arc::new(holder_engine))
//!     .shutdown_timeout(Duration::from_secs(30))
//!     .build()?
//!     .start();
//!
//! // ... serve requests ...
//!
//! let report = supervisor.shutdown().await;
//! ```
//!
//! Shutdown is cooperative: each engine finishes its in-flight batch, releases
//! its leases and exits. Engines still running when the timeout elapses are
//! aborted; their leases lapse and surviving instances pick the entities up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::ProcessEngine;
use crate::entity::{EntityState, Payload};

/// Default time [`RunningSupervisor::shutdown`] waits for engines to stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler concurrency budget shared by several engines.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// A pool admitting `size` concurrent handlers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }
}

/// A poll loop the supervisor can run, independent of its entity type.
#[async_trait]
pub trait ManagedEngine: Send + Sync + 'static {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Run until `shutdown` turns true.
    async fn run(&self, shutdown: watch::Receiver<bool>);
}

#[async_trait]
impl<S: EntityState, P: Payload> ManagedEngine for ProcessEngine<S, P> {
    fn name(&self) -> &str {
        self.entity_type()
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) {
        ProcessEngine::run(self, shutdown).await
    }
}

/// Supervisor configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// No engine was registered.
    #[error("at least one engine is required")]
    NoEngines,
    /// Two engines share a name.
    #[error("engine '{0}' registered twice")]
    DuplicateEngine(String),
}

/// Supervisor that has not been started yet.
pub struct EngineSupervisor {
    engines: Vec<Arc<dyn ManagedEngine>>,
    shutdown_timeout: Duration,
}

/// Builder for [`EngineSupervisor`].
#[derive(Default)]
pub struct EngineSupervisorBuilder {
    engines: Vec<Arc<dyn ManagedEngine>>,
    shutdown_timeout: Option<Duration>,
}

impl EngineSupervisorBuilder {
    /// Add an engine.
    pub fn engine(mut self, engine: Arc<dyn ManagedEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// How long shutdown waits before aborting engines (default: 30s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<EngineSupervisor, SupervisorError> {
        if self.engines.is_empty() {
            return Err(SupervisorError::NoEngines);
        }
        let mut names = HashSet::new();
        for engine in &self.engines {
            if !names.insert(engine.name().to_string()) {
                return Err(SupervisorError::DuplicateEngine(engine.name().to_string()));
            }
        }

        Ok(EngineSupervisor {
            engines: self.engines,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        })
    }
}

impl EngineSupervisor {
    /// Start building a supervisor.
    pub fn builder() -> EngineSupervisorBuilder {
        EngineSupervisorBuilder::default()
    }

    /// Spawn one task per engine. Must be called inside a tokio runtime.
    pub fn start(self) -> RunningSupervisor {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = self
            .engines
            .into_iter()
            .map(|engine| {
                let name = engine.name().to_string();
                let shutdown = shutdown_rx.clone();
                let handle = tokio::spawn(async move { engine.run(shutdown).await });
                (name, handle)
            })
            .collect::<Vec<_>>();

        info!(
            engines = ?tasks.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            "Engine supervisor started"
        );

        RunningSupervisor {
            shutdown_tx,
            tasks,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// How each engine ended during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Engines that exited cooperatively.
    pub stopped: Vec<String>,
    /// Engines aborted after the timeout.
    pub aborted: Vec<String>,
    /// Engines whose task panicked.
    pub panicked: Vec<String>,
}

impl ShutdownReport {
    /// Whether every engine exited cooperatively.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty() && self.panicked.is_empty()
    }
}

/// Handle to running engines.
pub struct RunningSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl RunningSupervisor {
    /// Whether any engine task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Names of the supervised engines.
    pub fn engine_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Signal every engine to stop and wait for them, up to the shutdown timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Engine supervisor shutting down"
        );
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut report = ShutdownReport::default();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.stopped.push(name),
                Ok(Err(e)) => {
                    error!(engine = %name, error = %e, "Engine task failed");
                    report.panicked.push(name);
                }
                Err(_) => {
                    warn!(engine = %name, "Engine did not stop in time, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            aborted = report.aborted.len(),
            panicked = report.panicked.len(),
            "Engine supervisor stopped"
        );
        report
    }
}
