// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable hub running the three process engines.
//!
//! ```rust,ignore
//! let config = TrustHubConfig::from_env()?;
//! let stores = HubStores::connect(config.database_url.as_deref()).await?;
//!
//! let hub = TrustHub::builder()
//!     .stores(stores)
//!     .issuance(issuance_collaborators)
//!     .holder(holder_collaborators)
//!     .status_list(status_list_collaborators)
//!     .config(config)
//!     .build()?
//!     .start();
//!
//! let id = hub.issuance().create_entity(process, TraceContext::new()).await?;
//!
//! hub.shutdown().await;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;
use trusthub_statemachine::{
    Clock, EngineSupervisor, EntityService, EntityStore, InMemoryEntityStore, PostgresEntityStore,
    ProcessEngine, RunningSupervisor, ShutdownReport, SqliteEntityStore, SystemClock,
    TracingListener, TransitionListener, WorkerPool,
};

use crate::config::TrustHubConfig;
use crate::holder::{self, HolderCollaborators, HolderCredentialRequest, HolderRequestState};
use crate::issuance::{self, IssuanceCollaborators, IssuanceProcess, IssuanceState};
use crate::migrations;
use crate::status_list::{
    self, StatusListCollaborators, StatusListPublication, StatusListState,
};

/// The entity stores of the three process types.
#[derive(Clone)]
pub struct HubStores {
    /// Issuance processes.
    pub issuance: Arc<dyn EntityStore<IssuanceState, IssuanceProcess>>,
    /// Holder credential requests.
    pub holder_requests: Arc<dyn EntityStore<HolderRequestState, HolderCredentialRequest>>,
    /// Status-list publication jobs.
    pub status_lists: Arc<dyn EntityStore<StatusListState, StatusListPublication>>,
}

impl HubStores {
    /// Volatile stores for a single process.
    pub fn in_memory() -> Self {
        Self {
            issuance: Arc::new(InMemoryEntityStore::new()),
            holder_requests: Arc::new(InMemoryEntityStore::new()),
            status_lists: Arc::new(InMemoryEntityStore::new()),
        }
    }

    /// SQLite stores sharing `pool`, after running the pending migrations.
    pub async fn sqlite(pool: SqlitePool) -> Result<Self> {
        migrations::run_sqlite(&pool)
            .await
            .context("Failed to run SQLite migrations")?;
        let issuance = SqliteEntityStore::new(pool.clone(), issuance::TABLE)?;
        let holder_requests = SqliteEntityStore::new(pool.clone(), holder::TABLE)?;
        let status_lists = SqliteEntityStore::new(pool, status_list::TABLE)?;

        Ok(Self {
            issuance: Arc::new(issuance),
            holder_requests: Arc::new(holder_requests),
            status_lists: Arc::new(status_lists),
        })
    }

    /// PostgreSQL stores sharing `pool`, after running the pending migrations.
    pub async fn postgres(pool: PgPool) -> Result<Self> {
        migrations::run_postgres(&pool)
            .await
            .context("Failed to run PostgreSQL migrations")?;
        let issuance = PostgresEntityStore::new(pool.clone(), issuance::TABLE)?;
        let holder_requests = PostgresEntityStore::new(pool.clone(), holder::TABLE)?;
        let status_lists = PostgresEntityStore::new(pool, status_list::TABLE)?;

        Ok(Self {
            issuance: Arc::new(issuance),
            holder_requests: Arc::new(holder_requests),
            status_lists: Arc::new(status_lists),
        })
    }

    /// Stores for a database URL: `postgres://`, `sqlite:`, or in-memory for `None`.
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        let Some(url) = database_url else {
            info!("No database configured, keeping entities in memory");
            return Ok(Self::in_memory());
        };

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!("Using PostgreSQL entity stores");
            Self::postgres(pool).await
        } else if url.starts_with("sqlite:") {
            // every connection to an in-memory database sees its own database
            let max_connections = if url.contains(":memory:") { 1 } else { 5 };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .context("Failed to open SQLite database")?;
            info!("Using SQLite entity stores");
            Self::sqlite(pool).await
        } else {
            anyhow::bail!("Unsupported database URL scheme (expected postgres:// or sqlite:)")
        }
    }
}

/// Builder for [`TrustHub`].
#[derive(Default)]
pub struct TrustHubBuilder {
    stores: Option<HubStores>,
    issuance: Option<IssuanceCollaborators>,
    holder: Option<HolderCollaborators>,
    status_list: Option<StatusListCollaborators>,
    config: Option<TrustHubConfig>,
    clock: Option<Arc<dyn Clock>>,
    listener: Option<Arc<dyn TransitionListener>>,
}

impl TrustHubBuilder {
    /// Entity stores (required).
    pub fn stores(mut self, stores: HubStores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Issuer-side collaborators (required).
    pub fn issuance(mut self, collaborators: IssuanceCollaborators) -> Self {
        self.issuance = Some(collaborators);
        self
    }

    /// Holder-side collaborators (required).
    pub fn holder(mut self, collaborators: HolderCollaborators) -> Self {
        self.holder = Some(collaborators);
        self
    }

    /// Status-list collaborators (required).
    pub fn status_list(mut self, collaborators: StatusListCollaborators) -> Self {
        self.status_list = Some(collaborators);
        self
    }

    /// Hub configuration (default: [`TrustHubConfig::default`]).
    pub fn config(mut self, config: TrustHubConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Clock shared by engines, services and handlers (default: [`SystemClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Transition listener shared by the engines (default: [`TracingListener`]).
    pub fn listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the registries, engines and supervisor.
    pub fn build(self) -> Result<TrustHubConfigured> {
        let stores = self
            .stores
            .ok_or_else(|| anyhow::anyhow!("stores are required"))?;
        let issuance_collaborators = self
            .issuance
            .ok_or_else(|| anyhow::anyhow!("issuance collaborators are required"))?;
        let holder_collaborators = self
            .holder
            .ok_or_else(|| anyhow::anyhow!("holder collaborators are required"))?;
        let status_list_collaborators = self
            .status_list
            .ok_or_else(|| anyhow::anyhow!("status list collaborators are required"))?;
        let config = self.config.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let listener = self.listener.unwrap_or_else(|| Arc::new(TracingListener));
        let pool = WorkerPool::new(config.max_concurrent_handlers);

        let issuance_engine = ProcessEngine::builder()
            .store(stores.issuance)
            .registry(Arc::new(issuance::registry(issuance_collaborators)?))
            .config(config.issuance.clone())
            .clock(Arc::clone(&clock))
            .holder_id(&config.instance_id)
            .listener(Arc::clone(&listener))
            .worker_pool(pool.clone())
            .build()?;

        let holder_engine = ProcessEngine::builder()
            .store(stores.holder_requests)
            .registry(Arc::new(holder::registry(
                holder_collaborators,
                Arc::clone(&clock),
                config.holder_status_timeout,
            )?))
            .config(config.holder_request.clone())
            .clock(Arc::clone(&clock))
            .holder_id(&config.instance_id)
            .listener(Arc::clone(&listener))
            .worker_pool(pool.clone())
            .build()?;

        let status_list_engine = ProcessEngine::builder()
            .store(stores.status_lists)
            .registry(Arc::new(status_list::registry(status_list_collaborators)?))
            .config(config.status_list.clone())
            .clock(clock)
            .holder_id(&config.instance_id)
            .listener(listener)
            .worker_pool(pool)
            .build()?;

        let issuance_engine = Arc::new(issuance_engine);
        let holder_engine = Arc::new(holder_engine);
        let status_list_engine = Arc::new(status_list_engine);

        let supervisor = EngineSupervisor::builder()
            .engine(issuance_engine.clone())
            .engine(holder_engine.clone())
            .engine(status_list_engine.clone())
            .shutdown_timeout(config.shutdown_timeout)
            .build()?;

        Ok(TrustHubConfigured {
            instance_id: config.instance_id,
            issuance: issuance_engine.service(),
            holder_requests: holder_engine.service(),
            status_lists: status_list_engine.service(),
            supervisor,
        })
    }
}

/// A hub that is wired but not running yet.
pub struct TrustHubConfigured {
    instance_id: String,
    issuance: EntityService<IssuanceState, IssuanceProcess>,
    holder_requests: EntityService<HolderRequestState, HolderCredentialRequest>,
    status_lists: EntityService<StatusListState, StatusListPublication>,
    supervisor: EngineSupervisor,
}

impl TrustHubConfigured {
    /// Start the engines. Must be called inside a tokio runtime.
    pub fn start(self) -> TrustHub {
        info!(instance_id = %self.instance_id, "Starting trust hub");
        TrustHub {
            instance_id: self.instance_id,
            issuance: self.issuance,
            holder_requests: self.holder_requests,
            status_lists: self.status_lists,
            supervisor: self.supervisor.start(),
        }
    }
}

/// A running hub.
pub struct TrustHub {
    instance_id: String,
    issuance: EntityService<IssuanceState, IssuanceProcess>,
    holder_requests: EntityService<HolderRequestState, HolderCredentialRequest>,
    status_lists: EntityService<StatusListState, StatusListPublication>,
    supervisor: RunningSupervisor,
}

impl TrustHub {
    /// Start configuring a hub.
    pub fn builder() -> TrustHubBuilder {
        TrustHubBuilder::default()
    }

    /// Lease holder id of this instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Issuance processes.
    pub fn issuance(&self) -> &EntityService<IssuanceState, IssuanceProcess> {
        &self.issuance
    }

    /// Holder credential requests.
    pub fn holder_requests(&self) -> &EntityService<HolderRequestState, HolderCredentialRequest> {
        &self.holder_requests
    }

    /// Status-list publication jobs.
    pub fn status_lists(&self) -> &EntityService<StatusListState, StatusListPublication> {
        &self.status_lists
    }

    /// Whether the engines are still running.
    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Stop the engines, releasing the leases they hold.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(instance_id = %self.instance_id, "Shutting down trust hub");
        self.supervisor.shutdown().await
    }
}
