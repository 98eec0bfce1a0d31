// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the hub tests: scripted collaborators and fast engine settings.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;
use trusthub_issuance::collaborators::{
    CollaboratorError, CredentialContainer, CredentialDelivery, CredentialGenerator,
    CredentialRepository, GenerationRequest, IssuerClient, IssuerRequestStatus, IssuerResolver,
    RequestedCredential, SecureTokenService, StatusListPublisher, StatusListService,
    StatusListSigner,
};
use trusthub_issuance::{
    CredentialFormat, HolderCollaborators, HolderCredentialRequest, IssuanceCollaborators,
    IssuanceProcess, StatusListCollaborators, StatusListPublication, TrustHubConfig,
};
use trusthub_statemachine::{EngineConfig, RetryPolicy};

pub const ISSUER_DID: &str = "did:web:issuer.example";
pub const ISSUER_ENDPOINT: &str = "https://issuer.example/api/dcp/credentials";

/// Initialize tracing for tests; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Collaborators of all three process types, backed by in-process records.
#[derive(Default)]
pub struct FakeServices {
    /// Delivery attempts that fail transiently before deliveries succeed.
    pub delivery_outages: AtomicUsize,
    /// Statuses the issuer answers, in order; `ISSUED` once drained.
    pub issuer_statuses: Mutex<VecDeque<IssuerRequestStatus>>,
    pub delivery_attempts: AtomicUsize,
    pub status_queries: AtomicUsize,
    /// (holder pid, credential ids) per successful delivery.
    pub deliveries: Mutex<Vec<(String, Vec<String>)>>,
    pub stored: Mutex<Vec<String>>,
    pub token_audiences: Mutex<Vec<String>>,
    /// holder pid per issuer pid handed out.
    pub requests: Mutex<HashMap<String, String>>,
}

impl FakeServices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer_statuses(&self, statuses: impl IntoIterator<Item = IssuerRequestStatus>) {
        self.issuer_statuses.lock().unwrap().extend(statuses);
    }

    pub fn issuance(self: &Arc<Self>) -> IssuanceCollaborators {
        IssuanceCollaborators {
            generator: self.clone(),
            status_list: self.clone(),
            delivery: self.clone(),
            repository: self.clone(),
        }
    }

    pub fn holder(self: &Arc<Self>) -> HolderCollaborators {
        HolderCollaborators {
            resolver: self.clone(),
            token_service: self.clone(),
            issuer: self.clone(),
        }
    }

    pub fn status_list(self: &Arc<Self>) -> StatusListCollaborators {
        StatusListCollaborators {
            signer: self.clone(),
            publisher: self.clone(),
        }
    }
}

#[async_trait]
impl CredentialGenerator for FakeServices {
    async fn generate(
        &self,
        _participant_context_id: &str,
        holder_id: &str,
        requests: &[GenerationRequest],
        _claims: &serde_json::Value,
    ) -> Result<Vec<CredentialContainer>, CollaboratorError> {
        Ok(requests
            .iter()
            .map(|r| CredentialContainer {
                id: format!("{}:{}", r.definition_id, holder_id),
                format: r.format,
                raw: "generated".to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl StatusListService for FakeServices {
    async fn add_credential(
        &self,
        _participant_context_id: &str,
        mut credential: CredentialContainer,
    ) -> Result<CredentialContainer, CollaboratorError> {
        credential.raw = "with-status".to_string();
        Ok(credential)
    }
}

#[async_trait]
impl CredentialDelivery for FakeServices {
    async fn deliver(
        &self,
        _holder_id: &str,
        holder_pid: &str,
        credentials: &[CredentialContainer],
    ) -> Result<(), CollaboratorError> {
        self.delivery_attempts.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .delivery_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(CollaboratorError::transient("storage endpoint unavailable"));
        }
        self.deliveries.lock().unwrap().push((
            holder_pid.to_string(),
            credentials.iter().map(|c| c.id.clone()).collect(),
        ));
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for FakeServices {
    async fn store(
        &self,
        _participant_context_id: &str,
        _holder_id: &str,
        credential: &CredentialContainer,
    ) -> Result<(), CollaboratorError> {
        self.stored.lock().unwrap().push(credential.id.clone());
        Ok(())
    }
}

#[async_trait]
impl IssuerResolver for FakeServices {
    async fn credential_request_endpoint(
        &self,
        issuer_did: &str,
    ) -> Result<String, CollaboratorError> {
        if issuer_did == ISSUER_DID {
            Ok(ISSUER_ENDPOINT.to_string())
        } else {
            Err(CollaboratorError::fatal(format!("cannot resolve {issuer_did}")))
        }
    }
}

#[async_trait]
impl SecureTokenService for FakeServices {
    async fn self_issued_token(
        &self,
        _participant_context_id: &str,
        audience: &str,
    ) -> Result<String, CollaboratorError> {
        self.token_audiences.lock().unwrap().push(audience.to_string());
        Ok("self-issued".to_string())
    }
}

#[async_trait]
impl IssuerClient for FakeServices {
    async fn request_credentials(
        &self,
        _endpoint: &str,
        _token: &str,
        holder_pid: &str,
        _credentials: &[RequestedCredential],
    ) -> Result<String, CollaboratorError> {
        let issuer_pid = format!("issuer-{holder_pid}");
        self.requests
            .lock()
            .unwrap()
            .insert(issuer_pid.clone(), holder_pid.to_string());
        Ok(issuer_pid)
    }

    async fn request_status(
        &self,
        _endpoint: &str,
        _token: &str,
        _issuer_pid: &str,
    ) -> Result<IssuerRequestStatus, CollaboratorError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .issuer_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(IssuerRequestStatus::Issued))
    }
}

#[async_trait]
impl StatusListSigner for FakeServices {
    async fn sign(
        &self,
        _participant_context_id: &str,
        credential_id: &str,
        status_purpose: &str,
        revoked_indices: &[u64],
    ) -> Result<String, CollaboratorError> {
        Ok(format!("{credential_id}#{status_purpose}:{}", revoked_indices.len()))
    }
}

#[async_trait]
impl StatusListPublisher for FakeServices {
    async fn publish(
        &self,
        _participant_context_id: &str,
        credential_id: &str,
        _signed_credential: &str,
    ) -> Result<String, CollaboratorError> {
        Ok(format!("https://issuer.example/statuslist/{credential_id}"))
    }
}

/// Engine settings that poll every few milliseconds and retry without delay.
pub fn eager_engine(max_retries: u32) -> EngineConfig {
    EngineConfig {
        batch_size: 10,
        poll_interval: Duration::from_millis(5),
        lease_duration: Duration::from_secs(30),
        retry: RetryPolicy::new(max_retries, Duration::ZERO, Duration::ZERO),
        concurrency: 2,
    }
}

pub fn eager_config(instance_id: &str) -> TrustHubConfig {
    TrustHubConfig {
        database_url: None,
        instance_id: instance_id.to_string(),
        shutdown_timeout: Duration::from_secs(5),
        max_concurrent_handlers: 4,
        holder_status_timeout: Duration::from_secs(3600),
        issuance: eager_engine(3),
        holder_request: eager_engine(1000),
        status_list: eager_engine(3),
    }
}

pub fn issuance_process(holder_id: &str, definitions: &[&str]) -> IssuanceProcess {
    IssuanceProcess {
        participant_context_id: "issuer-ctx".to_string(),
        holder_id: holder_id.to_string(),
        holder_pid: format!("pid-{holder_id}"),
        credential_definitions: definitions.iter().map(|d| d.to_string()).collect(),
        credential_formats: definitions
            .iter()
            .map(|d| (d.to_string(), CredentialFormat::VcJwt))
            .collect(),
        claims: serde_json::json!({ "membership": "gold" }),
        delivered_credentials: Vec::new(),
    }
}

pub fn holder_request(issuer_did: &str) -> HolderCredentialRequest {
    HolderCredentialRequest::new(
        "holder-ctx",
        issuer_did,
        vec![RequestedCredential {
            id: "membership-offer".to_string(),
            credential_type: "MembershipCredential".to_string(),
            format: CredentialFormat::Vc2Jose,
        }],
    )
}

pub fn status_list_job(credential_id: &str) -> StatusListPublication {
    StatusListPublication::new("issuer-ctx", credential_id, "revocation", vec![4, 9, 12])
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
