// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Holder-side credential requests.
//!
//! A holder asks an issuer for credentials and then polls the issuer until
//! they are issued, rejected, or the request has waited too long.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trusthub_statemachine::{
    Clock, RegistryError, StateHandler, StatefulEntity, TransitionRegistry, TransitionResult,
};

use crate::collaborators::{
    IssuerClient, IssuerRequestStatus, IssuerResolver, RequestedCredential, SecureTokenService,
};

/// Entity type name in logs and events.
pub const ENTITY_TYPE: &str = "holder_credential_request";

/// Default table of the SQL stores.
pub const TABLE: &str = "holder_credential_requests";

/// How long a sent request may wait for the issuer.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(3600);

/// Retry budget of holder requests; polling the issuer is expected to retry.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

entity_state! {
    /// States of a holder credential request.
    pub enum HolderRequestState {
        /// Created, issuer endpoint unknown.
        Created = 100 => "CREATED",
        /// Endpoint resolved, request to be sent.
        Requesting = 200 => "REQUESTING",
        /// Sent, waiting for the issuer.
        Requested = 300 => "REQUESTED",
        /// The issuer issued the credentials.
        Issued = 400 => "ISSUED",
        /// Failed.
        Error = 500 => "ERROR",
        /// Cancelled by the holder.
        Cancelled = 600 => "CANCELLED",
    }
}

/// Payload of a holder credential request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolderCredentialRequest {
    /// Holder participant context.
    pub participant_context_id: String,
    /// DID of the issuer.
    pub issuer_did: String,
    /// Credentials asked for.
    pub requested_credentials: Vec<RequestedCredential>,
    /// Credential-request endpoint of the issuer, once resolved.
    #[serde(default)]
    pub issuer_endpoint: Option<String>,
    /// The issuer's process id, once the request was accepted.
    #[serde(default)]
    pub issuer_pid: Option<String>,
    /// When the request was accepted by the issuer.
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl HolderCredentialRequest {
    /// A request not sent yet.
    pub fn new(
        participant_context_id: impl Into<String>,
        issuer_did: impl Into<String>,
        requested_credentials: Vec<RequestedCredential>,
    ) -> Self {
        Self {
            participant_context_id: participant_context_id.into(),
            issuer_did: issuer_did.into(),
            requested_credentials,
            ..Default::default()
        }
    }
}

/// Services the holder handlers call.
#[derive(Clone)]
pub struct HolderCollaborators {
    /// DID resolution.
    pub resolver: Arc<dyn IssuerResolver>,
    /// Self-issued tokens.
    pub token_service: Arc<dyn SecureTokenService>,
    /// The issuer's credential-request API.
    pub issuer: Arc<dyn IssuerClient>,
}

type Entity = StatefulEntity<HolderRequestState, HolderCredentialRequest>;
type Outcome = TransitionResult<HolderRequestState, HolderCredentialRequest>;

/// `CREATED` handler: find where to send the request.
pub struct ResolveIssuer {
    resolver: Arc<dyn IssuerResolver>,
}

#[async_trait]
impl StateHandler<HolderRequestState, HolderCredentialRequest> for ResolveIssuer {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let request = &entity.payload;
        match self
            .resolver
            .credential_request_endpoint(&request.issuer_did)
            .await
        {
            Ok(endpoint) => {
                debug!(
                    entity_id = %entity.id,
                    issuer_did = %request.issuer_did,
                    %endpoint,
                    "Issuer endpoint resolved"
                );
                let mut payload = request.clone();
                payload.issuer_endpoint = Some(endpoint);
                Ok(TransitionResult::success(HolderRequestState::Requesting, payload))
            }
            Err(e) => Ok(e.into_result("resolve issuer endpoint")),
        }
    }
}

/// `REQUESTING` handler: send the credential request.
pub struct SendRequest {
    collaborators: HolderCollaborators,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl StateHandler<HolderRequestState, HolderCredentialRequest> for SendRequest {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let request = &entity.payload;
        let Some(endpoint) = request.issuer_endpoint.as_deref() else {
            return Ok(TransitionResult::fatal("issuer endpoint was never resolved"));
        };

        let token = match self
            .collaborators
            .token_service
            .self_issued_token(&request.participant_context_id, &request.issuer_did)
            .await
        {
            Ok(token) => token,
            Err(e) => return Ok(e.into_result("obtain token")),
        };

        // the entity id doubles as the holder pid the issuer reports back on
        match self
            .collaborators
            .issuer
            .request_credentials(endpoint, &token, &entity.id, &request.requested_credentials)
            .await
        {
            Ok(issuer_pid) => {
                let mut payload = request.clone();
                payload.issuer_pid = Some(issuer_pid);
                payload.requested_at = Some(self.clock.now());
                Ok(TransitionResult::success(HolderRequestState::Requested, payload))
            }
            Err(e) => Ok(e.into_result("send credential request")),
        }
    }
}

/// `REQUESTED` handler: poll the issuer until it decides.
pub struct AwaitIssuance {
    collaborators: HolderCollaborators,
    clock: Arc<dyn Clock>,
    status_timeout: Duration,
}

#[async_trait]
impl StateHandler<HolderRequestState, HolderCredentialRequest> for AwaitIssuance {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let request = &entity.payload;
        let (Some(endpoint), Some(issuer_pid), Some(requested_at)) = (
            request.issuer_endpoint.as_deref(),
            request.issuer_pid.as_deref(),
            request.requested_at,
        ) else {
            return Ok(TransitionResult::fatal("request was never accepted by the issuer"));
        };

        let waited = (self.clock.now() - requested_at).to_std().unwrap_or_default();
        if waited > self.status_timeout {
            warn!(
                entity_id = %entity.id,
                issuer_did = %request.issuer_did,
                waited_secs = waited.as_secs(),
                "Issuer did not answer in time"
            );
            return Ok(TransitionResult::fatal(format!(
                "time limit exceeded: waited {}s for the issuer, limit {}s",
                waited.as_secs(),
                self.status_timeout.as_secs()
            )));
        }

        let token = match self
            .collaborators
            .token_service
            .self_issued_token(&request.participant_context_id, &request.issuer_did)
            .await
        {
            Ok(token) => token,
            Err(e) => return Ok(e.into_result("obtain token")),
        };

        let status = match self
            .collaborators
            .issuer
            .request_status(endpoint, &token, issuer_pid)
            .await
        {
            Ok(status) => status,
            Err(e) => return Ok(e.into_result("query request status")),
        };

        Ok(match status {
            IssuerRequestStatus::Issued => {
                TransitionResult::success(HolderRequestState::Issued, request.clone())
            }
            IssuerRequestStatus::Received => TransitionResult::retry("issuer has not issued yet"),
            IssuerRequestStatus::Rejected => {
                TransitionResult::fatal("the credential request was rejected by the issuer")
            }
            IssuerRequestStatus::Other(status) => {
                TransitionResult::fatal(format!("invalid status received from issuer: '{status}'"))
            }
        })
    }
}

/// Transition table of holder credential requests.
pub fn registry(
    collaborators: HolderCollaborators,
    clock: Arc<dyn Clock>,
    status_timeout: Duration,
) -> Result<TransitionRegistry<HolderRequestState, HolderCredentialRequest>, RegistryError> {
    use HolderRequestState::*;

    TransitionRegistry::builder(ENTITY_TYPE)
        .initial(Created)
        .failed(Error)
        .cancelled(Cancelled)
        .terminal(Issued)
        .transition(Created, &[Requesting])
        .transition(Requesting, &[Requested])
        .transition(Requested, &[Issued])
        .handler(
            Created,
            &[Requesting],
            ResolveIssuer {
                resolver: Arc::clone(&collaborators.resolver),
            },
        )
        .handler(
            Requesting,
            &[Requested],
            SendRequest {
                collaborators: collaborators.clone(),
                clock: Arc::clone(&clock),
            },
        )
        .handler(
            Requested,
            &[Issued],
            AwaitIssuance {
                collaborators,
                clock,
                status_timeout,
            },
        )
        .build()
}
