// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces to the services the handlers call out to.
//!
//! Credential generation, signing, DID resolution, token issuance and transport
//! live outside the hub's process layer. Handlers only see these traits, and
//! every failure is classified: [`CollaboratorError::Transient`] failures are
//! retried with backoff, [`CollaboratorError::Fatal`] ones fail the entity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trusthub_statemachine::TransitionResult;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Worth retrying later (timeouts, unavailable peers).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (rejected input, revoked keys).
    #[error("{0}")]
    Fatal(String),
}

impl CollaboratorError {
    /// Shorthand for a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Shorthand for a fatal failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// The handler result for this failure, with `step` naming what failed.
    pub fn into_result<S, P>(self, step: &str) -> TransitionResult<S, P> {
        match self {
            Self::Transient(reason) => TransitionResult::Retry(format!("{step}: {reason}")),
            Self::Fatal(reason) => TransitionResult::Fatal(format!("{step}: {reason}")),
        }
    }
}

/// Serialization format of a verifiable credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialFormat {
    /// VC Data Model 1.1 as JWT.
    VcJwt,
    /// VC Data Model 1.1 with linked-data proofs.
    VcLdp,
    /// VC Data Model 2.0, JOSE-secured.
    Vc2Jose,
    /// VC Data Model 2.0, SD-JWT.
    Vc2SdJwt,
}

/// A credential as produced by a generator, opaque to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialContainer {
    /// Credential id.
    pub id: String,
    /// Serialization format.
    pub format: CredentialFormat,
    /// The encoded credential.
    pub raw: String,
}

/// One credential to generate from a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Credential definition id.
    pub definition_id: String,
    /// Requested format.
    pub format: CredentialFormat,
}

/// Produces signed credentials from definitions and claims.
#[async_trait]
pub trait CredentialGenerator: Send + Sync {
    /// Generate one credential per request for `holder_id`.
    async fn generate(
        &self,
        participant_context_id: &str,
        holder_id: &str,
        requests: &[GenerationRequest],
        claims: &serde_json::Value,
    ) -> Result<Vec<CredentialContainer>, CollaboratorError>;
}

/// Allocates revocation status entries.
#[async_trait]
pub trait StatusListService: Send + Sync {
    /// Add a status entry to `credential` and return it re-signed.
    async fn add_credential(
        &self,
        participant_context_id: &str,
        credential: CredentialContainer,
    ) -> Result<CredentialContainer, CollaboratorError>;
}

/// Sends issued credentials to the holder's storage endpoint.
#[async_trait]
pub trait CredentialDelivery: Send + Sync {
    /// Deliver `credentials` for the holder request `holder_pid`.
    async fn deliver(
        &self,
        holder_id: &str,
        holder_pid: &str,
        credentials: &[CredentialContainer],
    ) -> Result<(), CollaboratorError>;
}

/// Keeps the issuer's record of issued credentials.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Store an issued credential.
    async fn store(
        &self,
        participant_context_id: &str,
        holder_id: &str,
        credential: &CredentialContainer,
    ) -> Result<(), CollaboratorError>;
}

/// Resolves issuer DIDs to their service endpoints.
#[async_trait]
pub trait IssuerResolver: Send + Sync {
    /// Credential-request endpoint from the issuer's DID document.
    async fn credential_request_endpoint(&self, issuer_did: &str)
    -> Result<String, CollaboratorError>;
}

/// Issues self-issued ID tokens for outgoing requests.
#[async_trait]
pub trait SecureTokenService: Send + Sync {
    /// A token for `participant_context_id` addressed to `audience`.
    async fn self_issued_token(
        &self,
        participant_context_id: &str,
        audience: &str,
    ) -> Result<String, CollaboratorError>;
}

/// A credential the holder asks an issuer for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedCredential {
    /// Id of the credential object offered by the issuer.
    pub id: String,
    /// Credential type.
    pub credential_type: String,
    /// Requested format.
    pub format: CredentialFormat,
}

/// Issuer-side status of a credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuerRequestStatus {
    /// Accepted, not issued yet.
    Received,
    /// Credentials were issued.
    Issued,
    /// The issuer refused.
    Rejected,
    /// Anything else the issuer answered.
    Other(String),
}

impl IssuerRequestStatus {
    /// Parse the status string of an issuer response.
    pub fn parse(status: &str) -> Self {
        match status {
            "RECEIVED" => Self::Received,
            "ISSUED" => Self::Issued,
            "REJECTED" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Client for an issuer's credential-request API.
#[async_trait]
pub trait IssuerClient: Send + Sync {
    /// Send the credential request; returns the issuer-side process id.
    async fn request_credentials(
        &self,
        endpoint: &str,
        token: &str,
        holder_pid: &str,
        credentials: &[RequestedCredential],
    ) -> Result<String, CollaboratorError>;

    /// Status of a request previously sent.
    async fn request_status(
        &self,
        endpoint: &str,
        token: &str,
        issuer_pid: &str,
    ) -> Result<IssuerRequestStatus, CollaboratorError>;
}

/// Signs status-list credentials.
#[async_trait]
pub trait StatusListSigner: Send + Sync {
    /// Sign the list with the given revoked indices; returns the encoded credential.
    async fn sign(
        &self,
        participant_context_id: &str,
        credential_id: &str,
        status_purpose: &str,
        revoked_indices: &[u64],
    ) -> Result<String, CollaboratorError>;
}

/// Publishes signed status-list credentials.
#[async_trait]
pub trait StatusListPublisher: Send + Sync {
    /// Publish the credential; returns the URL it is served from.
    async fn publish(
        &self,
        participant_context_id: &str,
        credential_id: &str,
        signed_credential: &str,
    ) -> Result<String, CollaboratorError>;
}
