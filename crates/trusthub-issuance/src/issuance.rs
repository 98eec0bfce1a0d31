// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Issuer-side issuance process.
//!
//! A holder's credential request becomes an issuance process in `SUBMITTED`.
//! Validation moves it to `APPROVED`; the approved handler generates the
//! credentials, registers each in a status list, delivers them to the holder
//! and records them, then moves the process to `DELIVERED`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use trusthub_statemachine::{
    RegistryError, StateHandler, StatefulEntity, TransitionRegistry, TransitionResult,
};

use crate::collaborators::{
    CredentialContainer, CredentialDelivery, CredentialFormat, CredentialGenerator,
    CredentialRepository, GenerationRequest, StatusListService,
};

/// Entity type name in logs and events.
pub const ENTITY_TYPE: &str = "issuance_process";

/// Default table of the SQL stores.
pub const TABLE: &str = "issuance_processes";

entity_state! {
    /// States of an issuance process.
    pub enum IssuanceState {
        /// Received, not validated yet.
        Submitted = 50 => "SUBMITTED",
        /// Validated, credentials to be issued.
        Approved = 100 => "APPROVED",
        /// Credentials delivered to the holder.
        Delivered = 200 => "DELIVERED",
        /// Failed.
        Errored = 300 => "ERRORED",
        /// Cancelled by an operator.
        Cancelled = 400 => "CANCELLED",
    }
}

/// Payload of an issuance process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuanceProcess {
    /// Issuer participant context.
    pub participant_context_id: String,
    /// DID of the holder.
    pub holder_id: String,
    /// The holder's id for its credential request.
    pub holder_pid: String,
    /// Credential definitions to issue.
    pub credential_definitions: Vec<String>,
    /// Requested format per credential definition.
    pub credential_formats: HashMap<String, CredentialFormat>,
    /// Claims collected for the holder.
    pub claims: serde_json::Value,
    /// Ids of the credentials delivered, once `DELIVERED`.
    #[serde(default)]
    pub delivered_credentials: Vec<String>,
}

impl IssuanceProcess {
    /// Check the submission is complete enough to issue from.
    pub fn validate(&self) -> Result<(), String> {
        if self.participant_context_id.is_empty() {
            return Err("participant context id is missing".to_string());
        }
        if self.holder_id.is_empty() {
            return Err("holder id is missing".to_string());
        }
        if self.credential_definitions.is_empty() {
            return Err("no credential definitions requested".to_string());
        }
        self.generation_requests().map(|_| ())
    }

    /// One generation request per credential definition.
    pub fn generation_requests(&self) -> Result<Vec<GenerationRequest>, String> {
        self.credential_definitions
            .iter()
            .map(|definition_id| {
                self.credential_formats
                    .get(definition_id)
                    .map(|format| GenerationRequest {
                        definition_id: definition_id.clone(),
                        format: *format,
                    })
                    .ok_or_else(|| {
                        format!("no format requested for credential definition '{definition_id}'")
                    })
            })
            .collect()
    }
}

/// Services the approved handler calls.
#[derive(Clone)]
pub struct IssuanceCollaborators {
    /// Credential generation.
    pub generator: Arc<dyn CredentialGenerator>,
    /// Status-list registration.
    pub status_list: Arc<dyn StatusListService>,
    /// Delivery to the holder.
    pub delivery: Arc<dyn CredentialDelivery>,
    /// Issued-credential records.
    pub repository: Arc<dyn CredentialRepository>,
}

type Entity = StatefulEntity<IssuanceState, IssuanceProcess>;
type Outcome = TransitionResult<IssuanceState, IssuanceProcess>;

/// `SUBMITTED` handler.
pub struct ValidateSubmission;

#[async_trait]
impl StateHandler<IssuanceState, IssuanceProcess> for ValidateSubmission {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        Ok(match entity.payload.validate() {
            Ok(()) => TransitionResult::success(IssuanceState::Approved, entity.payload.clone()),
            Err(reason) => TransitionResult::fatal(reason),
        })
    }
}

/// `APPROVED` handler.
pub struct IssueCredentials {
    collaborators: IssuanceCollaborators,
}

impl IssueCredentials {
    /// Create the handler.
    pub fn new(collaborators: IssuanceCollaborators) -> Self {
        Self { collaborators }
    }

    async fn issue(&self, process: &IssuanceProcess) -> Result<Vec<CredentialContainer>, Outcome> {
        let c = &self.collaborators;
        let requests = process
            .generation_requests()
            .map_err(TransitionResult::fatal)?;

        let generated = c
            .generator
            .generate(
                &process.participant_context_id,
                &process.holder_id,
                &requests,
                &process.claims,
            )
            .await
            .map_err(|e| e.into_result("generate credentials"))?;

        let mut registered = Vec::with_capacity(generated.len());
        for credential in generated {
            let credential = c
                .status_list
                .add_credential(&process.participant_context_id, credential)
                .await
                .map_err(|e| e.into_result("add credential to status list"))?;
            registered.push(credential);
        }

        c.delivery
            .deliver(&process.holder_id, &process.holder_pid, &registered)
            .await
            .map_err(|e| e.into_result("deliver credentials"))?;

        for credential in &registered {
            c.repository
                .store(&process.participant_context_id, &process.holder_id, credential)
                .await
                .map_err(|e| e.into_result("store credential"))?;
        }
        Ok(registered)
    }
}

#[async_trait]
impl StateHandler<IssuanceState, IssuanceProcess> for IssueCredentials {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let credentials = match self.issue(&entity.payload).await {
            Ok(credentials) => credentials,
            Err(outcome) => return Ok(outcome),
        };

        info!(
            entity_id = %entity.id,
            holder_id = %entity.payload.holder_id,
            credentials = credentials.len(),
            "Credentials delivered"
        );
        let mut payload = entity.payload.clone();
        payload.delivered_credentials = credentials.into_iter().map(|c| c.id).collect();
        Ok(TransitionResult::success(IssuanceState::Delivered, payload))
    }
}

/// Transition table of issuance processes.
pub fn registry(
    collaborators: IssuanceCollaborators,
) -> Result<TransitionRegistry<IssuanceState, IssuanceProcess>, RegistryError> {
    TransitionRegistry::builder(ENTITY_TYPE)
        .initial(IssuanceState::Submitted)
        .failed(IssuanceState::Errored)
        .cancelled(IssuanceState::Cancelled)
        .terminal(IssuanceState::Delivered)
        .transition(IssuanceState::Submitted, &[IssuanceState::Approved])
        .transition(IssuanceState::Approved, &[IssuanceState::Delivered])
        .handler(
            IssuanceState::Submitted,
            &[IssuanceState::Approved],
            ValidateSubmission,
        )
        .handler(
            IssuanceState::Approved,
            &[IssuanceState::Delivered],
            IssueCredentials::new(collaborators),
        )
        .build()
}
