// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status-list publication jobs: sign the list, then publish it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use trusthub_statemachine::{
    RegistryError, StateHandler, StatefulEntity, TransitionRegistry, TransitionResult,
};

use crate::collaborators::{StatusListPublisher, StatusListSigner};

/// Entity type name in logs and events.
pub const ENTITY_TYPE: &str = "status_list_publication";

/// Default table of the SQL stores.
pub const TABLE: &str = "status_list_publications";

entity_state! {
    /// States of a status-list publication job.
    pub enum StatusListState {
        /// Waiting to be signed.
        Created = 100 => "CREATED",
        /// Signed, waiting to be published.
        Signed = 200 => "SIGNED",
        /// Served at its URL.
        Published = 300 => "PUBLISHED",
        /// Failed.
        Failed = 400 => "FAILED",
        /// Superseded before publication.
        Cancelled = 500 => "CANCELLED",
    }
}

/// Payload of a status-list publication job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusListPublication {
    /// Issuer participant context.
    pub participant_context_id: String,
    /// Id of the status-list credential.
    pub credential_id: String,
    /// `revocation` or `suspension`.
    pub status_purpose: String,
    /// Indices whose status bit is set.
    pub revoked_indices: Vec<u64>,
    /// The signed credential, once `SIGNED`.
    #[serde(default)]
    pub signed_credential: Option<String>,
    /// Where the credential is served, once `PUBLISHED`.
    #[serde(default)]
    pub published_url: Option<String>,
}

impl StatusListPublication {
    /// A job for `credential_id` not signed yet.
    pub fn new(
        participant_context_id: impl Into<String>,
        credential_id: impl Into<String>,
        status_purpose: impl Into<String>,
        revoked_indices: Vec<u64>,
    ) -> Self {
        Self {
            participant_context_id: participant_context_id.into(),
            credential_id: credential_id.into(),
            status_purpose: status_purpose.into(),
            revoked_indices,
            ..Default::default()
        }
    }
}

/// Services the status-list handlers call.
#[derive(Clone)]
pub struct StatusListCollaborators {
    /// Signs the list credential.
    pub signer: Arc<dyn StatusListSigner>,
    /// Publishes the signed credential.
    pub publisher: Arc<dyn StatusListPublisher>,
}

type Entity = StatefulEntity<StatusListState, StatusListPublication>;
type Outcome = TransitionResult<StatusListState, StatusListPublication>;

/// `CREATED` handler.
pub struct SignStatusList {
    signer: Arc<dyn StatusListSigner>,
}

#[async_trait]
impl StateHandler<StatusListState, StatusListPublication> for SignStatusList {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let job = &entity.payload;
        let signed = match self
            .signer
            .sign(
                &job.participant_context_id,
                &job.credential_id,
                &job.status_purpose,
                &job.revoked_indices,
            )
            .await
        {
            Ok(signed) => signed,
            Err(e) => return Ok(e.into_result("sign status list")),
        };

        let mut payload = job.clone();
        payload.signed_credential = Some(signed);
        Ok(TransitionResult::success(StatusListState::Signed, payload))
    }
}

/// `SIGNED` handler.
pub struct PublishStatusList {
    publisher: Arc<dyn StatusListPublisher>,
}

#[async_trait]
impl StateHandler<StatusListState, StatusListPublication> for PublishStatusList {
    async fn handle(&self, entity: &Entity) -> anyhow::Result<Outcome> {
        let job = &entity.payload;
        let Some(signed) = job.signed_credential.as_deref() else {
            return Ok(TransitionResult::fatal("status list was never signed"));
        };

        let url = match self
            .publisher
            .publish(&job.participant_context_id, &job.credential_id, signed)
            .await
        {
            Ok(url) => url,
            Err(e) => return Ok(e.into_result("publish status list")),
        };

        info!(
            entity_id = %entity.id,
            credential_id = %job.credential_id,
            %url,
            "Status list published"
        );
        let mut payload = job.clone();
        payload.published_url = Some(url);
        Ok(TransitionResult::success(StatusListState::Published, payload))
    }
}

/// Transition table of status-list publication jobs.
pub fn registry(
    collaborators: StatusListCollaborators,
) -> Result<TransitionRegistry<StatusListState, StatusListPublication>, RegistryError> {
    TransitionRegistry::builder(ENTITY_TYPE)
        .initial(StatusListState::Created)
        .failed(StatusListState::Failed)
        .cancelled(StatusListState::Cancelled)
        .terminal(StatusListState::Published)
        .transition(StatusListState::Created, &[StatusListState::Signed])
        .transition(StatusListState::Signed, &[StatusListState::Published])
        .handler(
            StatusListState::Created,
            &[StatusListState::Signed],
            SignStatusList {
                signer: collaborators.signer,
            },
        )
        .handler(
            StatusListState::Signed,
            &[StatusListState::Published],
            PublishStatusList {
                publisher: collaborators.publisher,
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use chrono::Utc;

    struct FakeRegistry {
        publish_failure: Option<CollaboratorError>,
    }

    #[async_trait]
    impl StatusListSigner for FakeRegistry {
        async fn sign(
            &self,
            _participant_context_id: &str,
            credential_id: &str,
            status_purpose: &str,
            revoked_indices: &[u64],
        ) -> Result<String, CollaboratorError> {
            Ok(format!("{credential_id}/{status_purpose}/{revoked_indices:?}"))
        }
    }

    #[async_trait]
    impl StatusListPublisher for FakeRegistry {
        async fn publish(
            &self,
            _participant_context_id: &str,
            credential_id: &str,
            _signed_credential: &str,
        ) -> Result<String, CollaboratorError> {
            match &self.publish_failure {
                Some(e) => Err(e.clone()),
                None => Ok(format!("https://issuer.example/status/{credential_id}")),
            }
        }
    }

    fn job() -> StatusListPublication {
        StatusListPublication::new("issuer-ctx", "list-1", "revocation", vec![3, 17])
    }

    #[tokio::test]
    async fn test_sign_then_publish() {
        let fake = Arc::new(FakeRegistry {
            publish_failure: None,
        });
        let created = StatefulEntity::new("sl-1", StatusListState::Created, job(), Utc::now());

        let signed = SignStatusList {
            signer: fake.clone(),
        }
        .handle(&created)
        .await
        .expect("handle");
        let payload = match signed {
            TransitionResult::Success {
                next: StatusListState::Signed,
                payload,
            } => payload,
            other => panic!("unexpected result {other:?}"),
        };
        assert_eq!(payload.signed_credential.as_deref(), Some("list-1/revocation/[3, 17]"));

        let signed_entity =
            StatefulEntity::new("sl-1", StatusListState::Signed, payload, Utc::now());
        let published = PublishStatusList { publisher: fake }
            .handle(&signed_entity)
            .await
            .expect("handle");
        match published {
            TransitionResult::Success {
                next: StatusListState::Published,
                payload,
            } => assert_eq!(
                payload.published_url.as_deref(),
                Some("https://issuer.example/status/list-1")
            ),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_failures() {
        let unsigned = StatefulEntity::new("sl-1", StatusListState::Signed, job(), Utc::now());
        let publisher = Arc::new(FakeRegistry {
            publish_failure: Some(CollaboratorError::transient("cdn unavailable")),
        });
        assert_eq!(
            PublishStatusList {
                publisher: publisher.clone()
            }
            .handle(&unsigned)
            .await
            .expect("handle"),
            TransitionResult::fatal("status list was never signed")
        );

        let mut signed = unsigned.clone();
        signed.payload.signed_credential = Some("signed".to_string());
        assert_eq!(
            PublishStatusList { publisher }
                .handle(&signed)
                .await
                .expect("handle"),
            TransitionResult::retry("publish status list: cdn unavailable")
        );
    }

    #[test]
    fn test_registry_wiring() {
        let fake = Arc::new(FakeRegistry {
            publish_failure: None,
        });
        let registry = registry(StatusListCollaborators {
            signer: fake.clone(),
            publisher: fake,
        })
        .expect("valid registry");
        assert_eq!(
            registry.handled_states(),
            vec![StatusListState::Created, StatusListState::Signed]
        );
        assert_eq!(registry.cancelled_state(), StatusListState::Cancelled);
    }
}
