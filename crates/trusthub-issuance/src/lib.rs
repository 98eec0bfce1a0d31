// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trusthub Issuance - Credential Processes on the State Machine
//!
//! The three long-running processes of the trust hub, each an entity type
//! driven by its own [`ProcessEngine`](trusthub_statemachine::ProcessEngine):
//!
//! ```text
//! issuance_process            SUBMITTED ──► APPROVED ──► DELIVERED
//! (issuer side)                    └────────────┴──────► ERRORED / CANCELLED
//!
//! holder_credential_request   CREATED ──► REQUESTING ──► REQUESTED ──► ISSUED
//! (holder side)                  └────────────┴──────────────┴──────► ERROR / CANCELLED
//!
//! status_list_publication     CREATED ──► SIGNED ──► PUBLISHED
//!                                └──────────┴──────► FAILED / CANCELLED
//! ```
//!
//! Handlers call out through the [`collaborators`] traits; the credential
//! formats, proofs and transports behind them are not part of this crate.
//!
//! # Configuration
//!
//! [`TrustHubConfig::from_env`](config::TrustHubConfig::from_env) reads:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TRUSTHUB_DATABASE_URL` | (in-memory) | `sqlite:` or `postgres://` URL |
//! | `TRUSTHUB_INSTANCE_ID` | random UUID | Lease holder id of this instance |
//! | `TRUSTHUB_SHUTDOWN_TIMEOUT_SECS` | `30` | Grace period for engines on shutdown |
//! | `TRUSTHUB_MAX_CONCURRENT_HANDLERS` | `8` | Handlers running at once across all engines |
//! | `TRUSTHUB_HOLDER_STATUS_TIMEOUT_SECS` | `3600` | How long a holder waits for issuance |
//! | `TRUSTHUB_ISSUANCE_*` | | Engine settings of issuance processes |
//! | `TRUSTHUB_HOLDER_REQUEST_*` | | Engine settings of holder requests (`MAX_RETRIES`: 100) |
//! | `TRUSTHUB_STATUS_LIST_*` | | Engine settings of status-list publication |

#![deny(missing_docs)]

/// Declares a state enum with its persisted codes and display names.
macro_rules! entity_state {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$variant_meta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$variant_meta])* $variant ),+
        }

        impl trusthub_statemachine::EntityState for $name {
            fn code(&self) -> i32 {
                match self {
                    $( Self::$variant => $code ),+
                }
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(match self {
                    $( Self::$variant => $label ),+
                })
            }
        }
    };
}

/// Collaborator interfaces and shared credential types.
pub mod collaborators;

/// Hub configuration loaded from environment variables.
pub mod config;

/// Holder-side credential requests.
pub mod holder;

/// Wiring of the three engines under one supervisor.
pub mod hub;

/// Issuer-side issuance processes.
pub mod issuance;

/// Embedded SQL migrations of the process tables.
pub mod migrations;

/// Status-list publication jobs.
pub mod status_list;

pub use collaborators::{CollaboratorError, CredentialContainer, CredentialFormat};
pub use config::TrustHubConfig;
pub use holder::{HolderCollaborators, HolderCredentialRequest, HolderRequestState};
pub use hub::{HubStores, TrustHub, TrustHubBuilder, TrustHubConfigured};
pub use issuance::{IssuanceCollaborators, IssuanceProcess, IssuanceState};
pub use status_list::{StatusListCollaborators, StatusListPublication, StatusListState};
