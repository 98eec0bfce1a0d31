// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The three process types running end to end inside one hub.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    FakeServices, ISSUER_DID, ISSUER_ENDPOINT, eager_config, holder_request, init_tracing,
    issuance_process, status_list_job, wait_until,
};
use trusthub_issuance::collaborators::IssuerRequestStatus;
use trusthub_issuance::{
    HolderRequestState, HubStores, IssuanceState, StatusListState, TrustHub, TrustHubConfig,
};
use trusthub_statemachine::{CancelOutcome, EntityState, EntityService, Payload, TraceContext};

const SETTLE: Duration = Duration::from_secs(10);

fn hub(services: &Arc<FakeServices>, stores: HubStores, config: TrustHubConfig) -> TrustHub {
    TrustHub::builder()
        .stores(stores)
        .issuance(services.issuance())
        .holder(services.holder())
        .status_list(services.status_list())
        .config(config)
        .build()
        .expect("hub wiring")
        .start()
}

async fn settles_in<S: EntityState, P: Payload>(
    service: &EntityService<S, P>,
    id: &str,
    state: S,
) -> bool {
    wait_until(SETTLE, || async move {
        service
            .find(id)
            .await
            .expect("find")
            .is_some_and(|e| e.state == state)
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_issuance_is_delivered_after_transient_outage() {
    init_tracing();
    let services = FakeServices::new();
    services.delivery_outages.store(2, Ordering::SeqCst);
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let id = hub
        .issuance()
        .create_entity(
            issuance_process("did:web:alice", &["membership", "degree"]),
            TraceContext::new(),
        )
        .await
        .expect("create");

    assert!(settles_in(hub.issuance(), &id, IssuanceState::Delivered).await);

    let process = hub.issuance().find(&id).await.expect("find").expect("exists");
    assert_eq!(
        process.payload.delivered_credentials,
        vec![
            "membership:did:web:alice".to_string(),
            "degree:did:web:alice".to_string()
        ]
    );
    assert_eq!(process.state_count, 0);
    assert_eq!(process.error_detail, None);
    assert_eq!(services.delivery_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        *services.deliveries.lock().unwrap(),
        vec![(
            "pid-did:web:alice".to_string(),
            process.payload.delivered_credentials.clone()
        )]
    );
    assert_eq!(services.stored.lock().unwrap().len(), 2);

    assert!(hub.shutdown().await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incomplete_submission_errors() {
    let services = FakeServices::new();
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let mut process = issuance_process("did:web:bob", &["membership"]);
    process.credential_formats.clear();
    let id = hub
        .issuance()
        .create_entity(process, TraceContext::new())
        .await
        .expect("create");

    assert!(settles_in(hub.issuance(), &id, IssuanceState::Errored).await);
    let process = hub.issuance().find(&id).await.expect("find").expect("exists");
    assert_eq!(
        process.error_detail.as_deref(),
        Some("no format requested for credential definition 'membership'")
    );
    assert_eq!(services.delivery_attempts.load(Ordering::SeqCst), 0);

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_holder_request_polls_until_issued() {
    let services = FakeServices::new();
    services.answer_statuses([IssuerRequestStatus::Received, IssuerRequestStatus::Received]);
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let id = hub
        .holder_requests()
        .create_entity(holder_request(ISSUER_DID), TraceContext::new())
        .await
        .expect("create");

    assert!(settles_in(hub.holder_requests(), &id, HolderRequestState::Issued).await);

    let request = hub
        .holder_requests()
        .find(&id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(request.payload.issuer_endpoint.as_deref(), Some(ISSUER_ENDPOINT));
    assert_eq!(request.payload.issuer_pid, Some(format!("issuer-{id}")));
    assert!(request.payload.requested_at.is_some());
    assert_eq!(services.status_queries.load(Ordering::SeqCst), 3);
    assert_eq!(
        services.requests.lock().unwrap().get(&format!("issuer-{id}")),
        Some(&id)
    );
    assert!(
        services
            .token_audiences
            .lock()
            .unwrap()
            .iter()
            .all(|audience| audience == ISSUER_DID)
    );

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_holder_request_failures() {
    let services = FakeServices::new();
    services.answer_statuses([IssuerRequestStatus::Rejected]);
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let rejected = hub
        .holder_requests()
        .create_entity(holder_request(ISSUER_DID), TraceContext::new())
        .await
        .expect("create");
    let unresolvable = hub
        .holder_requests()
        .create_entity(holder_request("did:web:nowhere"), TraceContext::new())
        .await
        .expect("create");

    assert!(settles_in(hub.holder_requests(), &rejected, HolderRequestState::Error).await);
    assert!(settles_in(hub.holder_requests(), &unresolvable, HolderRequestState::Error).await);

    let detail = |id: String| {
        let service = hub.holder_requests().clone();
        async move {
            service
                .find(&id)
                .await
                .expect("find")
                .and_then(|e| e.error_detail)
        }
    };
    assert_eq!(
        detail(rejected).await.as_deref(),
        Some("the credential request was rejected by the issuer")
    );
    assert_eq!(
        detail(unresolvable).await.as_deref(),
        Some("resolve issuer endpoint: cannot resolve did:web:nowhere")
    );

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_holder_request_stops_polling() {
    let services = FakeServices::new();
    services.answer_statuses(std::iter::repeat_n(IssuerRequestStatus::Received, 100_000));
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let id = hub
        .holder_requests()
        .create_entity(holder_request(ISSUER_DID), TraceContext::new())
        .await
        .expect("create");
    let queries = &services.status_queries;
    assert!(
        wait_until(SETTLE, || async move { queries.load(Ordering::SeqCst) > 0 }).await
    );

    let outcome = hub.holder_requests().cancel_entity(&id).await.expect("cancel");
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled | CancelOutcome::Pending
    ));
    assert!(settles_in(hub.holder_requests(), &id, HolderRequestState::Cancelled).await);

    let polls = services.status_queries.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(services.status_queries.load(Ordering::SeqCst), polls);

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_list_is_signed_and_published() {
    let services = FakeServices::new();
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));

    let id = hub
        .status_lists()
        .create_entity(status_list_job("list-7"), TraceContext::new())
        .await
        .expect("create");

    assert!(settles_in(hub.status_lists(), &id, StatusListState::Published).await);
    let job = hub.status_lists().find(&id).await.expect("find").expect("exists");
    assert_eq!(job.payload.signed_credential.as_deref(), Some("list-7#revocation:3"));
    assert_eq!(
        job.payload.published_url.as_deref(),
        Some("https://issuer.example/statuslist/list-7")
    );

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hub_over_sqlite() {
    let services = FakeServices::new();
    let stores = HubStores::connect(Some("sqlite::memory:"))
        .await
        .expect("sqlite stores");
    let hub = hub(&services, stores, eager_config("hub-sql"));

    let issuance = hub
        .issuance()
        .create_entity(issuance_process("did:web:carol", &["membership"]), TraceContext::new())
        .await
        .expect("create");
    let holder = hub
        .holder_requests()
        .create_entity(holder_request(ISSUER_DID), TraceContext::new())
        .await
        .expect("create");
    let status_list = hub
        .status_lists()
        .create_entity(status_list_job("list-1"), TraceContext::new())
        .await
        .expect("create");

    assert!(settles_in(hub.issuance(), &issuance, IssuanceState::Delivered).await);
    assert!(settles_in(hub.holder_requests(), &holder, HolderRequestState::Issued).await);
    assert!(settles_in(hub.status_lists(), &status_list, StatusListState::Published).await);

    let delivered = hub
        .issuance()
        .query_by_state(IssuanceState::Delivered)
        .await
        .expect("query");
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].payload.delivered_credentials,
        vec!["membership:did:web:carol".to_string()]
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_stores_reopen_migrated_pool() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite pool");

    let first = HubStores::sqlite(pool.clone()).await.expect("first open");
    first
        .status_lists
        .create(&trusthub_statemachine::StatefulEntity::new(
            "sl-1",
            StatusListState::Created,
            status_list_job("list-1"),
            chrono::Utc::now(),
        ))
        .await
        .expect("create");

    let reopened = HubStores::sqlite(pool).await.expect("second open");
    let found = reopened
        .status_lists
        .find("sl-1")
        .await
        .expect("find")
        .expect("entity survives reopen");
    assert_eq!(found.state, StatusListState::Created);
}

#[tokio::test]
async fn test_shutdown_reports_all_engines() {
    let services = FakeServices::new();
    let hub = hub(&services, HubStores::in_memory(), eager_config("hub-a"));
    assert_eq!(hub.instance_id(), "hub-a");
    assert!(hub.is_running());

    let report = hub.shutdown().await;

    assert!(report.is_clean());
    let mut stopped = report.stopped.clone();
    stopped.sort();
    assert_eq!(
        stopped,
        vec![
            "holder_credential_request".to_string(),
            "issuance_process".to_string(),
            "status_list_publication".to_string(),
        ]
    );
}

#[test]
fn test_builder_requires_collaborators() {
    let services = FakeServices::new();
    let err = TrustHub::builder()
        .stores(HubStores::in_memory())
        .issuance(services.issuance())
        .status_list(services.status_list())
        .build()
        .err()
        .expect("missing holder collaborators");
    assert!(err.to_string().contains("holder collaborators are required"));
}

#[tokio::test]
async fn test_unsupported_database_url() {
    let err = HubStores::connect(Some("mysql://localhost/hub"))
        .await
        .err()
        .expect("unsupported scheme");
    assert!(err.to_string().contains("Unsupported database URL"));
}
