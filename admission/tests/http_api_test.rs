//! HTTP API integration tests.
//!
//! Drives the full router over the in-memory store with `axum-test`.
//!
//! Run with: `cargo test -p admission --test http_api_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use admission::AdmissionApp;
use admission::api::scans::ScanResponse;
use admission::api::{IssuedTicketResponse, TicketView};
use admission::attendance::{AggregatorConfig, AttendanceSnapshot};
use admission::server::error::ErrorResponse;
use admission::validation::ValidationReason;
use admission_core::codec::SigningKey;
use admission_core::environment::Clock;
use admission_core::memory::InMemoryTicketStore;
use admission_core::types::{AdmissionPolicy, TicketStatus};
use admission_testing::{ManualClock, test_clock, test_codec};
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

fn server() -> (TestServer, AdmissionApp, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let app = AdmissionApp::with_components(
        Arc::new(InMemoryTicketStore::new()),
        Arc::new(test_codec()),
        clock.clone(),
        AdmissionPolicy::default(),
        AggregatorConfig::default(),
    );
    let server = TestServer::new(app.router()).expect("router should build");
    (server, app, clock)
}

async fn issue(server: &TestServer, event: Uuid, clock: &ManualClock) -> IssuedTicketResponse {
    let response = server
        .post(&format!("/api/events/{event}/tickets"))
        .json(&json!({
            "user_id": Uuid::new_v4(),
            "event_starts_at": clock.now(),
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

#[tokio::test]
async fn health_and_readiness() {
    let (server, _app, _clock) = server();

    let health = server.get("/health").await;
    health.assert_status_ok();
    assert_eq!(health.json::<Value>()["status"], "ok");

    let ready = server.get("/ready").await;
    ready.assert_status_ok();
    assert_eq!(ready.json::<Value>()["store"], true);
    assert!(ready.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn issue_scan_and_rescan() {
    let (server, _app, clock) = server();
    let event = Uuid::new_v4();
    let issued = issue(&server, event, &clock).await;
    assert_eq!(issued.ticket.status, TicketStatus::Active);
    assert_eq!(issued.ticket.valid_from, clock.now() - chrono::Duration::minutes(30));

    let scan = json!({"payload": issued.payload, "device_id": "gate-a-1", "location": "Gate A"});
    let first = server.post("/api/scans").json(&scan).await;
    first.assert_status_ok();
    let first: ScanResponse = first.json();
    assert!(first.valid);
    assert_eq!(first.ticket.unwrap().status, TicketStatus::Used);

    let second: ScanResponse = server.post("/api/scans").json(&scan).await.json();
    assert!(!second.valid);
    assert!(second.is_duplicate);
    assert_eq!(second.reason, ValidationReason::AlreadyUsed);
}

#[tokio::test]
async fn second_issue_for_pair_conflicts() {
    let (server, _app, clock) = server();
    let event = Uuid::new_v4();
    let body = json!({"user_id": Uuid::new_v4(), "event_starts_at": clock.now()});

    server
        .post(&format!("/api/events/{event}/tickets"))
        .json(&body)
        .await
        .assert_status(StatusCode::CREATED);
    let conflict = server.post(&format!("/api/events/{event}/tickets")).json(&body).await;
    conflict.assert_status(StatusCode::CONFLICT);
    assert_eq!(conflict.json::<ErrorResponse>().code, "ALREADY_ISSUED");
}

#[tokio::test]
async fn issue_requires_a_window() {
    let (server, _app, _clock) = server();
    let response = server
        .post(&format!("/api/events/{}/tickets", Uuid::new_v4()))
        .json(&json!({"user_id": Uuid::new_v4()}))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json::<ErrorResponse>().code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn scan_without_device_is_bad_request() {
    let (server, _app, _clock) = server();
    let response = server
        .post("/api/scans")
        .json(&json!({"payload": "whatever", "device_id": "  "}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejected_scans_are_200_with_reason() {
    let (server, _app, _clock) = server();
    let response = server
        .post("/api/scans")
        .json(&json!({"payload": "not-a-ticket", "device_id": "gate-a-1"}))
        .await;
    response.assert_status_ok();
    let body: ScanResponse = response.json();
    assert_eq!(body.reason, ValidationReason::Malformed);
    assert!(body.ticket.is_none());
}

#[tokio::test]
async fn regenerate_then_cancel() {
    let (server, _app, clock) = server();
    let issued = issue(&server, Uuid::new_v4(), &clock).await;
    let id = issued.ticket.ticket_id;

    let fresh: IssuedTicketResponse = server.post(&format!("/api/tickets/{id}/regenerate")).await.json();
    assert_eq!(fresh.ticket.regeneration_count, 1);

    let stale: ScanResponse = server
        .post("/api/scans")
        .json(&json!({"payload": issued.payload, "device_id": "gate"}))
        .await
        .json();
    assert_eq!(stale.reason, ValidationReason::SignatureInvalid);

    let cancelled = server
        .post(&format!("/api/tickets/{id}/cancel"))
        .json(&json!({"reason": "unregistered"}))
        .await;
    cancelled.assert_status_ok();
    assert_eq!(cancelled.json::<TicketView>().status, TicketStatus::Cancelled);

    server
        .post(&format!("/api/tickets/{id}/regenerate"))
        .await
        .assert_status(StatusCode::CONFLICT);
    server
        .get(&format!("/api/tickets/{id}/payload"))
        .await
        .assert_status(StatusCode::CONFLICT);

    let scan: ScanResponse = server
        .post("/api/scans")
        .json(&json!({"payload": fresh.payload, "device_id": "gate"}))
        .await
        .json();
    assert_eq!(scan.reason, ValidationReason::Cancelled);
}

#[tokio::test]
async fn unknown_ticket_is_404() {
    let (server, _app, _clock) = server();
    let response = server.get(&format!("/api/tickets/{}", Uuid::new_v4())).await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<ErrorResponse>().code, "NOT_FOUND");
}

#[tokio::test]
async fn bulk_issue_and_bulk_scan() {
    let (server, app, clock) = server();
    let event = Uuid::new_v4();
    let repeat = Uuid::new_v4();
    let users = vec![Uuid::new_v4(), repeat, repeat];

    let response = server
        .post(&format!("/api/events/{event}/tickets/bulk"))
        .json(&json!({"user_ids": users, "event_starts_at": clock.now()}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["issued"], 2);
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["results"][2]["outcome"], "skipped");

    let payloads: Vec<String> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|item| item["payload"].as_str().map(str::to_string))
        .collect();
    let scans = server
        .post("/api/scans/bulk")
        .json(&json!({"payloads": payloads, "device_id": "turnstile-3", "location": "East"}))
        .await;
    scans.assert_status_ok();
    assert_eq!(scans.json::<Value>()["admitted"], 2);

    let listing: Value = server.get(&format!("/api/events/{event}/tickets")).await.json();
    assert_eq!(listing["distribution"]["used"], 2);
    assert_eq!(listing["tickets"].as_array().unwrap().len(), 2);

    app.attendance().flush().await.unwrap();
    let snapshot: AttendanceSnapshot = server.get(&format!("/api/events/{event}/attendance")).await.json();
    assert_eq!(snapshot.checked_in, 2);
    assert_eq!(snapshot.per_location["East"].valid, 2);

    let mine: Value = server.get(&format!("/api/users/{repeat}/tickets")).await.json();
    assert_eq!(mine["tickets"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_event_cancels_everything() {
    let (server, _app, clock) = server();
    let event = Uuid::new_v4();
    for _ in 0..3 {
        issue(&server, event, &clock).await;
    }

    let summary: Value = server
        .post(&format!("/api/events/{event}/cancel"))
        .json(&json!({"reason": "venue flooded"}))
        .await
        .json();
    assert_eq!(summary["cancelled"], 3);

    let again: Value = server.post(&format!("/api/events/{event}/cancel")).await.json();
    assert_eq!(again["cancelled"], 0);
    assert_eq!(again["already_cancelled"], 3);
}

#[tokio::test]
async fn inverted_attendance_range_is_rejected() {
    let (server, _app, _clock) = server();
    let response = server
        .get(&format!("/api/events/{}/attendance", Uuid::new_v4()))
        .add_query_param("from", "2025-01-02T00:00:00Z")
        .add_query_param("to", "2025-01-01T00:00:00Z")
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn key_rotation_keeps_outstanding_payloads_scannable() {
    let (server, app, clock) = server();
    let event = Uuid::new_v4();
    let before = issue(&server, event, &clock).await;

    app.codec()
        .rotate(SigningKey::generate("next").unwrap(), chrono::Duration::hours(1), clock.now());
    assert_eq!(app.codec().signing_key_id(), "next");
    let after = issue(&server, event, &clock).await;

    for payload in [before.payload, after.payload] {
        let scan: ScanResponse = server
            .post("/api/scans")
            .json(&json!({"payload": payload, "device_id": "gate"}))
            .await
            .json();
        assert!(scan.valid);
    }
}
