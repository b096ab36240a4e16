//! Validation engine integration tests.
//!
//! Exercises the full issue -> scan path over the in-memory store, including
//! concurrent scans of one ticket from many checkpoints.
//!
//! Run with: `cargo test -p admission --test validation_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use admission::issuance::IssuanceService;
use admission::validation::{MAX_BATCH_VALIDATE, ValidationEngine, ValidationError, ValidationReason};
use admission_core::codec::{Claims, SigningKey, TokenCodec};
use admission_core::environment::Clock;
use admission_core::memory::InMemoryTicketStore;
use admission_core::store::{
    Precondition, StateCounts, StoreError, StoreFuture, TicketChange, TicketStore, WriteOutcome,
};
use admission_core::types::{
    AdmissionPolicy, Checkpoint, DeviceId, EventId, ScanLocation, Ticket, TicketId, TicketState, UserId,
};
use admission_testing::{ManualClock, active_ticket, init_tracing, test_clock, test_codec, window_starting_at};
use chrono::Duration;
use futures::future::join_all;
use std::sync::Arc;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryTicketStore>,
    codec: Arc<TokenCodec>,
    issuance: IssuanceService,
    engine: Arc<ValidationEngine>,
}

fn harness() -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let store = Arc::new(InMemoryTicketStore::new());
    let codec = Arc::new(test_codec());
    let issuance = IssuanceService::new(store.clone(), codec.clone(), clock.clone(), AdmissionPolicy::default());
    let engine = Arc::new(ValidationEngine::new(store.clone(), codec.clone(), clock.clone()));
    Harness {
        clock,
        store,
        codec,
        issuance,
        engine,
    }
}

fn gate(device: &str, clock: &ManualClock) -> Checkpoint {
    Checkpoint::new(DeviceId::new(device), ScanLocation::named("Main Gate"), clock.now())
}

/// A store whose backing database is down.
struct UnreachableStore;

impl TicketStore for UnreachableStore {
    fn insert(&self, _ticket: Ticket) -> StoreFuture<'_, Ticket> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn get(&self, _id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn list_by_event(&self, _event_id: EventId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn list_by_user(&self, _user_id: UserId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn state_counts(&self, _event_id: EventId) -> StoreFuture<'_, StateCounts> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn transition(&self, _id: TicketId, _p: Precondition, _c: TicketChange) -> StoreFuture<'_, WriteOutcome> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_scans_admit_exactly_once() {
    println!("🧪 64 checkpoints scan the same ticket at once");
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let issued = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();
    let payload = issued.payload.into_string();

    let tasks = (0..64).map(|n| {
        let engine = Arc::clone(&h.engine);
        let payload = payload.clone();
        let checkpoint = gate(&format!("scanner-{n}"), &h.clock);
        tokio::spawn(async move { engine.validate(&payload, &checkpoint).await })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("store available"))
        .collect();

    let admitted = results.iter().filter(|r| r.valid).count();
    let duplicates = results
        .iter()
        .filter(|r| r.reason == ValidationReason::AlreadyUsed && r.is_duplicate)
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(duplicates, 63);

    let stored = h.store.get(issued.ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TicketState::Used);
    let admitting = results.iter().find(|r| r.valid).unwrap();
    assert_eq!(admitting.ticket.as_ref().unwrap().scan, stored.scan);
    println!("  ✅ One admission, 63 duplicates");
}

#[tokio::test]
async fn rescan_after_admission_is_duplicate() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let issued = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();
    let checkpoint = gate("scanner-1", &h.clock);

    let first = h.engine.validate(issued.payload.as_str(), &checkpoint).await.unwrap();
    assert!(first.valid);
    assert_eq!(first.reason, ValidationReason::Admitted);

    for _ in 0..3 {
        let again = h.engine.validate(issued.payload.as_str(), &checkpoint).await.unwrap();
        assert!(!again.valid);
        assert!(again.is_duplicate);
        assert_eq!(again.reason, ValidationReason::AlreadyUsed);
    }
}

#[tokio::test]
async fn window_edges_are_inclusive() {
    let h = harness();
    let event = EventId::new();
    let opens = h.clock.now() + Duration::minutes(30);
    let window = window_starting_at(opens, Duration::hours(2));
    let early = h.issuance.issue(event, UserId::new(), window).await.unwrap();
    let late = h.issuance.issue(event, UserId::new(), window).await.unwrap();

    h.clock.set(window.valid_from() - Duration::seconds(1));
    let result = h.engine.validate(early.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::OutOfWindow);

    h.clock.set(window.valid_from());
    let result = h.engine.validate(early.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::Admitted);

    h.clock.set(window.valid_until());
    let at_close = h.issuance.issue(event, UserId::new(), window).await.unwrap();
    let result = h.engine.validate(at_close.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::Admitted);

    h.clock.set(window.valid_until() + Duration::seconds(1));
    let result = h.engine.validate(late.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::OutOfWindow);

    // A used ticket still reads as a duplicate after its window closes.
    let result = h.engine.validate(early.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::AlreadyUsed);
}

#[tokio::test]
async fn regeneration_invalidates_previous_payload() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let original = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();
    let fresh = h.issuance.regenerate(original.ticket.id).await.unwrap();

    assert_eq!(fresh.ticket.regeneration_count, 1);
    assert_ne!(fresh.payload, original.payload);

    let stale = h.engine.validate(original.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(stale.reason, ValidationReason::SignatureInvalid);
    assert!(stale.ticket.is_none());

    let current = h.engine.validate(fresh.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert!(current.valid);
}

#[tokio::test]
async fn cancelled_ticket_is_rejected() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let issued = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();
    h.issuance.cancel(issued.ticket.id, Some("unregistered".into())).await.unwrap();

    let result = h.engine.validate(issued.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::Cancelled);
    assert!(!result.is_duplicate);
}

#[tokio::test]
async fn forged_and_garbage_payloads_never_touch_the_store() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let issued = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();

    let mut tampered = issued.payload.as_str().as_bytes().to_vec();
    tampered[3] = if tampered[3] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).unwrap();

    let result = h.engine.validate(&tampered, &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::SignatureInvalid);

    let result = h.engine.validate("https://example.com/not-a-ticket", &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::Malformed);

    let stored = h.store.get(issued.ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TicketState::Active);
}

#[tokio::test]
async fn authentic_payload_for_unknown_ticket_is_not_found() {
    let h = harness();
    let never_stored = active_ticket(h.clock.now());
    let payload = h.codec.encode(&Claims::for_ticket(&never_stored)).unwrap();

    let result = h.engine.validate(payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::NotFound);
    assert!(result.ticket.is_none());
}

#[tokio::test]
async fn retired_key_verifies_until_its_deadline() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(6));
    let event = EventId::new();
    let before = h.issuance.issue(event, UserId::new(), window).await.unwrap();
    let kept = h.issuance.issue(event, UserId::new(), window).await.unwrap();

    h.codec
        .rotate(SigningKey::generate("next").unwrap(), Duration::hours(1), h.clock.now());
    assert_eq!(h.codec.signing_key_id(), "next");

    let after = h.issuance.issue(event, UserId::new(), window).await.unwrap();
    let only_old_key = test_codec();
    assert!(only_old_key.decode(after.payload.as_str(), h.clock.now()).is_err());

    let result = h.engine.validate(before.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert!(result.valid, "old key verifies during grace");

    h.clock.advance(Duration::hours(2));
    let result = h.engine.validate(kept.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::SignatureInvalid);

    let result = h.engine.validate(after.payload.as_str(), &gate("s", &h.clock)).await.unwrap();
    assert!(result.valid);
}

#[tokio::test]
async fn store_outage_is_an_error_not_a_rejection() {
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let codec = Arc::new(test_codec());
    let engine = ValidationEngine::new(Arc::new(UnreachableStore), codec.clone(), clock.clone());
    let ticket = active_ticket(clock.now());
    let payload = codec.encode(&Claims::for_ticket(&ticket)).unwrap();

    let err = engine.validate(payload.as_str(), &gate("s", &clock)).await.unwrap_err();
    assert!(err.is_transient());

    // Rejections that need no lookup still succeed.
    let result = engine.validate("garbage", &gate("s", &clock)).await.unwrap();
    assert_eq!(result.reason, ValidationReason::Malformed);
}

#[tokio::test]
async fn batch_validation_keeps_order_and_limit() {
    let h = harness();
    let window = window_starting_at(h.clock.now(), Duration::hours(2));
    let issued = h.issuance.issue(EventId::new(), UserId::new(), window).await.unwrap();
    let payloads = vec![issued.payload.as_str().to_string(), "junk".to_string(), issued.payload.into_string()];

    let results = h.engine.validate_batch(&payloads, &gate("s", &h.clock)).await.unwrap();
    let reasons: Vec<_> = results.iter().map(|r| r.reason).collect();
    assert_eq!(
        reasons,
        vec![ValidationReason::Admitted, ValidationReason::Malformed, ValidationReason::AlreadyUsed]
    );

    let too_many = vec!["junk".to_string(); MAX_BATCH_VALIDATE + 1];
    let err = h.engine.validate_batch(&too_many, &gate("s", &h.clock)).await.unwrap_err();
    assert_eq!(err, ValidationError::BatchTooLarge { size: 101, max: 100 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issue_for_one_pair_yields_one_ticket() {
    let h = harness();
    let issuance = Arc::new(h.issuance);
    let (event, user) = (EventId::new(), UserId::new());
    let window = window_starting_at(h.clock.now(), Duration::hours(2));

    let tasks = (0..16).map(|_| {
        let issuance = Arc::clone(&issuance);
        tokio::spawn(async move { issuance.issue(event, user, window).await })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.store.state_counts(event).await.unwrap().active, 1);
}
