//! Router configuration for the admission service.

use super::health::{health_check, readiness_check};
use super::state::AppState;
use crate::api::{attendance, scans, tickets};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Health checks live at the root; everything else is nested under `/api`.
/// Every request gets an `x-request-id` (generated when absent) that is
/// echoed on the response and recorded on the trace span.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Issuance and event-level operations
        .route(
            "/events/:event_id/tickets",
            post(tickets::issue_ticket).get(tickets::list_event_tickets),
        )
        .route("/events/:event_id/tickets/bulk", post(tickets::issue_bulk))
        .route("/events/:event_id/cancel", post(tickets::cancel_event))
        .route("/events/:event_id/attendance", get(attendance::get_attendance))
        // Single tickets
        .route("/tickets/:ticket_id", get(tickets::get_ticket))
        .route("/tickets/:ticket_id/payload", get(tickets::get_payload))
        .route("/tickets/:ticket_id/regenerate", post(tickets::regenerate_ticket))
        .route("/tickets/:ticket_id/cancel", post(tickets::cancel_ticket))
        .route("/users/:user_id/tickets", get(tickets::list_user_tickets))
        // Checkpoints
        .route("/scans", post(scans::scan))
        .route("/scans/bulk", post(scans::scan_bulk));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<axum::body::Body>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
