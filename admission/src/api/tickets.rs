//! Ticket API endpoints.
//!
//! - POST /api/events/:event_id/tickets - Issue a ticket
//! - POST /api/events/:event_id/tickets/bulk - Issue tickets for many users
//! - GET /api/events/:event_id/tickets - Tickets of an event with status distribution
//! - POST /api/events/:event_id/cancel - Cancel every ticket of an event
//! - GET /api/tickets/:ticket_id - Ticket details
//! - GET /api/tickets/:ticket_id/payload - Current payload of an active ticket
//! - POST /api/tickets/:ticket_id/regenerate - Rotate the payload
//! - POST /api/tickets/:ticket_id/cancel - Cancel a ticket
//! - GET /api/users/:user_id/tickets - Tickets of a user

use super::{CancelRequest, IssuedTicketResponse, TicketView, WindowRequest};
use crate::issuance::{BatchOutcome, EventCancellation, StatusDistribution};
use crate::server::error::AppError;
use crate::server::state::AppState;
use admission_core::environment::Clock;
use admission_core::types::{EventId, TicketId, UserId};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to issue one ticket.
#[derive(Debug, Deserialize, Serialize)]
pub struct IssueTicketRequest {
    /// Eligible user
    pub user_id: Uuid,
    /// Validity window
    #[serde(flatten)]
    pub window: WindowRequest,
}

/// Request to issue tickets for many users.
#[derive(Debug, Deserialize, Serialize)]
pub struct BulkIssueRequest {
    /// Eligible users
    pub user_ids: Vec<Uuid>,
    /// Validity window shared by every ticket
    #[serde(flatten)]
    pub window: WindowRequest,
}

/// Per-user bulk issuance result.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkIssueItem {
    /// User
    pub user_id: Uuid,
    /// `issued` or `skipped`
    pub outcome: String,
    /// New ticket, or the one the user already holds
    pub ticket_id: Uuid,
    /// Payload of a newly issued ticket
    pub payload: Option<String>,
}

/// Bulk issuance response.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkIssueResponse {
    /// Tickets issued
    pub issued: usize,
    /// Users skipped because they already hold a ticket
    pub skipped: usize,
    /// Results in request order
    pub results: Vec<BulkIssueItem>,
}

/// Tickets of an event.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventTicketsResponse {
    /// Event ID
    pub event_id: Uuid,
    /// Tickets, oldest first
    pub tickets: Vec<TicketView>,
    /// Counts by status
    pub distribution: StatusDistribution,
    /// Used tickets as a percentage of non-cancelled tickets
    pub attendance_rate: f64,
    /// Read time
    pub generated_at: DateTime<Utc>,
}

/// Tickets of a user.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserTicketsResponse {
    /// User ID
    pub user_id: Uuid,
    /// Tickets, newest first
    pub tickets: Vec<TicketView>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Issue a ticket for an eligible user.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/events/$EVENT/tickets \
///   -H "Content-Type: application/json" \
///   -d '{"user_id": "'$USER'", "event_starts_at": "2025-06-01T18:00:00Z"}'
/// ```
///
/// # Errors
///
/// 409 `ALREADY_ISSUED` if the user already holds an active ticket; 422 for a bad window.
pub async fn issue_ticket(
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<IssueTicketRequest>,
) -> Result<(StatusCode, Json<IssuedTicketResponse>), AppError> {
    let window = request.window.resolve(&state.issuance)?;
    let issued = state
        .issuance
        .issue(EventId::from_uuid(event_id), UserId::from_uuid(request.user_id), window)
        .await?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// Issue tickets for many users, skipping those who already hold one.
///
/// # Errors
///
/// 422 `BATCH_TOO_LARGE` above 500 users.
pub async fn issue_bulk(
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<BulkIssueRequest>,
) -> Result<Json<BulkIssueResponse>, AppError> {
    let window = request.window.resolve(&state.issuance)?;
    let users: Vec<UserId> = request.user_ids.into_iter().map(UserId::from_uuid).collect();
    let outcomes = state
        .issuance
        .issue_batch(EventId::from_uuid(event_id), &users, window)
        .await?;

    let results: Vec<BulkIssueItem> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            BatchOutcome::Issued { user_id, issued } => BulkIssueItem {
                user_id: *user_id.as_uuid(),
                outcome: "issued".to_string(),
                ticket_id: *issued.ticket.id.as_uuid(),
                payload: Some(issued.payload.into_string()),
            },
            BatchOutcome::Skipped { user_id, existing } => BulkIssueItem {
                user_id: *user_id.as_uuid(),
                outcome: "skipped".to_string(),
                ticket_id: *existing.as_uuid(),
                payload: None,
            },
        })
        .collect();
    let issued = results.iter().filter(|item| item.payload.is_some()).count();

    Ok(Json(BulkIssueResponse {
        issued,
        skipped: results.len() - issued,
        results,
    }))
}

/// Tickets of an event with their status distribution.
///
/// # Errors
///
/// 503 if the store is unavailable.
pub async fn list_event_tickets(
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<EventTicketsResponse>, AppError> {
    let report = state.issuance.event_report(EventId::from_uuid(event_id)).await?;
    Ok(Json(EventTicketsResponse {
        event_id,
        tickets: report.tickets.into_iter().map(TicketView::from).collect(),
        distribution: report.distribution,
        attendance_rate: report.attendance_rate,
        generated_at: report.generated_at,
    }))
}

/// Cancel every ticket of an event.
///
/// # Errors
///
/// 503 if the store is unavailable.
pub async fn cancel_event(
    Path(event_id): Path<Uuid>,
    State(state): State<AppState>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<EventCancellation>, AppError> {
    let reason = body.and_then(|Json(request)| request.reason);
    let summary = state.issuance.cancel_event(EventId::from_uuid(event_id), reason).await?;
    Ok(Json(summary))
}

/// Ticket details.
///
/// # Errors
///
/// 404 if the ticket does not exist.
pub async fn get_ticket(
    Path(ticket_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TicketView>, AppError> {
    let listing = state.issuance.ticket(TicketId::from_uuid(ticket_id)).await?;
    Ok(Json(listing.into()))
}

/// Current payload of an active ticket, for re-rendering its QR code.
///
/// # Errors
///
/// 404 if the ticket does not exist; 409 `TICKET_NOT_ACTIVE` otherwise.
pub async fn get_payload(
    Path(ticket_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<IssuedTicketResponse>, AppError> {
    let issued = state.issuance.payload(TicketId::from_uuid(ticket_id)).await?;
    Ok(Json(issued.into()))
}

/// Rotate the payload of an active ticket. Earlier payloads stop verifying.
///
/// # Errors
///
/// 404 if the ticket does not exist; 409 `TICKET_NOT_ACTIVE` otherwise.
pub async fn regenerate_ticket(
    Path(ticket_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<IssuedTicketResponse>, AppError> {
    let issued = state.issuance.regenerate(TicketId::from_uuid(ticket_id)).await?;
    Ok(Json(issued.into()))
}

/// Cancel a ticket. Cancelling twice is a no-op.
///
/// # Errors
///
/// 404 if the ticket does not exist.
pub async fn cancel_ticket(
    Path(ticket_id): Path<Uuid>,
    State(state): State<AppState>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<TicketView>, AppError> {
    let reason = body.and_then(|Json(request)| request.reason);
    let ticket = state.issuance.cancel(TicketId::from_uuid(ticket_id), reason).await?;
    Ok(Json(TicketView::at(ticket, state.clock.now())))
}

/// Tickets a user holds across events.
///
/// # Errors
///
/// 503 if the store is unavailable.
pub async fn list_user_tickets(
    Path(user_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<UserTicketsResponse>, AppError> {
    let listings = state.issuance.user_tickets(UserId::from_uuid(user_id)).await?;
    Ok(Json(UserTicketsResponse {
        user_id,
        tickets: listings.into_iter().map(TicketView::from).collect(),
    }))
}
