//! HTTP API handlers.
//!
//! Organized by resource:
//! - Tickets: issuance, regeneration, cancellation, listings
//! - Scans: payload validation at checkpoints
//! - Attendance: live dashboard snapshots
//!
//! Authentication is handled upstream; handlers assume an authenticated caller.

pub mod attendance;
pub mod scans;
pub mod tickets;

use crate::issuance::{IssuanceService, IssuedTicket, TicketListing};
use crate::server::error::AppError;
use admission_core::types::{Cancellation, ScanMetadata, Ticket, TicketStatus, ValidityWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Shared Request/Response Types
// ============================================================================

/// Public view of a ticket. The signing nonce is never exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketView {
    /// Ticket ID
    pub ticket_id: Uuid,
    /// Event ID
    pub event_id: Uuid,
    /// Holder
    pub user_id: Uuid,
    /// Status at read time
    pub status: TicketStatus,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Window start
    pub valid_from: DateTime<Utc>,
    /// Window end
    pub valid_until: DateTime<Utc>,
    /// Admission record, once used
    pub scan: Option<ScanMetadata>,
    /// Payload regenerations so far
    pub regeneration_count: u32,
    /// Cancellation record, once cancelled
    pub cancellation: Option<Cancellation>,
}

impl TicketView {
    /// View of `ticket` with status observed at `now`
    #[must_use]
    pub fn at(ticket: Ticket, now: DateTime<Utc>) -> Self {
        let status = ticket.status_at(now);
        Self::with_status(ticket, status)
    }

    fn with_status(ticket: Ticket, status: TicketStatus) -> Self {
        Self {
            ticket_id: *ticket.id.as_uuid(),
            event_id: *ticket.event_id.as_uuid(),
            user_id: *ticket.user_id.as_uuid(),
            status,
            issued_at: ticket.issued_at,
            valid_from: ticket.window.valid_from(),
            valid_until: ticket.window.valid_until(),
            scan: ticket.scan,
            regeneration_count: ticket.regeneration_count,
            cancellation: ticket.cancellation,
        }
    }
}

impl From<TicketListing> for TicketView {
    fn from(listing: TicketListing) -> Self {
        Self::with_status(listing.ticket, listing.status)
    }
}

/// A ticket plus the payload to render as its QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTicketResponse {
    /// Ticket
    pub ticket: TicketView,
    /// Signed payload
    pub payload: String,
}

impl From<IssuedTicket> for IssuedTicketResponse {
    fn from(issued: IssuedTicket) -> Self {
        // Only active tickets get a payload.
        Self {
            ticket: TicketView::with_status(issued.ticket, TicketStatus::Active),
            payload: issued.payload.into_string(),
        }
    }
}

/// Validity window supplied with an issuance request.
///
/// Either explicit bounds, or an event start from which the configured policy
/// derives them. Explicit bounds win when both are given.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct WindowRequest {
    /// Explicit window start
    pub valid_from: Option<DateTime<Utc>>,
    /// Explicit window end
    pub valid_until: Option<DateTime<Utc>>,
    /// Event start, for a policy-derived window
    pub event_starts_at: Option<DateTime<Utc>>,
}

impl WindowRequest {
    /// Resolve to a concrete window.
    ///
    /// # Errors
    ///
    /// Returns a 422 if the bounds are incomplete or inverted.
    pub fn resolve(&self, issuance: &IssuanceService) -> Result<ValidityWindow, AppError> {
        match (self.valid_from, self.valid_until, self.event_starts_at) {
            (Some(from), Some(until), _) => {
                ValidityWindow::new(from, until).map_err(|e| AppError::validation(e.to_string()))
            }
            (None, None, Some(starts_at)) => Ok(issuance.window_for(starts_at)?),
            (Some(_), None, _) | (None, Some(_), _) => Err(AppError::validation(
                "valid_from and valid_until must be given together",
            )),
            (None, None, None) => Err(AppError::validation(
                "either valid_from/valid_until or event_starts_at is required",
            )),
        }
    }
}

/// Optional body carrying a cancellation reason.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CancelRequest {
    /// Why the ticket is being cancelled
    pub reason: Option<String>,
}
