//! Scan API endpoints.
//!
//! - POST /api/scans - Validate one scanned payload
//! - POST /api/scans/bulk - Validate up to 100 payloads from one checkpoint
//!
//! Every structured outcome, including rejections, is a `200 OK` with a
//! [`ScanResponse`]. A 503 means the ticket could not be checked.

use super::TicketView;
use crate::server::error::AppError;
use crate::server::state::AppState;
use crate::validation::{ValidationReason, ValidationResult};
use admission_core::environment::Clock;
use admission_core::types::{Checkpoint, DeviceId, ScanLocation};
use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Request/Response Types
// ============================================================================

/// One scan from a checkpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct ScanRequest {
    /// Raw payload read from the QR code
    pub payload: String,
    /// Scanning device
    pub device_id: String,
    /// Gate or entrance
    pub location: Option<String>,
    /// Device clock at scan time; defaults to server time
    pub scanned_at: Option<DateTime<Utc>>,
}

/// Many scans from one checkpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct BulkScanRequest {
    /// Raw payloads
    pub payloads: Vec<String>,
    /// Scanning device
    pub device_id: String,
    /// Gate or entrance
    pub location: Option<String>,
}

/// Outcome of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    /// Whether the holder may enter
    pub valid: bool,
    /// Outcome
    pub reason: ValidationReason,
    /// Already admitted earlier
    pub is_duplicate: bool,
    /// Ticket, when the payload verified against it
    pub ticket: Option<TicketView>,
}

impl ScanResponse {
    fn from_result(result: ValidationResult, now: DateTime<Utc>) -> Self {
        Self {
            valid: result.valid,
            reason: result.reason,
            is_duplicate: result.is_duplicate,
            ticket: result.ticket.map(|ticket| TicketView::at(ticket, now)),
        }
    }
}

/// Bulk scan response.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkScanResponse {
    /// Admitted scans
    pub admitted: usize,
    /// Results in request order
    pub results: Vec<ScanResponse>,
}

fn checkpoint(
    device_id: &str,
    location: Option<String>,
    scanned_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Checkpoint, AppError> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(AppError::bad_request("device_id is required"));
    }
    Ok(Checkpoint::new(
        DeviceId::new(device_id),
        ScanLocation::from(location),
        scanned_at.unwrap_or(now),
    ))
}

// ============================================================================
// Handlers
// ============================================================================

/// Validate one scanned payload.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/scans \
///   -H "Content-Type: application/json" \
///   -d '{"payload": "'$PAYLOAD'", "device_id": "gate-a-1", "location": "Gate A"}'
/// # {"valid":true,"reason":"admitted","is_duplicate":false,"ticket":{...}}
/// ```
///
/// # Errors
///
/// 400 without a `device_id`; 503 when the ticket store is unavailable.
pub async fn scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let now = state.clock.now();
    let checkpoint = checkpoint(&request.device_id, request.location, request.scanned_at, now)?;
    let result = state.validation.validate(&request.payload, &checkpoint).await?;
    Ok(Json(ScanResponse::from_result(result, state.clock.now())))
}

/// Validate many payloads from one checkpoint, in order.
///
/// # Errors
///
/// 400 without a `device_id`; 422 `BATCH_TOO_LARGE` above 100 payloads; 503
/// when the ticket store is unavailable.
pub async fn scan_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkScanRequest>,
) -> Result<Json<BulkScanResponse>, AppError> {
    let now = state.clock.now();
    let checkpoint = checkpoint(&request.device_id, request.location, None, now)?;
    let results = state.validation.validate_batch(&request.payloads, &checkpoint).await?;

    let now = state.clock.now();
    let results: Vec<ScanResponse> = results
        .into_iter()
        .map(|result| ScanResponse::from_result(result, now))
        .collect();
    Ok(Json(BulkScanResponse {
        admitted: results.iter().filter(|result| result.valid).count(),
        results,
    }))
}
