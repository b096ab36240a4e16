//! Attendance dashboard endpoint.
//!
//! - GET /api/events/:event_id/attendance?from&to - Live attendance snapshot

use crate::attendance::{AttendanceSnapshot, TimeRange};
use crate::server::error::AppError;
use crate::server::state::AppState;
use admission_core::types::EventId;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query parameters for the attendance snapshot.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AttendanceQuery {
    /// Inclusive lower bound on bucket start
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on bucket start
    pub to: Option<DateTime<Utc>>,
}

/// Attendance snapshot for an event, as of the latest published board.
///
/// An event with no data yields zeroed counters.
///
/// ```bash
/// curl "http://localhost:8080/api/events/$EVENT/attendance?from=2025-06-01T17:00:00Z"
/// ```
///
/// # Errors
///
/// - 422 if `to` is before `from`
/// - 503 if the ticket store cannot be read
pub async fn get_attendance(
    Path(event_id): Path<Uuid>,
    Query(query): Query<AttendanceQuery>,
    State(state): State<AppState>,
) -> Result<Json<AttendanceSnapshot>, AppError> {
    if matches!((query.from, query.to), (Some(from), Some(to)) if to < from) {
        return Err(AppError::validation("`to` must not be before `from`"));
    }
    let range = TimeRange {
        from: query.from,
        to: query.to,
    };
    let snapshot = state.attendance.snapshot(EventId::from_uuid(event_id), range).await?;
    Ok(Json(snapshot))
}
