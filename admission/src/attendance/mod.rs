//! Live attendance for the dashboard.
//!
//! [`AttendanceProjection`] is the pure read model: it folds
//! [`ScanAttempt`]s into per-event counters, a bucketed timeline and
//! per-location and per-device breakdowns. [`AttendanceAggregator`] runs it on
//! a worker task behind a bounded channel and republishes an immutable
//! [`AttendanceBoard`] on a fixed interval, so dashboard reads never wait on
//! scans.
//!
//! Registration figures are read from the ticket store when a snapshot is
//! taken, so they survive restarts; scan figures cover what this process has
//! ingested.

mod aggregator;
mod projection;

pub use aggregator::{AggregatorClosed, AggregatorConfig, AttendanceAggregator, AttendanceBoard};
pub use projection::AttendanceProjection;
pub(crate) use projection::percentage;

use crate::validation::ValidationReason;
use admission_core::types::{DeviceId, EventId, ScanLocation, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `validate()` call as seen by the dashboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAttempt {
    /// Ticket the payload named, if it could be verified
    pub ticket_id: Option<TicketId>,
    /// Event the payload named; `None` counts the scan as unattributed
    pub event_id: Option<EventId>,
    /// Device-reported scan time
    pub scanned_at: DateTime<Utc>,
    /// Scanning device
    pub device_id: DeviceId,
    /// Checkpoint location
    pub location: ScanLocation,
    /// Validation outcome
    pub reason: ValidationReason,
}

/// Scan tallies. `total == valid + invalid + duplicate`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounts {
    /// All scans
    pub total: u64,
    /// Admitted scans
    pub valid: u64,
    /// Rejected scans other than duplicates
    pub invalid: u64,
    /// Re-scans of an already used ticket
    pub duplicate: u64,
}

impl ScanCounts {
    /// Count one scan with outcome `reason`
    pub fn record(&mut self, reason: ValidationReason) {
        self.total += 1;
        match reason {
            ValidationReason::Admitted => self.valid += 1,
            ValidationReason::AlreadyUsed => self.duplicate += 1,
            _ => self.invalid += 1,
        }
    }

    /// Add another tally into this one
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.duplicate += other.duplicate;
    }
}

/// Half-open range `[from, to)` over timeline bucket starts; open ends are unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// The unbounded range
    #[must_use]
    pub const fn all() -> Self {
        Self { from: None, to: None }
    }

    /// `[from, to)`
    #[must_use]
    pub const fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Whether `at` falls inside the range
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }
}

/// Counts for one timeline bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineBucket {
    /// Bucket start (floored ingestion time)
    pub start: DateTime<Utc>,
    /// Scans ingested in the bucket
    pub counts: ScanCounts,
}

/// A successful admission shown in the recent check-ins list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    /// Admitted ticket
    pub ticket_id: TicketId,
    /// Checkpoint location
    pub location: ScanLocation,
    /// Scanning device
    pub device_id: DeviceId,
    /// Device-reported scan time
    pub scanned_at: DateTime<Utc>,
    /// Server ingestion time
    pub ingested_at: DateTime<Utc>,
}

/// Point-in-time attendance for one event over a range.
///
/// `total_registered` is read from the ticket store; the scan figures and
/// `attendance_rate` are restricted to the requested range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSnapshot {
    /// Event
    pub event_id: EventId,
    /// Tickets not cancelled
    pub total_registered: u64,
    /// Distinct tickets admitted (one valid scan per ticket)
    pub checked_in: u64,
    /// All scans in range
    pub total_scans: u64,
    /// Admitted scans in range
    pub valid_scans: u64,
    /// Rejected scans in range, excluding duplicates
    pub invalid_scans: u64,
    /// Duplicate scans in range
    pub duplicate_scans: u64,
    /// Scan tallies per named location
    pub per_location: BTreeMap<String, ScanCounts>,
    /// Scans from checkpoints that reported no location
    pub unlocated: ScanCounts,
    /// Scan tallies per scanning device
    pub per_device: BTreeMap<String, ScanCounts>,
    /// Non-empty buckets in range, oldest first
    pub timeline: Vec<TimelineBucket>,
    /// Bucket with the most admissions
    pub peak_bucket: Option<TimelineBucket>,
    /// `checked_in / total_registered` as a percentage
    pub attendance_rate: f64,
    /// Most recent admissions in range, newest first
    pub recent_check_ins: Vec<CheckIn>,
    /// When the board this snapshot was read from was published
    pub refreshed_at: DateTime<Utc>,
}
