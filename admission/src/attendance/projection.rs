use super::{AttendanceSnapshot, CheckIn, ScanAttempt, ScanCounts, TimeRange, TimelineBucket};
use crate::validation::ValidationReason;
use admission_core::types::{EventId, ScanLocation};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Clone, Debug, Default)]
struct Bucket {
    counts: ScanCounts,
    by_location: BTreeMap<String, ScanCounts>,
    unlocated: ScanCounts,
    by_device: BTreeMap<String, ScanCounts>,
}

#[derive(Clone, Debug, Default)]
struct EventAttendance {
    timeline: BTreeMap<DateTime<Utc>, Bucket>,
    recent: VecDeque<CheckIn>,
}

/// Pure attendance read model.
///
/// Applying the same scans in any order yields the same counters and
/// timeline: every figure is a sum, and buckets are keyed on ingestion time.
#[derive(Clone, Debug)]
pub struct AttendanceProjection {
    bucket_secs: i64,
    recent_limit: usize,
    events: HashMap<EventId, EventAttendance>,
    unattributed: ScanCounts,
}

impl AttendanceProjection {
    /// Create an empty projection bucketing the timeline every `bucket`.
    ///
    /// Widths under one second are raised to one second.
    #[must_use]
    pub fn new(bucket: Duration, recent_limit: usize) -> Self {
        Self {
            bucket_secs: bucket.num_seconds().max(1),
            recent_limit,
            events: HashMap::new(),
            unattributed: ScanCounts::default(),
        }
    }

    /// Fold one scan ingested at `ingested_at`.
    pub fn apply(&mut self, scan: &ScanAttempt, ingested_at: DateTime<Utc>) {
        let Some(event_id) = scan.event_id else {
            self.unattributed.record(scan.reason);
            return;
        };

        let start = self.bucket_start(ingested_at);
        let recent_limit = self.recent_limit;
        let attendance = self.events.entry(event_id).or_default();

        let bucket = attendance.timeline.entry(start).or_default();
        bucket.counts.record(scan.reason);
        match &scan.location {
            ScanLocation::Named(name) => bucket.by_location.entry(name.clone()).or_default().record(scan.reason),
            ScanLocation::Unspecified => bucket.unlocated.record(scan.reason),
        }
        bucket
            .by_device
            .entry(scan.device_id.as_str().to_string())
            .or_default()
            .record(scan.reason);

        if let (ValidationReason::Admitted, Some(ticket_id)) = (scan.reason, scan.ticket_id) {
            let check_in = CheckIn {
                ticket_id,
                location: scan.location.clone(),
                device_id: scan.device_id.clone(),
                scanned_at: scan.scanned_at,
                ingested_at,
            };
            // Newest first; late arrivals slot in by ingestion time.
            let position = attendance
                .recent
                .iter()
                .position(|existing| existing.ingested_at < ingested_at)
                .unwrap_or(attendance.recent.len());
            attendance.recent.insert(position, check_in);
            attendance.recent.truncate(recent_limit);
        }
    }

    /// Floor `at` to the start of its timeline bucket.
    #[must_use]
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let floored = at.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs;
        DateTime::from_timestamp(floored, 0).unwrap_or(at)
    }

    /// Scans whose payload could not be attributed to any event
    #[must_use]
    pub const fn unattributed(&self) -> ScanCounts {
        self.unattributed
    }

    /// Events with any recorded activity
    #[must_use]
    pub fn event_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<_> = self.events.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Attendance for `event_id` over buckets starting in `range`, against
    /// `registered` non-cancelled tickets.
    ///
    /// Unknown events and empty ranges yield zeroed scan counters.
    #[must_use]
    pub fn snapshot(
        &self,
        event_id: EventId,
        range: TimeRange,
        registered: u64,
        refreshed_at: DateTime<Utc>,
    ) -> AttendanceSnapshot {
        let mut snapshot = AttendanceSnapshot {
            event_id,
            total_registered: registered,
            checked_in: 0,
            total_scans: 0,
            valid_scans: 0,
            invalid_scans: 0,
            duplicate_scans: 0,
            per_location: BTreeMap::new(),
            unlocated: ScanCounts::default(),
            per_device: BTreeMap::new(),
            timeline: Vec::new(),
            peak_bucket: None,
            attendance_rate: 0.0,
            recent_check_ins: Vec::new(),
            refreshed_at,
        };
        let Some(attendance) = self.events.get(&event_id) else {
            return snapshot;
        };

        let mut totals = ScanCounts::default();
        for (start, bucket) in attendance.timeline.iter().filter(|(start, _)| range.contains(**start)) {
            totals.merge(&bucket.counts);
            for (label, counts) in &bucket.by_location {
                snapshot.per_location.entry(label.clone()).or_default().merge(counts);
            }
            snapshot.unlocated.merge(&bucket.unlocated);
            for (device, counts) in &bucket.by_device {
                snapshot.per_device.entry(device.clone()).or_default().merge(counts);
            }
            snapshot.timeline.push(TimelineBucket {
                start: *start,
                counts: bucket.counts,
            });
        }

        // Earliest bucket wins ties.
        snapshot.peak_bucket = snapshot
            .timeline
            .iter()
            .filter(|bucket| bucket.counts.valid > 0)
            .fold(None::<&TimelineBucket>, |peak, bucket| match peak {
                Some(best) if best.counts.valid >= bucket.counts.valid => Some(best),
                _ => Some(bucket),
            })
            .cloned();

        snapshot.checked_in = totals.valid;
        snapshot.total_scans = totals.total;
        snapshot.valid_scans = totals.valid;
        snapshot.invalid_scans = totals.invalid;
        snapshot.duplicate_scans = totals.duplicate;
        snapshot.attendance_rate = percentage(totals.valid, registered);

        let bucket_secs = self.bucket_secs;
        snapshot.recent_check_ins = attendance
            .recent
            .iter()
            .filter(|check_in| {
                let floored = check_in.ingested_at.timestamp().div_euclid(bucket_secs) * bucket_secs;
                DateTime::from_timestamp(floored, 0).is_some_and(|start| range.contains(start))
            })
            .cloned()
            .collect();

        snapshot
    }
}

/// `part / whole` as a percentage rounded to two decimals; zero when `whole` is zero
#[allow(clippy::cast_precision_loss)]
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let rate = part as f64 / whole as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}
