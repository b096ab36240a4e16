//! Domain types for event admission.
//!
//! Identifiers, the ticket record and its lifecycle state, the validity window
//! and checkpoint metadata reported by scanning devices.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an attendee
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ticket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(Uuid);

impl TicketId {
    /// Creates a new random `TicketId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TicketId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier reported by a scanning device
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a `DeviceId` from the identifier a scanner reports
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-ticket signing nonce.
///
/// Rotated on regeneration so that every payload issued before the rotation
/// stops verifying against the stored ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningNonce(u64);

impl SigningNonce {
    /// Draw a fresh random nonce
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Wrap a raw nonce value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw nonce value
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Draw a nonce guaranteed to differ from `self`
    #[must_use]
    pub fn rotate(&self) -> Self {
        loop {
            let next = Self::random();
            if next != *self {
                return next;
            }
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Persisted lifecycle state of a ticket.
///
/// There is no stored `Expired` state; expiry is derived from the validity
/// window at read time, see [`TicketStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Issued and admissible within its window
    Active,
    /// Admitted once; terminal for admission
    Used,
    /// Withdrawn by unregistration or event cancellation; terminal
    Cancelled,
}

impl TicketState {
    /// Convert state to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse state from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, UnknownState> {
        match s {
            "active" => Ok(Self::Active),
            "used" => Ok(Self::Used),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownState(other.to_string())),
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Active → Active` is the regeneration self-loop. Nothing leaves
    /// `Cancelled`, and nothing returns to `Active`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Active | Self::Used | Self::Cancelled) | (Self::Used, Self::Cancelled)
        )
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage held a state string this build does not know.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown ticket state: {0}")]
pub struct UnknownState(pub String);

/// Observed status of a ticket at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Active and not past its window
    Active,
    /// Already admitted
    Used,
    /// Cancelled
    Cancelled,
    /// Active but past `valid_until`
    Expired,
}

impl TicketStatus {
    /// Label used in API responses and logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Validity window
// ============================================================================

/// Admission window relative to an event start time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// How long before the start admission opens
    pub admit_before: Duration,
    /// How long after the start admission stays open
    pub admit_after: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            admit_before: Duration::minutes(30),
            admit_after: Duration::hours(2),
        }
    }
}

/// Invalid validity window bounds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("validity window ends ({valid_until}) before it starts ({valid_from})")]
pub struct WindowError {
    /// Requested start
    pub valid_from: DateTime<Utc>,
    /// Requested end
    pub valid_until: DateTime<Utc>,
}

/// Inclusive `[valid_from, valid_until]` interval, at whole-second precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
}

impl ValidityWindow {
    /// Build a window, truncating both bounds to whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError`] if `valid_until` precedes `valid_from`.
    pub fn new(valid_from: DateTime<Utc>, valid_until: DateTime<Utc>) -> Result<Self, WindowError> {
        let valid_from = valid_from.trunc_subsecs(0);
        let valid_until = valid_until.trunc_subsecs(0);
        if valid_until < valid_from {
            return Err(WindowError {
                valid_from,
                valid_until,
            });
        }
        Ok(Self {
            valid_from,
            valid_until,
        })
    }

    /// Window around an event start time according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError`] if the policy durations produce an inverted window.
    pub fn around(starts_at: DateTime<Utc>, policy: &AdmissionPolicy) -> Result<Self, WindowError> {
        Self::new(starts_at - policy.admit_before, starts_at + policy.admit_after)
    }

    /// Start of the window
    #[must_use]
    pub const fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    /// End of the window
    #[must_use]
    pub const fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    /// Whether `at` lies within the window (both ends inclusive)
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_until
    }

    /// Whether the window has closed at `at`
    #[must_use]
    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        at > self.valid_until
    }
}

// ============================================================================
// Checkpoint metadata
// ============================================================================

/// Location reported by a checkpoint.
///
/// Checkpoints that report nothing are recorded as `Unspecified` instead of a
/// missing value, so aggregation never branches on absence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ScanLocation {
    /// No location reported
    #[default]
    Unspecified,
    /// Named gate or entrance
    Named(String),
}

impl ScanLocation {
    /// Create a named location; blank names collapse to `Unspecified`
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::from(Some(name.into()))
    }

    /// Display label.
    ///
    /// A gate named "unspecified" reads like [`ScanLocation::Unspecified`];
    /// breakdowns key on the variant, not the label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Named(name) => name,
        }
    }
}

impl From<Option<String>> for ScanLocation {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(name) if !name.trim().is_empty() => Self::Named(name.trim().to_string()),
            _ => Self::Unspecified,
        }
    }
}

impl From<ScanLocation> for Option<String> {
    fn from(value: ScanLocation) -> Self {
        match value {
            ScanLocation::Unspecified => None,
            ScanLocation::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for ScanLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A scanning device at a location, as seen by one `validate()` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Scanning device
    pub device_id: DeviceId,
    /// Gate or entrance
    pub location: ScanLocation,
    /// Device-reported scan time
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint reading
    #[must_use]
    pub fn new(device_id: DeviceId, location: ScanLocation, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            location,
            timestamp,
        }
    }
}

/// Scan metadata written once, when a ticket is admitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetadata {
    /// Device-reported scan time (audit only, may be skewed)
    pub scanned_at: DateTime<Utc>,
    /// Server time at which the admission was recorded
    pub recorded_at: DateTime<Utc>,
    /// Where the ticket was scanned
    pub location: ScanLocation,
    /// Which device scanned it
    pub device_id: DeviceId,
}

impl ScanMetadata {
    /// Scan metadata for a checkpoint reading recorded at `recorded_at`
    #[must_use]
    pub fn from_checkpoint(checkpoint: &Checkpoint, recorded_at: DateTime<Utc>) -> Self {
        Self {
            scanned_at: checkpoint.timestamp,
            recorded_at,
            location: checkpoint.location.clone(),
            device_id: checkpoint.device_id.clone(),
        }
    }
}

/// Why and when a ticket was cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// When the cancellation was recorded
    pub at: DateTime<Utc>,
    /// Free-form reason (unregistration, event cancelled, ...)
    pub reason: Option<String>,
}

// ============================================================================
// Ticket
// ============================================================================

/// Persisted admission ticket for one (event, user) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identity, stable across regenerations
    pub id: TicketId,
    /// Event the ticket admits to
    pub event_id: EventId,
    /// Ticket owner
    pub user_id: UserId,
    /// Persisted lifecycle state
    pub state: TicketState,
    /// Issuance time
    pub issued_at: DateTime<Utc>,
    /// Admission window
    pub window: ValidityWindow,
    /// Written once on admission
    pub scan: Option<ScanMetadata>,
    /// Number of payload regenerations
    pub regeneration_count: u32,
    /// Nonce bound into the current payload
    pub signing_nonce: SigningNonce,
    /// Set once on cancellation
    pub cancellation: Option<Cancellation>,
}

impl Ticket {
    /// A freshly issued `Active` ticket with a random identity and nonce.
    #[must_use]
    pub fn issue(event_id: EventId, user_id: UserId, window: ValidityWindow, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: TicketId::new(),
            event_id,
            user_id,
            state: TicketState::Active,
            issued_at,
            window,
            scan: None,
            regeneration_count: 0,
            signing_nonce: SigningNonce::random(),
            cancellation: None,
        }
    }

    /// Status as observed at `now`; `Active` tickets past their window read as `Expired`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> TicketStatus {
        match self.state {
            TicketState::Active if self.window.has_ended(now) => TicketStatus::Expired,
            TicketState::Active => TicketStatus::Active,
            TicketState::Used => TicketStatus::Used,
            TicketState::Cancelled => TicketStatus::Cancelled,
        }
    }

    /// Whether the ticket would be admitted at `now` if scanned
    #[must_use]
    pub fn is_admissible_at(&self, now: DateTime<Utc>) -> bool {
        self.state == TicketState::Active && self.window.contains(now)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn lifecycle_never_returns_to_active() {
        assert!(TicketState::Active.can_transition_to(TicketState::Used));
        assert!(TicketState::Active.can_transition_to(TicketState::Active));
        assert!(TicketState::Used.can_transition_to(TicketState::Cancelled));
        assert!(!TicketState::Used.can_transition_to(TicketState::Active));
        assert!(!TicketState::Used.can_transition_to(TicketState::Used));
        assert!(!TicketState::Cancelled.can_transition_to(TicketState::Active));
        assert!(!TicketState::Cancelled.can_transition_to(TicketState::Cancelled));
    }

    #[test]
    fn state_round_trips_through_storage_string() {
        for state in [TicketState::Active, TicketState::Used, TicketState::Cancelled] {
            assert_eq!(TicketState::parse(state.as_str()), Ok(state));
        }
        assert!(TicketState::parse("expired").is_err());
    }

    #[test]
    fn window_is_inclusive_at_both_ends() {
        let window = ValidityWindow::new(at(0), at(60)).unwrap();
        assert!(!window.contains(at(-1)));
        assert!(window.contains(at(0)));
        assert!(window.contains(at(60)));
        assert!(!window.contains(at(61)));
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        assert!(ValidityWindow::new(at(10), at(0)).is_err());
    }

    #[test]
    fn window_around_start_uses_policy() {
        let window = ValidityWindow::around(at(3600), &AdmissionPolicy::default())
            .unwrap();
        assert_eq!(window.valid_from(), at(3600 - 1800));
        assert_eq!(window.valid_until(), at(3600 + 7200));
    }

    #[test]
    fn expiry_is_derived_not_stored() {
        let window = ValidityWindow::new(at(0), at(60)).unwrap();
        let ticket = Ticket::issue(EventId::new(), UserId::new(), window, at(0));
        assert_eq!(ticket.status_at(at(30)), TicketStatus::Active);
        assert_eq!(ticket.status_at(at(61)), TicketStatus::Expired);
        assert_eq!(ticket.state, TicketState::Active);
    }

    #[test]
    fn blank_location_is_unspecified() {
        assert_eq!(ScanLocation::named("  "), ScanLocation::Unspecified);
        assert_eq!(ScanLocation::named(" Gate A "), ScanLocation::Named("Gate A".to_string()));
        assert_eq!(ScanLocation::Unspecified.label(), "unspecified");
    }

    #[test]
    fn rotated_nonce_differs() {
        let nonce = SigningNonce::from_raw(7);
        assert_ne!(nonce.rotate(), nonce);
    }
}
