//! Validation engine.
//!
//! Turns a scanned payload plus checkpoint metadata into a structured
//! [`ValidationResult`], transitioning the ticket `Active -> Used` at most
//! once no matter how many checkpoints scan it concurrently.
//!
//! Every outcome a caller can act on ("invalid ticket") is an `Ok` value; only
//! the store being unreachable or persistently contended ("could not check")
//! is an `Err`.

use crate::attendance::{AttendanceAggregator, ScanAttempt};
use crate::metrics;
use admission_core::codec::{Claims, DecodeError, TokenCodec};
use admission_core::environment::Clock;
use admission_core::store::{Precondition, StoreError, TicketChange, TicketStore, WriteOutcome};
use admission_core::types::{Checkpoint, EventId, ScanMetadata, Ticket, TicketId, TicketState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Largest accepted batch for [`ValidationEngine::validate_batch`].
pub const MAX_BATCH_VALIDATE: usize = 100;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Why a scan was admitted or rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    /// First successful scan; the ticket is now `Used`
    Admitted,
    /// Not a payload this service produced
    Malformed,
    /// Tampered, forged, signed by a retired key, or superseded by regeneration
    SignatureInvalid,
    /// Authentic payload naming a ticket the store does not hold
    NotFound,
    /// Ticket was cancelled
    Cancelled,
    /// Ticket was already admitted
    AlreadyUsed,
    /// Scanned outside the validity window
    OutOfWindow,
}

impl ValidationReason {
    /// Label used for metrics and logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Malformed => "malformed",
            Self::SignatureInvalid => "signature_invalid",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::AlreadyUsed => "already_used",
            Self::OutOfWindow => "out_of_window",
        }
    }
}

impl std::fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the holder may enter
    pub valid: bool,
    /// Why
    pub reason: ValidationReason,
    /// The stored ticket, when the payload verified against it
    pub ticket: Option<Ticket>,
    /// The ticket was already admitted by an earlier scan
    pub is_duplicate: bool,
}

impl ValidationResult {
    fn admitted(ticket: Ticket) -> Self {
        Self {
            valid: true,
            reason: ValidationReason::Admitted,
            ticket: Some(ticket),
            is_duplicate: false,
        }
    }

    fn rejected(reason: ValidationReason, ticket: Option<Ticket>) -> Self {
        Self {
            valid: false,
            reason,
            ticket,
            is_duplicate: reason == ValidationReason::AlreadyUsed,
        }
    }
}

/// Errors from batch validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// More payloads than [`MAX_BATCH_VALIDATE`].
    #[error("batch of {size} payloads exceeds the limit of {max}")]
    BatchTooLarge {
        /// Submitted size
        size: usize,
        /// Limit
        max: usize,
    },

    /// The store could not be consulted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Attribution {
    event_id: Option<EventId>,
    ticket_id: Option<TicketId>,
}

impl Attribution {
    const NONE: Self = Self {
        event_id: None,
        ticket_id: None,
    };

    const fn of(claims: &Claims) -> Self {
        Self {
            event_id: Some(claims.event_id),
            ticket_id: Some(claims.ticket_id),
        }
    }
}

/// Validates scanned payloads against the ticket store.
pub struct ValidationEngine {
    store: Arc<dyn TicketStore>,
    codec: Arc<TokenCodec>,
    clock: Arc<dyn Clock>,
    attendance: Option<AttendanceAggregator>,
    max_attempts: u32,
}

impl ValidationEngine {
    /// Create an engine without attendance forwarding
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, codec: Arc<TokenCodec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            codec,
            clock,
            attendance: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Forward every outcome to `aggregator`
    #[must_use]
    pub fn with_attendance(mut self, aggregator: AttendanceAggregator) -> Self {
        self.attendance = Some(aggregator);
        self
    }

    /// Bound on conditional-write attempts per scan
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Validate one scanned payload.
    ///
    /// The window is judged with the server clock; `checkpoint.timestamp` is
    /// persisted as the scan time for audit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the store cannot be reached and
    /// [`StoreError::Contention`] if the retry budget is exhausted.
    pub async fn validate(&self, payload: &str, checkpoint: &Checkpoint) -> Result<ValidationResult, StoreError> {
        let started = Instant::now();
        let outcome = self.evaluate(payload, checkpoint).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok((result, attribution)) => {
                metrics::record_scan(result.reason, elapsed);
                self.forward(&result, attribution, checkpoint);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    device_id = %checkpoint.device_id.as_str(),
                    "Validation could not reach the ticket store"
                );
                metrics::record_scan_failure(elapsed);
                Err(e)
            }
        }
    }

    /// Validate up to [`MAX_BATCH_VALIDATE`] payloads in order, one result each.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BatchTooLarge`] before validating anything,
    /// or the first store failure.
    pub async fn validate_batch(
        &self,
        payloads: &[String],
        checkpoint: &Checkpoint,
    ) -> Result<Vec<ValidationResult>, ValidationError> {
        if payloads.len() > MAX_BATCH_VALIDATE {
            return Err(ValidationError::BatchTooLarge {
                size: payloads.len(),
                max: MAX_BATCH_VALIDATE,
            });
        }
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            results.push(self.validate(payload, checkpoint).await?);
        }
        Ok(results)
    }

    async fn evaluate(
        &self,
        payload: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(ValidationResult, Attribution), StoreError> {
        let now = self.clock.now();

        let claims = match self.codec.decode(payload, now) {
            Ok(claims) => claims,
            // Expiry is judged against the stored ticket below so a used
            // ticket still reads as a duplicate after its window closes.
            Err(DecodeError::Expired(claims)) => *claims,
            Err(DecodeError::Malformed(why)) => {
                tracing::debug!(why, device_id = %checkpoint.device_id.as_str(), "Rejected malformed payload");
                return Ok((
                    ValidationResult::rejected(ValidationReason::Malformed, None),
                    Attribution::NONE,
                ));
            }
            Err(DecodeError::SignatureInvalid) => {
                tracing::warn!(device_id = %checkpoint.device_id.as_str(), "Rejected payload with invalid signature");
                return Ok((
                    ValidationResult::rejected(ValidationReason::SignatureInvalid, None),
                    Attribution::NONE,
                ));
            }
        };
        let attribution = Attribution::of(&claims);

        let Some(mut ticket) = self.store.get(claims.ticket_id).await? else {
            tracing::warn!(ticket_id = %claims.ticket_id, "Authentic payload for unknown ticket");
            return Ok((ValidationResult::rejected(ValidationReason::NotFound, None), attribution));
        };

        let precondition = Precondition::in_state(TicketState::Active).with_nonce(claims.nonce);
        for attempt in 1..=self.max_attempts {
            if let Some(verdict) = judge(&claims, ticket, now) {
                return Ok((verdict, attribution));
            }

            let scan = ScanMetadata::from_checkpoint(checkpoint, now);
            match self
                .store
                .transition(claims.ticket_id, precondition, TicketChange::MarkUsed(scan))
                .await?
            {
                WriteOutcome::Applied(used) => {
                    tracing::info!(
                        ticket_id = %used.id,
                        event_id = %used.event_id,
                        location = %checkpoint.location,
                        device_id = %checkpoint.device_id.as_str(),
                        "Ticket admitted"
                    );
                    return Ok((ValidationResult::admitted(used), attribution));
                }
                WriteOutcome::Conflict(current) => {
                    tracing::debug!(ticket_id = %current.id, attempt, state = %current.state, "Lost admission race, re-evaluating");
                    ticket = current;
                }
                WriteOutcome::NotFound => {
                    return Ok((ValidationResult::rejected(ValidationReason::NotFound, None), attribution));
                }
            }
        }

        Err(StoreError::Contention {
            ticket_id: claims.ticket_id,
            attempts: self.max_attempts,
        })
    }

    fn forward(&self, result: &ValidationResult, attribution: Attribution, checkpoint: &Checkpoint) {
        let Some(aggregator) = &self.attendance else {
            return;
        };
        aggregator.record(ScanAttempt {
            ticket_id: attribution.ticket_id,
            event_id: attribution.event_id,
            scanned_at: checkpoint.timestamp,
            device_id: checkpoint.device_id.clone(),
            location: checkpoint.location.clone(),
            reason: result.reason,
        });
    }
}

/// Decide a scan against the current record, or `None` to attempt admission.
fn judge(claims: &Claims, ticket: Ticket, now: DateTime<Utc>) -> Option<ValidationResult> {
    if !claims.binds(&ticket) {
        tracing::warn!(
            ticket_id = %ticket.id,
            regeneration_count = ticket.regeneration_count,
            "Payload claims do not match stored ticket"
        );
        return Some(ValidationResult::rejected(ValidationReason::SignatureInvalid, None));
    }

    match ticket.state {
        TicketState::Cancelled => Some(ValidationResult::rejected(ValidationReason::Cancelled, Some(ticket))),
        TicketState::Used => {
            tracing::info!(ticket_id = %ticket.id, "Duplicate scan of used ticket");
            Some(ValidationResult::rejected(ValidationReason::AlreadyUsed, Some(ticket)))
        }
        TicketState::Active if !ticket.is_admissible_at(now) => {
            tracing::debug!(ticket_id = %ticket.id, %now, "Scan outside validity window");
            Some(ValidationResult::rejected(ValidationReason::OutOfWindow, Some(ticket)))
        }
        TicketState::Active => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_flag_follows_reason() {
        assert!(ValidationResult::rejected(ValidationReason::AlreadyUsed, None).is_duplicate);
        assert!(!ValidationResult::rejected(ValidationReason::OutOfWindow, None).is_duplicate);
    }

    #[test]
    fn reasons_serialize_as_snake_case() {
        let json = serde_json::to_string(&ValidationReason::SignatureInvalid).unwrap();
        assert_eq!(json, "\"signature_invalid\"");
        assert_eq!(ValidationReason::OutOfWindow.as_str(), "out_of_window");
    }
}
