//! Ticket issuance and lifecycle management.
//!
//! [`IssuanceService`] is called with an already authenticated, already
//! eligible (event, user) pair. It creates the ticket, signs its payload and
//! later regenerates or cancels it. Every write is a conditional store
//! transition; there is no read-then-write path.

use crate::attendance::percentage;
use crate::metrics;
use admission_core::codec::{Claims, EncodeError, Payload, TokenCodec};
use admission_core::environment::Clock;
use admission_core::store::{Precondition, StoreError, TicketChange, TicketStore, WriteOutcome};
use admission_core::types::{
    AdmissionPolicy, EventId, Ticket, TicketId, TicketState, TicketStatus, UserId, ValidityWindow, WindowError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Largest accepted batch for [`IssuanceService::issue_batch`].
pub const MAX_BATCH_ISSUE: usize = 500;

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Errors from issuance operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    /// The pair already holds an `Active` ticket.
    #[error("an active ticket ({existing}) already exists for this event and user")]
    AlreadyIssued {
        /// The ticket holding the active slot
        existing: TicketId,
    },

    /// The operation needs an `Active`, unexpired ticket.
    #[error("ticket {ticket_id} is {status}")]
    NotActive {
        /// Ticket
        ticket_id: TicketId,
        /// Observed status
        status: TicketStatus,
    },

    /// No such ticket.
    #[error("ticket {0} not found")]
    NotFound(TicketId),

    /// The requested window is inverted.
    #[error(transparent)]
    InvalidWindow(#[from] WindowError),

    /// More users than [`MAX_BATCH_ISSUE`].
    #[error("batch of {size} users exceeds the limit of {max}")]
    BatchTooLarge {
        /// Submitted size
        size: usize,
        /// Limit
        max: usize,
    },

    /// The payload could not be signed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A ticket together with its current signed payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTicket {
    /// Stored ticket
    pub ticket: Ticket,
    /// Payload to render as a QR code
    pub payload: Payload,
}

/// Per-user result of [`IssuanceService::issue_batch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// A new ticket was issued
    Issued {
        /// User
        user_id: UserId,
        /// New ticket and payload
        issued: IssuedTicket,
    },
    /// The user already held an active ticket
    Skipped {
        /// User
        user_id: UserId,
        /// The ticket they hold
        existing: TicketId,
    },
}

/// Result of cancelling every ticket of an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCancellation {
    /// Tickets moved to `Cancelled` by this call
    pub cancelled: u64,
    /// Tickets that were already cancelled
    pub already_cancelled: u64,
}

/// Ticket counts by observed status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDistribution {
    /// Admissible now or later
    pub active: u64,
    /// Admitted
    pub used: u64,
    /// Cancelled
    pub cancelled: u64,
    /// Active but past the window
    pub expired: u64,
}

impl StatusDistribution {
    fn add(&mut self, status: TicketStatus) {
        match status {
            TicketStatus::Active => self.active += 1,
            TicketStatus::Used => self.used += 1,
            TicketStatus::Cancelled => self.cancelled += 1,
            TicketStatus::Expired => self.expired += 1,
        }
    }
}

/// A ticket with its status at read time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketListing {
    /// Stored ticket
    pub ticket: Ticket,
    /// Status derived at read time
    pub status: TicketStatus,
}

/// Scan history of one event, read from the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    /// Event
    pub event_id: EventId,
    /// Tickets, oldest first
    pub tickets: Vec<TicketListing>,
    /// Counts by status
    pub distribution: StatusDistribution,
    /// Used tickets as a percentage of non-cancelled tickets
    pub attendance_rate: f64,
    /// Read time
    pub generated_at: DateTime<Utc>,
}

/// Issues, regenerates and cancels tickets.
pub struct IssuanceService {
    store: Arc<dyn TicketStore>,
    codec: Arc<TokenCodec>,
    clock: Arc<dyn Clock>,
    policy: AdmissionPolicy,
}

impl IssuanceService {
    /// Create a service over `store`, signing payloads with `codec`
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        codec: Arc<TokenCodec>,
        clock: Arc<dyn Clock>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            policy,
        }
    }

    /// Admission policy used by [`window_for`](Self::window_for)
    #[must_use]
    pub const fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Window derived from an event start under the configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::InvalidWindow`] if the policy inverts the bounds.
    pub fn window_for(&self, starts_at: DateTime<Utc>) -> Result<ValidityWindow, IssuanceError> {
        Ok(ValidityWindow::around(starts_at, &self.policy)?)
    }

    /// Issue a ticket for an eligible pair.
    ///
    /// # Errors
    ///
    /// - [`IssuanceError::AlreadyIssued`] if the pair already holds an `Active` ticket
    /// - [`IssuanceError::Encode`] / [`IssuanceError::Store`] on failure
    pub async fn issue(
        &self,
        event_id: EventId,
        user_id: UserId,
        window: ValidityWindow,
    ) -> Result<IssuedTicket, IssuanceError> {
        let ticket = Ticket::issue(event_id, user_id, window, self.clock.now());
        let ticket = self.store.insert(ticket).await.map_err(|e| match e {
            StoreError::ActiveTicketExists { existing } => IssuanceError::AlreadyIssued { existing },
            other => IssuanceError::Store(other),
        })?;

        let payload = self.codec.encode(&Claims::for_ticket(&ticket))?;
        tracing::info!(
            ticket_id = %ticket.id,
            event_id = %event_id,
            user_id = %user_id,
            valid_from = %ticket.window.valid_from(),
            valid_until = %ticket.window.valid_until(),
            "Ticket issued"
        );
        metrics::record_tickets_issued(1);

        Ok(IssuedTicket { ticket, payload })
    }

    /// Issue tickets for many users of one event, skipping users who already hold one.
    ///
    /// Outcomes are returned in input order.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::BatchTooLarge`] before issuing anything, or the
    /// first failure other than an existing ticket.
    pub async fn issue_batch(
        &self,
        event_id: EventId,
        user_ids: &[UserId],
        window: ValidityWindow,
    ) -> Result<Vec<BatchOutcome>, IssuanceError> {
        if user_ids.len() > MAX_BATCH_ISSUE {
            return Err(IssuanceError::BatchTooLarge {
                size: user_ids.len(),
                max: MAX_BATCH_ISSUE,
            });
        }

        let mut outcomes = Vec::with_capacity(user_ids.len());
        for &user_id in user_ids {
            let outcome = match self.issue(event_id, user_id, window).await {
                Ok(issued) => BatchOutcome::Issued { user_id, issued },
                Err(IssuanceError::AlreadyIssued { existing }) => {
                    tracing::debug!(user_id = %user_id, existing = %existing, "Skipping user with active ticket");
                    BatchOutcome::Skipped { user_id, existing }
                }
                Err(e) => return Err(e),
            };
            outcomes.push(outcome);
        }

        let issued = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, BatchOutcome::Issued { .. }))
            .count();
        tracing::info!(event_id = %event_id, requested = user_ids.len(), issued, "Batch issuance finished");
        Ok(outcomes)
    }

    /// Rotate the nonce of an `Active` ticket and return its fresh payload.
    ///
    /// Every earlier payload for the ticket stops verifying. Eligibility is not
    /// re-checked.
    ///
    /// # Errors
    ///
    /// - [`IssuanceError::NotFound`] if the ticket does not exist
    /// - [`IssuanceError::NotActive`] if it is used, cancelled or expired
    pub async fn regenerate(&self, ticket_id: TicketId) -> Result<IssuedTicket, IssuanceError> {
        let mut ticket = self.load(ticket_id).await?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let status = ticket.status_at(self.clock.now());
            if status != TicketStatus::Active {
                return Err(IssuanceError::NotActive { ticket_id, status });
            }

            let precondition = Precondition::in_state(TicketState::Active).with_nonce(ticket.signing_nonce);
            let change = TicketChange::RotateNonce(ticket.signing_nonce.rotate());
            match self.store.transition(ticket_id, precondition, change).await? {
                WriteOutcome::Applied(rotated) => {
                    let payload = self.codec.encode(&Claims::for_ticket(&rotated))?;
                    tracing::info!(
                        ticket_id = %ticket_id,
                        regeneration_count = rotated.regeneration_count,
                        "Ticket payload regenerated"
                    );
                    metrics::record_ticket_regenerated();
                    return Ok(IssuedTicket {
                        ticket: rotated,
                        payload,
                    });
                }
                WriteOutcome::Conflict(current) => {
                    tracing::debug!(ticket_id = %ticket_id, attempt, "Regeneration raced another write");
                    ticket = current;
                }
                WriteOutcome::NotFound => return Err(IssuanceError::NotFound(ticket_id)),
            }
        }

        Err(StoreError::Contention {
            ticket_id,
            attempts: MAX_WRITE_ATTEMPTS,
        }
        .into())
    }

    /// Cancel a ticket. Cancelling an already cancelled ticket returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::NotFound`] if the ticket does not exist.
    pub async fn cancel(&self, ticket_id: TicketId, reason: Option<String>) -> Result<Ticket, IssuanceError> {
        let ticket = self.load(ticket_id).await?;
        match self.cancel_loaded(ticket, reason).await? {
            Cancelled::Now(ticket) | Cancelled::Already(ticket) => Ok(ticket),
        }
    }

    /// Cancel every ticket of an event.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::Store`] on the first storage failure; tickets
    /// cancelled before it stay cancelled.
    pub async fn cancel_event(
        &self,
        event_id: EventId,
        reason: Option<String>,
    ) -> Result<EventCancellation, IssuanceError> {
        let mut summary = EventCancellation::default();
        for ticket in self.store.list_by_event(event_id).await? {
            match self.cancel_loaded(ticket, reason.clone()).await? {
                Cancelled::Now(_) => summary.cancelled += 1,
                Cancelled::Already(_) => summary.already_cancelled += 1,
            }
        }
        tracing::info!(
            event_id = %event_id,
            cancelled = summary.cancelled,
            already_cancelled = summary.already_cancelled,
            "Event tickets cancelled"
        );
        Ok(summary)
    }

    /// Re-render the current payload of an `Active` ticket.
    ///
    /// # Errors
    ///
    /// - [`IssuanceError::NotFound`] if the ticket does not exist
    /// - [`IssuanceError::NotActive`] if it is used, cancelled or expired
    pub async fn payload(&self, ticket_id: TicketId) -> Result<IssuedTicket, IssuanceError> {
        let ticket = self.load(ticket_id).await?;
        let status = ticket.status_at(self.clock.now());
        if status != TicketStatus::Active {
            return Err(IssuanceError::NotActive { ticket_id, status });
        }
        let payload = self.codec.encode(&Claims::for_ticket(&ticket))?;
        Ok(IssuedTicket { ticket, payload })
    }

    /// Fetch a ticket with its current status.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::NotFound`] if the ticket does not exist.
    pub async fn ticket(&self, ticket_id: TicketId) -> Result<TicketListing, IssuanceError> {
        let ticket = self.load(ticket_id).await?;
        let status = ticket.status_at(self.clock.now());
        Ok(TicketListing { ticket, status })
    }

    /// Every ticket a user holds, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::Store`] on storage failure.
    pub async fn user_tickets(&self, user_id: UserId) -> Result<Vec<TicketListing>, IssuanceError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_by_user(user_id)
            .await?
            .into_iter()
            .map(|ticket| TicketListing {
                status: ticket.status_at(now),
                ticket,
            })
            .collect())
    }

    /// Tickets of an event with their status distribution.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::Store`] on storage failure.
    pub async fn event_report(&self, event_id: EventId) -> Result<EventReport, IssuanceError> {
        let now = self.clock.now();
        let mut distribution = StatusDistribution::default();
        let tickets: Vec<TicketListing> = self
            .store
            .list_by_event(event_id)
            .await?
            .into_iter()
            .map(|ticket| {
                let status = ticket.status_at(now);
                distribution.add(status);
                TicketListing { ticket, status }
            })
            .collect();

        let registered = distribution.active + distribution.used + distribution.expired;
        Ok(EventReport {
            event_id,
            tickets,
            distribution,
            attendance_rate: percentage(distribution.used, registered),
            generated_at: now,
        })
    }

    async fn load(&self, ticket_id: TicketId) -> Result<Ticket, IssuanceError> {
        self.store
            .get(ticket_id)
            .await?
            .ok_or(IssuanceError::NotFound(ticket_id))
    }

    async fn cancel_loaded(&self, mut ticket: Ticket, reason: Option<String>) -> Result<Cancelled, IssuanceError> {
        let ticket_id = ticket.id;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if ticket.state == TicketState::Cancelled {
                return Ok(Cancelled::Already(ticket));
            }

            let change = TicketChange::Cancel {
                at: self.clock.now(),
                reason: reason.clone(),
            };
            match self
                .store
                .transition(ticket_id, Precondition::in_state(ticket.state), change)
                .await?
            {
                WriteOutcome::Applied(cancelled) => {
                    tracing::info!(
                        ticket_id = %ticket_id,
                        event_id = %cancelled.event_id,
                        from = %ticket.state,
                        reason = reason.as_deref().unwrap_or(""),
                        "Ticket cancelled"
                    );
                    metrics::record_ticket_cancelled();
                    return Ok(Cancelled::Now(cancelled));
                }
                WriteOutcome::Conflict(current) => {
                    tracing::debug!(ticket_id = %ticket_id, attempt, "Cancellation raced another write");
                    ticket = current;
                }
                WriteOutcome::NotFound => return Err(IssuanceError::NotFound(ticket_id)),
            }
        }

        Err(StoreError::Contention {
            ticket_id,
            attempts: MAX_WRITE_ATTEMPTS,
        }
        .into())
    }
}

enum Cancelled {
    Now(Ticket),
    Already(Ticket),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use admission_core::memory::InMemoryTicketStore;
    use admission_core::types::{Checkpoint, DeviceId, ScanLocation, ScanMetadata};
    use admission_testing::{ManualClock, test_clock, test_codec, window_starting_at};
    use chrono::Duration;

    fn service(clock: &Arc<ManualClock>) -> (IssuanceService, Arc<InMemoryTicketStore>) {
        let store = Arc::new(InMemoryTicketStore::new());
        let service = IssuanceService::new(
            store.clone(),
            Arc::new(test_codec()),
            clock.clone(),
            AdmissionPolicy::default(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn second_issue_for_pair_is_already_issued() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, _) = service(&clock);
        let (event, user) = (EventId::new(), UserId::new());
        let window = window_starting_at(clock.now(), Duration::hours(2));

        let first = service.issue(event, user, window).await.unwrap();
        let second = service.issue(event, user, window).await.unwrap_err();
        assert_eq!(
            second,
            IssuanceError::AlreadyIssued {
                existing: first.ticket.id
            }
        );
    }

    #[tokio::test]
    async fn regenerate_rejects_expired_ticket() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, _) = service(&clock);
        let window = window_starting_at(clock.now(), Duration::hours(1));
        let issued = service.issue(EventId::new(), UserId::new(), window).await.unwrap();

        clock.advance(Duration::hours(2));
        let err = service.regenerate(issued.ticket.id).await.unwrap_err();
        assert_eq!(
            err,
            IssuanceError::NotActive {
                ticket_id: issued.ticket.id,
                status: TicketStatus::Expired
            }
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_frees_the_pair() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, _) = service(&clock);
        let (event, user) = (EventId::new(), UserId::new());
        let window = window_starting_at(clock.now(), Duration::hours(2));
        let issued = service.issue(event, user, window).await.unwrap();

        let first = service.cancel(issued.ticket.id, Some("unregistered".into())).await.unwrap();
        let again = service.cancel(issued.ticket.id, None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(again.cancellation.unwrap().reason.as_deref(), Some("unregistered"));

        service.issue(event, user, window).await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_used_ticket_does_not_free_a_reissued_pair() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, store) = service(&clock);
        let (event, user) = (EventId::new(), UserId::new());
        let window = window_starting_at(clock.now(), Duration::hours(2));

        let first = service.issue(event, user, window).await.unwrap();
        let gate = Checkpoint::new(DeviceId::new("gate-1"), ScanLocation::named("Main"), clock.now());
        store
            .transition(
                first.ticket.id,
                Precondition::in_state(TicketState::Active),
                TicketChange::MarkUsed(ScanMetadata::from_checkpoint(&gate, clock.now())),
            )
            .await
            .unwrap();
        let second = service.issue(event, user, window).await.unwrap();

        service.cancel(first.ticket.id, None).await.unwrap();
        let err = service.issue(event, user, window).await.unwrap_err();
        assert_eq!(
            err,
            IssuanceError::AlreadyIssued {
                existing: second.ticket.id
            }
        );
        let active = service
            .user_tickets(user)
            .await
            .unwrap()
            .into_iter()
            .filter(|listing| listing.status == TicketStatus::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn batch_limit_is_checked_before_issuing() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, store) = service(&clock);
        let users: Vec<UserId> = (0..=MAX_BATCH_ISSUE).map(|_| UserId::new()).collect();
        let window = window_starting_at(clock.now(), Duration::hours(2));

        let err = service.issue_batch(EventId::new(), &users, window).await.unwrap_err();
        assert!(matches!(err, IssuanceError::BatchTooLarge { size: 501, max: 500 }));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn report_counts_expired_separately() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let (service, _) = service(&clock);
        let event = EventId::new();
        let short = window_starting_at(clock.now(), Duration::minutes(10));
        let long = window_starting_at(clock.now(), Duration::hours(3));

        service.issue(event, UserId::new(), short).await.unwrap();
        service.issue(event, UserId::new(), long).await.unwrap();
        let cancelled = service.issue(event, UserId::new(), long).await.unwrap();
        service.cancel(cancelled.ticket.id, None).await.unwrap();

        clock.advance(Duration::hours(1));
        let report = service.event_report(event).await.unwrap();
        assert_eq!(
            report.distribution,
            StatusDistribution {
                active: 1,
                used: 0,
                cancelled: 1,
                expired: 1
            }
        );
        assert_eq!(report.tickets.len(), 3);
        assert_eq!(report.attendance_rate, 0.0);
    }
}
