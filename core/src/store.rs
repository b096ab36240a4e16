//! Ticket store abstraction.
//!
//! The store persists one record per issued ticket and is the only source of
//! truth for lifecycle state. Every mutation goes through
//! [`TicketStore::transition`], a single conditional write keyed on the
//! expected current state (and optionally the expected signing nonce). There is
//! no read-then-write path: callers read, decide, and submit a precondition; if
//! another writer got there first the store reports the current record.
//!
//! # Implementations
//!
//! - `InMemoryTicketStore` (in this crate): a single `RwLock` over a map
//! - `PostgresTicketStore` (in `admission-postgres`): conditional `UPDATE ... RETURNING`
//!
//! # Example
//!
//! ```
//! use admission_core::memory::InMemoryTicketStore;
//! use admission_core::store::{Precondition, TicketChange, TicketStore, WriteOutcome};
//! use admission_core::types::{EventId, Ticket, TicketState, UserId, ValidityWindow};
//! use chrono::{Duration, Utc};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryTicketStore::new();
//! let now = Utc::now();
//! let window = ValidityWindow::new(now, now + Duration::hours(2))?;
//! let ticket = store.insert(Ticket::issue(EventId::new(), UserId::new(), window, now)).await?;
//!
//! let change = TicketChange::Cancel { at: now, reason: None };
//! let outcome = store
//!     .transition(ticket.id, Precondition::in_state(TicketState::Active), change)
//!     .await?;
//! assert!(matches!(outcome, WriteOutcome::Applied(t) if t.state == TicketState::Cancelled));
//! # Ok(())
//! # }
//! ```

use crate::types::{
    Cancellation, EventId, ScanMetadata, SigningNonce, Ticket, TicketId, TicketState, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`TicketStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors raised by ticket store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The (event, user) pair already holds an `Active` ticket.
    #[error("ticket {existing} is already active for this event and user")]
    ActiveTicketExists {
        /// The ticket currently holding the active slot
        existing: TicketId,
    },

    /// A ticket with this id was already inserted.
    #[error("ticket {0} already exists")]
    DuplicateTicket(TicketId),

    /// The requested change is not a legal lifecycle transition.
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition {
        /// State the precondition expected
        from: TicketState,
        /// State the change would produce
        to: TicketState,
    },

    /// Repeated conflicting writes exhausted the retry budget.
    #[error("ticket {ticket_id} still contended after {attempts} attempts")]
    Contention {
        /// Contended ticket
        ticket_id: TicketId,
        /// Attempts made
        attempts: u32,
    },

    /// Stored data could not be mapped back to a ticket.
    #[error("corrupt ticket record: {0}")]
    Corrupt(String),

    /// Backing storage could not be reached or failed mid-operation.
    #[error("ticket store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Contention { .. })
    }
}

/// Expected current state for a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Precondition {
    /// State the ticket must currently be in
    pub state: TicketState,
    /// Nonce the ticket must currently carry, if checked
    pub nonce: Option<SigningNonce>,
}

impl Precondition {
    /// Require only a lifecycle state
    #[must_use]
    pub const fn in_state(state: TicketState) -> Self {
        Self { state, nonce: None }
    }

    /// Additionally require the current signing nonce
    #[must_use]
    pub const fn with_nonce(mut self, nonce: SigningNonce) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Whether `ticket` satisfies this precondition
    #[must_use]
    pub fn holds(&self, ticket: &Ticket) -> bool {
        ticket.state == self.state && self.nonce.is_none_or(|nonce| nonce == ticket.signing_nonce)
    }
}

/// A lifecycle mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TicketChange {
    /// `Active -> Used`, recording scan metadata once
    MarkUsed(ScanMetadata),
    /// `Active -> Active` with a new nonce; clears scan metadata
    RotateNonce(SigningNonce),
    /// `Active | Used -> Cancelled`
    Cancel {
        /// Cancellation time
        at: DateTime<Utc>,
        /// Optional operator-supplied reason
        reason: Option<String>,
    },
}

impl TicketChange {
    /// State the ticket is in after the change
    #[must_use]
    pub const fn target_state(&self) -> TicketState {
        match self {
            Self::MarkUsed(_) => TicketState::Used,
            Self::RotateNonce(_) => TicketState::Active,
            Self::Cancel { .. } => TicketState::Cancelled,
        }
    }

    /// Reject changes the lifecycle does not permit from `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] for an illegal pair.
    pub fn check_from(&self, from: TicketState) -> Result<(), StoreError> {
        let to = self.target_state();
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition { from, to })
        }
    }

    /// Produce the record after applying this change to `ticket`.
    #[must_use]
    pub fn apply(&self, ticket: &Ticket) -> Ticket {
        let mut next = ticket.clone();
        next.state = self.target_state();
        match self {
            Self::MarkUsed(scan) => next.scan = Some(scan.clone()),
            Self::RotateNonce(nonce) => {
                next.signing_nonce = *nonce;
                next.regeneration_count = next.regeneration_count.saturating_add(1);
                next.scan = None;
            }
            Self::Cancel { at, reason } => {
                next.cancellation = Some(Cancellation {
                    at: *at,
                    reason: reason.clone(),
                });
            }
        }
        next
    }
}

/// Result of a conditional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The precondition held; the updated record
    Applied(Ticket),
    /// The precondition did not hold; the current record, unchanged
    Conflict(Ticket),
    /// No ticket with that id
    NotFound,
}

/// Persisted state distribution for one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Tickets in `Active` (including expired ones)
    pub active: u64,
    /// Tickets in `Used`
    pub used: u64,
    /// Tickets in `Cancelled`
    pub cancelled: u64,
}

impl StateCounts {
    /// Tickets ever issued for the event
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.active + self.used + self.cancelled
    }

    /// Tickets still held by registered attendees (everything not cancelled)
    #[must_use]
    pub const fn registered(&self) -> u64 {
        self.active + self.used
    }

    /// Count one ticket in `state`
    pub fn add(&mut self, state: TicketState) {
        match state {
            TicketState::Active => self.active += 1,
            TicketState::Used => self.used += 1,
            TicketState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Storage for ticket records.
///
/// Implementations must be `Send + Sync`; the engine shares one store across
/// every checkpoint. Methods return boxed futures so the trait can be used as
/// `Arc<dyn TicketStore>`.
pub trait TicketStore: Send + Sync {
    /// Insert a newly issued ticket.
    ///
    /// The one-active-ticket-per-pair rule is enforced by the store itself
    /// (a unique index or an index map updated under the same lock).
    ///
    /// # Errors
    ///
    /// - `ActiveTicketExists`: the pair already holds an `Active` ticket
    /// - `DuplicateTicket`: the id is already taken
    /// - `Unavailable`: storage failure
    fn insert(&self, ticket: Ticket) -> StoreFuture<'_, Ticket>;

    /// Fetch a ticket by id.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on storage failure.
    fn get(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// All tickets of an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on storage failure.
    fn list_by_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<Ticket>>;

    /// All tickets of a user across events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on storage failure.
    fn list_by_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<Ticket>>;

    /// Persisted state distribution for an event.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on storage failure.
    fn state_counts(&self, event_id: EventId) -> StoreFuture<'_, StateCounts>;

    /// Apply `change` if and only if `precondition` holds, atomically.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition`: `change` is illegal from `precondition.state`
    /// - `Unavailable`: storage failure
    fn transition(
        &self,
        id: TicketId,
        precondition: Precondition,
        change: TicketChange,
    ) -> StoreFuture<'_, WriteOutcome>;

    /// Check the store can serve requests.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when storage is unreachable.
    fn ping(&self) -> StoreFuture<'_, ()>;
}
