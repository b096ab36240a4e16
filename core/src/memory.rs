//! In-memory ticket store.
//!
//! A single `RwLock` guards both the ticket map and the active-pair index, so
//! the uniqueness check and the insert happen under one write guard and reads
//! proceed in parallel. Used for development, single-node deployments and
//! tests.

use crate::store::{Precondition, StateCounts, StoreError, StoreFuture, TicketChange, TicketStore, WriteOutcome};
use crate::types::{EventId, Ticket, TicketId, TicketState, UserId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Inner {
    tickets: HashMap<TicketId, Ticket>,
    active: HashMap<(EventId, UserId), TicketId>,
}

/// `RwLock`-backed [`TicketStore`].
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTicketStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryTicketStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tickets
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the lock was poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.tickets.len())
    }

    /// Whether the store holds no tickets
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the lock was poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("ticket map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("ticket map lock poisoned".to_string()))
    }

    fn collect<F>(&self, mut keep: F) -> Result<Vec<Ticket>, StoreError>
    where
        F: FnMut(&Ticket) -> bool,
    {
        let inner = self.read()?;
        Ok(inner.tickets.values().filter(|t| keep(t)).cloned().collect())
    }
}

impl TicketStore for InMemoryTicketStore {
    fn insert(&self, ticket: Ticket) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let mut inner = self.write()?;
            if inner.tickets.contains_key(&ticket.id) {
                return Err(StoreError::DuplicateTicket(ticket.id));
            }
            let pair = (ticket.event_id, ticket.user_id);
            if ticket.state == TicketState::Active {
                if let Some(existing) = inner.active.get(&pair) {
                    return Err(StoreError::ActiveTicketExists { existing: *existing });
                }
                inner.active.insert(pair, ticket.id);
            }
            inner.tickets.insert(ticket.id, ticket.clone());
            Ok(ticket)
        })
    }

    fn get(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move { Ok(self.read()?.tickets.get(&id).cloned()) })
    }

    fn list_by_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let mut tickets = self.collect(|t| t.event_id == event_id)?;
            tickets.sort_by_key(|t| (t.issued_at, t.id));
            Ok(tickets)
        })
    }

    fn list_by_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let mut tickets = self.collect(|t| t.user_id == user_id)?;
            tickets.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(a.id.cmp(&b.id)));
            Ok(tickets)
        })
    }

    fn state_counts(&self, event_id: EventId) -> StoreFuture<'_, StateCounts> {
        Box::pin(async move {
            let inner = self.read()?;
            let mut counts = StateCounts::default();
            for ticket in inner.tickets.values().filter(|t| t.event_id == event_id) {
                counts.add(ticket.state);
            }
            Ok(counts)
        })
    }

    fn transition(
        &self,
        id: TicketId,
        precondition: Precondition,
        change: TicketChange,
    ) -> StoreFuture<'_, WriteOutcome> {
        Box::pin(async move {
            change.check_from(precondition.state)?;

            let mut inner = self.write()?;
            let Some(current) = inner.tickets.get(&id) else {
                return Ok(WriteOutcome::NotFound);
            };
            if !precondition.holds(current) {
                return Ok(WriteOutcome::Conflict(current.clone()));
            }

            let next = change.apply(current);
            let pair = (next.event_id, next.user_id);
            // The pair may already hold a newer active ticket.
            if next.state != TicketState::Active && inner.active.get(&pair) == Some(&id) {
                inner.active.remove(&pair);
            }
            inner.tickets.insert(id, next.clone());
            Ok(WriteOutcome::Applied(next))
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.read().map(|_| ()) })
    }
}
