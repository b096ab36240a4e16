//! Application state for the admission HTTP server.
//!
//! Contains the shared services needed by handlers. Cloned (cheaply, via
//! `Arc`) for each request.

use crate::attendance::AttendanceAggregator;
use crate::issuance::IssuanceService;
use crate::validation::ValidationEngine;
use admission_core::environment::Clock;
use admission_core::store::TicketStore;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ticket store, for readiness checks
    pub store: Arc<dyn TicketStore>,

    /// Issuance, regeneration and cancellation
    pub issuance: Arc<IssuanceService>,

    /// Scan validation
    pub validation: Arc<ValidationEngine>,

    /// Live attendance boards
    pub attendance: AttendanceAggregator,

    /// Server clock, used to default missing scan timestamps
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        issuance: Arc<IssuanceService>,
        validation: Arc<ValidationEngine>,
        attendance: AttendanceAggregator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            issuance,
            validation,
            attendance,
            clock,
        }
    }
}
