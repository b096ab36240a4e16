//! # Admission
//!
//! QR admission ticketing for campus events: issue a signed ticket per
//! registration, validate it exactly once at the door, and aggregate live
//! attendance.
//!
//! # Architecture
//!
//! ```text
//!   registration ──► IssuanceService ──┐             ┌──► AttendanceAggregator ──► dashboard
//!                         │            │             │        (worker + board)
//!                    TokenCodec     TicketStore ◄────┤
//!                         │     (memory | postgres)  │
//!   checkpoint ───► ValidationEngine ──┘─────────────┘
//! ```
//!
//! - **Issuance**: one `Active` ticket per (event, user), enforced by the store
//! - **Validation**: decode, verify, judge, then a single conditional
//!   `Active -> Used` write; concurrent scans yield exactly one admission
//! - **Attendance**: a read model fed by a bounded channel and republished on
//!   an interval, so dashboard reads never wait on scans
//!
//! # Usage
//!
//! ```bash
//! SIGNING_KEY=$(openssl rand -base64 32) cargo run --bin server
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod attendance;
pub mod config;
pub mod issuance;
pub mod metrics;
pub mod server;
pub mod validation;

pub use app::{AdmissionApp, AppInitError};
pub use attendance::{AttendanceAggregator, AttendanceSnapshot, TimeRange};
pub use config::Config;
pub use issuance::{IssuanceError, IssuanceService, IssuedTicket};
pub use validation::{ValidationEngine, ValidationReason, ValidationResult};
