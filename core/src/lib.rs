//! # Admission Core
//!
//! Ticket types, the signed payload codec and the ticket store abstraction for
//! QR-based event admission.
//!
//! ## Core Concepts
//!
//! - **Ticket**: one admission for one (event, user) pair with an explicit
//!   lifecycle state (`Active`, `Used`, `Cancelled`; `Expired` is derived)
//! - **Payload**: the compact signed encoding of a ticket's claims, rendered as a QR code
//! - **Keyring**: signing keys with rotation; the newest signs, retired keys verify until a deadline
//! - **Store**: persistence with conditional writes, so each ticket is admitted exactly once
//! - **Clock**: injected time source
//!
//! ## Example
//!
//! ```
//! use admission_core::codec::{Claims, SigningKey, SigningKeyring, TokenCodec};
//! use admission_core::types::{EventId, Ticket, UserId, ValidityWindow};
//! use chrono::{Duration, SubsecRound, Utc};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let now = Utc::now().trunc_subsecs(0);
//! let window = ValidityWindow::new(now, now + Duration::hours(2))?;
//! let ticket = Ticket::issue(EventId::new(), UserId::new(), window, now);
//!
//! let codec = TokenCodec::new(SigningKeyring::new(SigningKey::generate("primary")?));
//! let payload = codec.encode(&Claims::for_ticket(&ticket))?;
//! let claims = codec.decode(payload.as_str(), now)?;
//! assert!(claims.binds(&ticket));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod environment;
pub mod memory;
pub mod store;
pub mod types;

pub use codec::{Claims, DecodeError, Payload, SigningKey, SigningKeyring, TokenCodec};
pub use environment::{Clock, SystemClock};
pub use memory::InMemoryTicketStore;
pub use store::{Precondition, StateCounts, StoreError, TicketChange, TicketStore, WriteOutcome};
pub use types::{
    AdmissionPolicy, Checkpoint, DeviceId, EventId, ScanLocation, ScanMetadata, SigningNonce, Ticket,
    TicketId, TicketState, TicketStatus, UserId, ValidityWindow,
};
