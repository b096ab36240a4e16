//! `PostgreSQL` ticket store for the admission pipeline.
//!
//! Implements [`TicketStore`](admission_core::store::TicketStore) on top of a
//! `sqlx` connection pool:
//!
//! - One-active-ticket-per-pair enforced by a partial unique index
//! - Lifecycle transitions as a single conditional `UPDATE ... RETURNING`
//! - Plain `SELECT`s for reads, so checkpoints never serialize on lookups
//!
//! # Example
//!
//! ```no_run
//! use admission_postgres::PostgresTicketStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresTicketStore::connect("postgres://localhost/admission", 10, Duration::from_secs(5)).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::PostgresTicketStore;
