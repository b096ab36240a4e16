//! HTTP server for the admission service.
//!
//! - Application state shared by handlers
//! - Health and readiness endpoints
//! - Error mapping to JSON responses
//! - Router configuration

pub mod error;
pub mod health;
pub mod routes;
pub mod state;

pub use error::AppError;
pub use health::{health_check, readiness_check};
pub use routes::build_router;
pub use state::AppState;
