//! # Admission Testing
//!
//! Testing utilities for the admission pipeline.
//!
//! This crate provides:
//! - Deterministic [`Clock`] implementations
//! - A fixed signing keyring and codec
//! - Ticket fixtures and proptest strategies for checkpoint metadata
//!
//! ## Example
//!
//! ```
//! use admission_core::environment::Clock;
//! use admission_testing::{ManualClock, test_codec, window_starting_at};
//! use chrono::Duration;
//!
//! let clock = ManualClock::new(admission_testing::test_clock().now());
//! let window = window_starting_at(clock.now(), Duration::hours(2));
//! clock.advance(Duration::minutes(5));
//! assert!(window.contains(clock.now()));
//! let _codec = test_codec();
//! ```

use admission_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use admission_testing::mocks::FixedClock;
    /// use admission_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can hold one handle and
    /// advance time under a service holding another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start the clock at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward (or back, for a negative duration)
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Keyrings and ticket fixtures.
pub mod fixtures {
    use admission_core::codec::{SigningKey, SigningKeyring, TokenCodec};
    use admission_core::types::{EventId, Ticket, UserId, ValidityWindow};
    use chrono::{DateTime, Duration, SubsecRound, Utc};

    /// Secret of the test signing key (32 bytes of `0x42`)
    pub const TEST_SECRET: [u8; 32] = [0x42; 32];

    /// Identifier of the test signing key
    pub const TEST_KEY_ID: &str = "test-key";

    /// Keyring holding only the fixed test key
    ///
    /// # Panics
    ///
    /// Never in practice; the fixed secret satisfies the key length rule.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_keyring() -> SigningKeyring {
        SigningKeyring::new(SigningKey::new(TEST_KEY_ID, TEST_SECRET.to_vec()).expect("test secret is 32 bytes"))
    }

    /// Codec over [`test_keyring`]
    #[must_use]
    pub fn test_codec() -> TokenCodec {
        TokenCodec::new(test_keyring())
    }

    /// Window `[start, start + length]`, truncated to whole seconds
    ///
    /// # Panics
    ///
    /// Panics if `length` is negative.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn window_starting_at(start: DateTime<Utc>, length: Duration) -> ValidityWindow {
        let start = start.trunc_subsecs(0);
        ValidityWindow::new(start, start + length).expect("non-negative window length")
    }

    /// An `Active` ticket for a fresh event and user, admissible for two hours from `now`
    #[must_use]
    pub fn active_ticket(now: DateTime<Utc>) -> Ticket {
        Ticket::issue(
            EventId::new(),
            UserId::new(),
            window_starting_at(now, Duration::hours(2)),
            now,
        )
    }
}

/// Property-based testing strategies.
pub mod properties {
    use admission_core::types::{DeviceId, ScanLocation};
    use proptest::prelude::*;

    /// Checkpoint locations, including the unspecified sentinel
    pub fn arb_location() -> impl Strategy<Value = ScanLocation> {
        prop_oneof![
            Just(ScanLocation::Unspecified),
            prop::sample::select(vec!["North Gate", "South Gate", "Hall B"]).prop_map(ScanLocation::named),
        ]
    }

    /// Device identifiers from a small pool so devices repeat
    pub fn arb_device() -> impl Strategy<Value = DeviceId> {
        (0u8..4).prop_map(|n| DeviceId::new(format!("scanner-{n}")))
    }
}

/// Install a test `tracing` subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use fixtures::{active_ticket, test_codec, test_keyring, window_starting_at};
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(Duration::seconds(90));
        assert_eq!(clock.now(), test_clock().now() + Duration::seconds(90));
    }

    #[test]
    fn fixture_ticket_is_admissible_now() {
        let now = test_clock().now();
        assert!(active_ticket(now).is_admissible_at(now));
    }
}
