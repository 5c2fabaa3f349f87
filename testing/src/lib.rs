//! # Box Office Testing
//!
//! Testing utilities for the box office services.
//!
//! This crate provides:
//! - Deterministic [`Clock`] implementations ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryMessageBus`], a message bus that records everything published
//!
//! ## Example
//!
//! ```ignore
//! use box_office_testing::{InMemoryMessageBus, ManualClock};
//! use chrono::Duration;
//!
//! #[tokio::test]
//! async fn lock_expires() {
//!     let clock = ManualClock::default();
//!     let bus = InMemoryMessageBus::new();
//!     let office = BoxOffice::in_memory(config, Arc::new(clock.clone()), Arc::new(bus.clone()));
//!
//!     office.seats().select(seat_id, user_id).await?;
//!     clock.advance(Duration::minutes(11));
//!     assert_eq!(office.seats().unlock_expired().await?, 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use box_office_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use box_office_testing::mocks::FixedClock;
    /// use box_office_core::environment::Clock;
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

    /// A clock tests can move forward by hand.
    ///
    /// Clones share the same time, so a test can keep one handle and pass the
    /// other to the services under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward (or backward, with a negative duration).
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
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

/// Recording message bus.
pub mod message_bus;

pub use message_bus::{InMemoryMessageBus, PublishedMessage};
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let handle = clock.clone();
        let start = clock.now();

        handle.advance(chrono::Duration::minutes(10));
        assert_eq!(clock.now() - start, chrono::Duration::minutes(10));

        clock.set(start);
        assert_eq!(handle.now(), start);
    }
}
