//! # Box Office Core
//!
//! Core traits and types shared by the box office services.
//!
//! This crate holds the pieces every service depends on but that carry no
//! ticketing rules of their own:
//!
//! - **Clock**: Injected time source, so TTLs and admission windows are testable
//! - **Message**: Asynchronous message contracts serialized as JSON
//! - **`MessageBus`**: Publish/subscribe port the services emit messages through
//!
//! ## Architecture Principles
//!
//! - Dependency Injection via traits (`Arc<dyn Clock>`, `Arc<dyn MessageBus>`)
//! - Explicit side effects (publishing is a port call, never implicit)
//! - Transport agnostic (the broker lives behind [`message_bus::MessageBus`])
//!
//! ## Example
//!
//! ```
//! use box_office_core::environment::{Clock, SystemClock};
//!
//! let clock = SystemClock;
//! let now = clock.now();
//! assert!(now.timestamp() > 0);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Message trait and JSON wire format.
pub mod message;

/// Message bus abstraction for publishing message contracts.
pub mod message_bus;

/// Environment module - Dependency injection traits
///
/// All time-dependent logic (lock TTLs, admission windows, saga timestamps)
/// reads the current time through [`environment::Clock`] instead of calling
/// `Utc::now()` directly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    ///
    /// // Test - fixed or manually advanced time
    /// let clock = Arc::new(ManualClock::new(start));
    /// clock.advance(Duration::minutes(11));
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation of [`Clock`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
