//! # Box Office Runtime
//!
//! Async runtime helpers shared by the box office services.
//!
//! ## Core Components
//!
//! - **Retry**: [`retry::RetryPolicy`] with bounded exponential backoff
//! - **Shutdown**: [`shutdown::ShutdownSignal`], a cancellation signal built on a
//!   `watch` channel, plus cancellable sleeps
//! - **Periodic tasks**: [`periodic::PeriodicTask`] runs a job on a fixed interval
//!   until shutdown (used by the seat-lock and queue-expiry reapers)
//! - **Supervisor**: [`supervisor::TaskSupervisor`] owns keyed background tasks
//!   that can be cancelled individually or shut down together (used by the
//!   payment saga drivers)
//!
//! ## Example
//!
//! ```ignore
//! use box_office_runtime::{periodic::PeriodicTask, shutdown::shutdown_channel};
//! use std::time::Duration;
//!
//! let (trigger, signal) = shutdown_channel();
//! let handle = PeriodicTask::new("seat-lock-reaper", Duration::from_secs(30))
//!     .spawn(signal, move || {
//!         let manager = manager.clone();
//!         async move {
//!             manager.unlock_expired().await;
//!         }
//!     });
//!
//! trigger.trigger();
//! handle.await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Periodic background jobs
pub mod periodic;

/// Retry logic with exponential backoff
pub mod retry;

/// Cooperative shutdown and cancellation signals
pub mod shutdown;

/// Keyed, cancellable background tasks
pub mod supervisor;

pub use periodic::PeriodicTask;
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};
pub use supervisor::TaskSupervisor;
