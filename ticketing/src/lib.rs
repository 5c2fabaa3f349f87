//! Box office - admission and seat-contention control for high-demand ticket sales
//!
//! Three problems, each behind its own service:
//!
//! - **Seat holds**: a user selects a seat and holds it for a bounded time.
//!   At most one unexpired lock exists per seat, and a seat can be sold only
//!   by its holder ([`seat::SeatLockManager`] over [`seat::SeatLedger`]).
//! - **Waiting queue**: users register for a concert and get a strictly
//!   increasing position; batches are admitted in position order, and an
//!   admitted user has a bounded window to enter seat selection
//!   ([`queue::AdmissionController`]).
//! - **Payment saga**: a reservation is paid against an external gateway
//!   whose outcome arrives asynchronously. Attempts are retried with backoff;
//!   success sells the seats, exhaustion releases them
//!   ([`payment::PaymentSaga`]).
//!
//! # Flow
//!
//! ```text
//! register ──► WAITING ──admit──► PROCESSING ──enter──► ENTERED
//!                                                          │
//!                              select seat (lock, TTL) ◄───┘
//!                                        │
//!                              create reservation (seats RESERVED)
//!                                        │
//!                              request payment ──► saga driver
//!                                   │                   │
//!                       COMPLETED: seats SOLD   FAILED: seats AVAILABLE,
//!                                               reservation CANCELLED
//! ```
//!
//! Storage is a set of ports ([`ports`]) with an in-memory and a `PostgreSQL`
//! adapter ([`persistence`]). [`app::BoxOffice`] wires everything together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod payment;
pub mod persistence;
pub mod ports;
pub mod queue;
pub mod reservation;
pub mod seat;
pub mod sweeper;
pub mod types;

pub use app::BoxOffice;
pub use config::Config;
pub use error::{Result, TicketingError};
pub use payment::{GatewayStatus, Payment, PaymentGateway, PaymentSaga, PaymentStatus};
pub use queue::{AdmissionController, QueuePosition, QueueStatus, WaitingQueueEntry};
pub use reservation::{Reservation, ReservationStatus};
pub use seat::{Grade, Seat, SeatLock, SeatStatus};
pub use types::*;
