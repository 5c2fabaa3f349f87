//! Store adapters.
//!
//! [`memory::InMemoryStore`] backs tests and the demo; [`postgres::PostgresStore`]
//! is the production adapter. Both implement every port in [`crate::ports`].

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
