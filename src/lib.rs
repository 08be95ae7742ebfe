//! # cassandra-migration
//!
//! Versioned schema migrations for Cassandra-compatible clusters. Migrations are applied
//! in version order by at most one process at a time, coordinated through a
//! lightweight-transaction lock, and recorded in a schema history table in the cluster
//! itself.
//!
//! Connection handling stays with the embedding application: implement
//! [`session::CqlSession`] on top of your driver and hand it to a
//! [`migration::Migrator`].

pub mod config;
pub mod memory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod migration;
pub mod session;

pub use config::MigrationConfig;
pub use migration::{MigrationError, Migrator};
pub use session::{CqlSession, CqlValue, ResultSet, Row, SessionError};
