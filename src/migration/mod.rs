//! Migration system for Cassandra
//!
//! This module provides the infrastructure for schema migrations, including:
//! - Migration catalog resolution from `V<version>__<description>.cql` and
//!   `R__<description>.cql` scripts plus registered procedural migrations
//! - The schema history table
//! - Reconciliation of the catalog against the history
//! - A cluster-wide lock built on lightweight transactions
//! - The [`Migrator`] that ties them together
//!
//! # Example
//!
//! ```rust,no_run
//! use cassandra_migration::config::MigrationConfig;
//! use cassandra_migration::memory::MemoryResources;
//! use cassandra_migration::migration::Migrator;
//! use cassandra_migration::session::{CqlSession, CqlValue, ResultSet, SessionError};
//!
//! struct Driver;
//!
//! impl CqlSession for Driver {
//!     fn execute(&self, cql: &str, values: &[CqlValue]) -> Result<ResultSet, SessionError> {
//!         // Hand the statement to the driver of your choice
//!         # let _ = (cql, values);
//!         Ok(ResultSet::empty())
//!     }
//! }
//!
//! let resources = MemoryResources::new()
//!     .with("V1_0__Create_users.cql", "CREATE TABLE app.users (id uuid PRIMARY KEY, name text);")
//!     .with("V1_1__Add_email.cql", "ALTER TABLE app.users ADD email text;");
//!
//! let migrator = Migrator::new(MigrationConfig::default(), &Driver, &resources);
//! let applied = migrator.migrate()?;
//! print!("{}", migrator.info()?);
//! # let _ = applied;
//! # Ok::<(), cassandra_migration::migration::MigrationError>(())
//! ```

pub mod checksum;
pub mod error;
pub mod file;
pub mod lock;
pub mod migration;
pub mod migrator;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod script;
pub mod startup;
pub mod state_table;
pub mod status;
pub mod version;

pub use checksum::Checksum;
pub use error::MigrationError;
pub use file::{DirectoryLister, Resource, ResourceLister};
pub use lock::{CqlLockStore, DistributedLock, LockAttempt, LockGuard, LockRow, LockStore};
pub use migration::{
    MigrationKey, MigrationKind, MigrationSource, ProceduralMigration, ResolvedMigration,
};
pub use migrator::{Migrator, RunState};
pub use record::{AppliedMigration, HistoryEntry};
pub use registry::{MigrationRegistry, ProceduralRegistry};
pub use resolver::MigrationResolver;
pub use startup::{startup_migrations, startup_migrations_with_config};
pub use state_table::{CqlSchemaHistory, SchemaHistory};
pub use status::{
    MigrationInfo, MigrationInfoSet, MigrationState, ReconcilePolicy, ValidationPolicy,
};
pub use version::{MigrationVersion, TargetVersion, VersionParseError};
