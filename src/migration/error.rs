//! Migration-specific error types

use crate::migration::{Checksum, MigrationKey, MigrationVersion};
use crate::session::SessionError;
use std::time::Duration;
use thiserror::Error;

/// Migration-specific errors
///
/// Parse and validation errors are raised before anything is written, so the run can
/// simply be retried once the migration sources are fixed. Execution errors are raised
/// after the failure has been recorded in the schema history table.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration name, version or content could not be parsed, or two sources
    /// resolved to the same key
    #[error("invalid migration '{resource}': {reason}")]
    Parse { resource: String, reason: String },

    /// An applied migration's content changed after it was applied
    #[error(
        "migration {key} has been modified after being applied \
         (applied checksum {applied}, resolved checksum {resolved})"
    )]
    ChecksumMismatch {
        key: MigrationKey,
        applied: Checksum,
        resolved: Checksum,
    },

    /// Migrations below the highest applied version are pending and out-of-order
    /// execution is not allowed
    #[error(
        "detected resolved migration(s) not applied to the cluster: {} \
         (highest applied version is {highest_applied}); enable allow_out_of_order to apply them",
        join(.versions)
    )]
    OutOfOrder {
        versions: Vec<MigrationVersion>,
        highest_applied: MigrationVersion,
    },

    /// Applied migrations whose sources can no longer be resolved (strict mode only)
    #[error("applied migration(s) not resolved locally: {}", join(.keys))]
    MissingMigration { keys: Vec<MigrationKey> },

    /// A previous run left a failed entry behind
    #[error(
        "migration {key} failed in a previous run (rank {rank}); \
         clean up the partial changes manually, then run repair"
    )]
    FailedMigration { key: MigrationKey, rank: i32 },

    /// The migration lock could not be acquired in time
    #[error(
        "failed to acquire the migration lock within {waited:?}; it is held by '{holder}'. \
         Another process may be running migrations"
    )]
    LockTimeout { holder: String, waited: Duration },

    /// The lock table could not be read or written, or ownership was lost mid-run
    #[error("migration lock error: {0}")]
    Lock(String),

    /// A statement or procedural migration failed
    #[error(
        "migration {key} failed after {applied_before} successful migration(s) in this run: {source}"
    )]
    Execution {
        key: MigrationKey,
        applied_before: usize,
        statement: Option<String>,
        #[source]
        source: SessionError,
    },

    /// The schema history table could not be written
    #[error("failed to write schema history: {0}")]
    HistoryWrite(#[source] SessionError),

    /// The schema history table could not be read
    #[error("failed to read schema history: {0}")]
    HistoryRead(#[source] SessionError),

    /// Migration resources could not be listed or read
    #[error("failed to list migration resources: {0}")]
    Resource(String),

    /// Invalid configuration
    #[error("invalid migration configuration: {0}")]
    Config(String),

    /// A baseline was requested on a history that already contains migrations
    #[error("cannot baseline: {0}")]
    Baseline(String),
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
