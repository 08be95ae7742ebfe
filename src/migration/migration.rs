//! Resolved migrations and the procedural migration trait

use crate::migration::{Checksum, MigrationVersion};
use crate::session::{CqlSession, SessionError};
use std::fmt;

/// Trait for migrations written in Rust rather than CQL
///
/// Procedural migrations are discovered through a [`ProceduralRegistry`](crate::migration::ProceduralRegistry)
/// under an identity that follows the same naming rules as script files, minus the
/// suffix (for example `app::migrations::V3_0__Seed_lookup_tables`).
///
/// Note: the migration runs with the same live session the coordinator uses for CQL
/// scripts. There is no transaction to roll back, so a failing migration should leave
/// the schema in a state that can be cleaned up by hand.
pub trait ProceduralMigration: Send + Sync {
    /// Apply the migration
    fn migrate(&self, session: &dyn CqlSession) -> Result<(), SessionError>;
}

impl<F> ProceduralMigration for F
where
    F: Fn(&dyn CqlSession) -> Result<(), SessionError> + Send + Sync,
{
    fn migrate(&self, session: &dyn CqlSession) -> Result<(), SessionError> {
        self(session)
    }
}

/// How a migration is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationKind {
    /// CQL script split into statements
    Cql,
    /// Rust code looked up in the procedural registry
    Procedural,
    /// Synthetic history entry marking where the history starts
    Baseline,
}

impl MigrationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Cql => "CQL",
            MigrationKind::Procedural => "PROCEDURAL",
            MigrationKind::Baseline => "BASELINE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CQL" => Some(MigrationKind::Cql),
            "PROCEDURAL" => Some(MigrationKind::Procedural),
            "BASELINE" => Some(MigrationKind::Baseline),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a migration across the catalog and the history
///
/// Versioned migrations are keyed by version, repeatable ones by description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MigrationKey {
    Versioned(MigrationVersion),
    Repeatable(String),
}

impl MigrationKey {
    pub fn version(&self) -> Option<&MigrationVersion> {
        match self {
            MigrationKey::Versioned(v) => Some(v),
            MigrationKey::Repeatable(_) => None,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        matches!(self, MigrationKey::Repeatable(_))
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKey::Versioned(v) => write!(f, "version {v}"),
            MigrationKey::Repeatable(d) => write!(f, "repeatable '{d}'"),
        }
    }
}

/// Where a resolved migration comes from and how to run it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// CQL script content (already validated as UTF-8)
    Script { content: String },
    /// Identity to look up in the procedural registry
    Procedural { identity: String },
}

/// A migration discovered in this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMigration {
    /// `None` for repeatable migrations
    pub version: Option<MigrationVersion>,
    pub description: String,
    /// Resource name or procedural identity the migration was resolved from
    pub script: String,
    pub checksum: Checksum,
    pub source: MigrationSource,
}

impl ResolvedMigration {
    pub fn key(&self) -> MigrationKey {
        match &self.version {
            Some(v) => MigrationKey::Versioned(v.clone()),
            None => MigrationKey::Repeatable(self.description.clone()),
        }
    }

    pub fn kind(&self) -> MigrationKind {
        match self.source {
            MigrationSource::Script { .. } => MigrationKind::Cql,
            MigrationSource::Procedural { .. } => MigrationKind::Procedural,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }
}
