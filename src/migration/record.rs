//! `AppliedMigration` - rows of the schema history table

use crate::migration::{Checksum, MigrationKey, MigrationKind, MigrationVersion, ResolvedMigration};
use crate::session::{Row, SessionError};
use chrono::{DateTime, Utc};

/// A row of the schema history table
///
/// Rows are immutable once written. `repair` may delete failed rows or realign a
/// checksum, but never reuses a rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Monotonically increasing sequence number assigned on insert
    pub installed_rank: i32,
    /// `None` for repeatable migrations
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: MigrationKind,
    pub script: String,
    /// `None` for baseline markers
    pub checksum: Option<Checksum>,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
    pub execution_time_ms: i32,
    pub success: bool,
}

impl AppliedMigration {
    pub fn key(&self) -> MigrationKey {
        match &self.version {
            Some(v) => MigrationKey::Versioned(v.clone()),
            None => MigrationKey::Repeatable(self.description.clone()),
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.kind == MigrationKind::Baseline
    }

    /// Decode a row selected with [`HISTORY_COLUMNS`](crate::migration::state_table::HISTORY_COLUMNS)
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Decode` if a column is missing, has the wrong type, or holds
    /// an unknown migration type or malformed version.
    pub fn from_row(row: &Row) -> Result<Self, SessionError> {
        let version = row
            .get::<Option<String>>("version")?
            .filter(|v| !v.is_empty())
            .map(|v| MigrationVersion::parse(&v))
            .transpose()
            .map_err(|e| SessionError::Decode(e.to_string()))?;
        let kind_name: String = row.get("type")?;
        let kind = MigrationKind::parse(&kind_name)
            .ok_or_else(|| SessionError::Decode(format!("unknown migration type '{kind_name}'")))?;

        Ok(Self {
            installed_rank: row.get("installed_rank")?,
            version,
            description: row.get("description")?,
            kind,
            script: row.get("script")?,
            checksum: row.get::<Option<i64>>("checksum")?.map(Checksum::from_column),
            installed_by: row.get("installed_by")?,
            installed_on: row.get("installed_on")?,
            execution_time_ms: row.get::<Option<i32>>("execution_time")?.unwrap_or(0),
            success: row.get("success")?,
        })
    }
}

/// A history row before a rank has been assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: MigrationKind,
    pub script: String,
    pub checksum: Option<Checksum>,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
    pub execution_time_ms: i32,
    pub success: bool,
}

impl HistoryEntry {
    /// Entry recording the outcome of executing `migration`
    pub fn for_migration(
        migration: &ResolvedMigration,
        installed_by: &str,
        execution_time_ms: i32,
        success: bool,
    ) -> Self {
        Self {
            version: migration.version.clone(),
            description: migration.description.clone(),
            kind: migration.kind(),
            script: migration.script.clone(),
            checksum: Some(migration.checksum),
            installed_by: installed_by.to_string(),
            installed_on: Utc::now(),
            execution_time_ms,
            success,
        }
    }

    /// Synthetic successful entry marking the start of the history
    pub fn baseline(version: MigrationVersion, description: &str, installed_by: &str) -> Self {
        Self {
            version: Some(version),
            description: description.to_string(),
            kind: MigrationKind::Baseline,
            script: description.to_string(),
            checksum: None,
            installed_by: installed_by.to_string(),
            installed_on: Utc::now(),
            execution_time_ms: 0,
            success: true,
        }
    }

    pub fn with_rank(self, installed_rank: i32) -> AppliedMigration {
        AppliedMigration {
            installed_rank,
            version: self.version,
            description: self.description,
            kind: self.kind,
            script: self.script,
            checksum: self.checksum,
            installed_by: self.installed_by,
            installed_on: self.installed_on,
            execution_time_ms: self.execution_time_ms,
            success: self.success,
        }
    }
}
