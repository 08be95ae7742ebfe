//! Schema history table management
//!
//! The history is a ledger of every migration ever attempted, stored in the target
//! cluster. Writers are serialized by the migration lock, so the ledger itself only needs
//! per-row write semantics; readers never block.

use crate::migration::{AppliedMigration, Checksum, HistoryEntry, MigrationError, MigrationVersion};
use crate::session::{CqlSession, CqlValue};
use std::sync::atomic::{AtomicBool, Ordering};

/// Columns selected by [`CqlSchemaHistory::load_all`], in the order `from_row` expects
pub const HISTORY_COLUMNS: &str = "installed_rank, version, description, type, script, checksum, \
                                    installed_by, installed_on, execution_time, success";

const RANK_COUNTER: &str = "installed_rank";

/// Durable ledger of applied migrations
pub trait SchemaHistory: Send + Sync {
    /// Create the ledger if it does not exist; safe to call on every run
    fn ensure_initialized(&self) -> Result<(), MigrationError>;

    /// All rows ordered by rank
    fn load_all(&self) -> Result<Vec<AppliedMigration>, MigrationError>;

    /// Append a row under the next rank
    fn append(&self, entry: HistoryEntry) -> Result<AppliedMigration, MigrationError>;

    /// Append a synthetic successful row marking where the history starts
    fn mark_baseline(
        &self,
        version: MigrationVersion,
        description: &str,
        installed_by: &str,
    ) -> Result<AppliedMigration, MigrationError> {
        self.append(HistoryEntry::baseline(version, description, installed_by))
    }

    /// Delete the row with `rank`; the rank is not reused
    fn remove(&self, rank: i32) -> Result<(), MigrationError>;

    /// Overwrite the checksum recorded for `rank`
    fn update_checksum(&self, rank: i32, checksum: Checksum) -> Result<(), MigrationError>;
}

impl<T: SchemaHistory + ?Sized> SchemaHistory for &T {
    fn ensure_initialized(&self) -> Result<(), MigrationError> {
        (**self).ensure_initialized()
    }

    fn load_all(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        (**self).load_all()
    }

    fn append(&self, entry: HistoryEntry) -> Result<AppliedMigration, MigrationError> {
        (**self).append(entry)
    }

    fn remove(&self, rank: i32) -> Result<(), MigrationError> {
        (**self).remove(rank)
    }

    fn update_checksum(&self, rank: i32, checksum: Checksum) -> Result<(), MigrationError> {
        (**self).update_checksum(rank, checksum)
    }
}

/// Schema history stored in a Cassandra table
///
/// Ranks come from a counter table (`<table>_counts`): Cassandra has no sequences, and
/// counter increments are safe because only the lock holder appends.
///
/// Reading never creates anything: until the ledger exists, `load_all` reports an empty
/// history.
pub struct CqlSchemaHistory<'a> {
    session: &'a dyn CqlSession,
    keyspace: String,
    name: String,
    table: String,
    counts_table: String,
    created: AtomicBool,
}

impl<'a> CqlSchemaHistory<'a> {
    pub fn new(session: &'a dyn CqlSession, keyspace: &str, table: &str) -> Self {
        Self {
            session,
            keyspace: keyspace.to_string(),
            name: table.to_string(),
            table: format!("{keyspace}.{table}"),
            counts_table: format!("{keyspace}.{table}_counts"),
            created: AtomicBool::new(false),
        }
    }

    /// Whether the ledger table exists, per `system_schema`
    pub fn exists(&self) -> Result<bool, MigrationError> {
        if self.created.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let result = self
            .session
            .execute(
                "SELECT table_name FROM system_schema.tables \
                 WHERE keyspace_name = ? AND table_name = ?",
                &[self.keyspace.as_str().into(), self.name.as_str().into()],
            )
            .map_err(MigrationError::HistoryRead)?;
        Ok(!result.rows().is_empty())
    }

    /// `CREATE TABLE` statement for the ledger
    pub fn create_table_statement(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             installed_rank int, \
             version text, \
             description text, \
             type text, \
             script text, \
             checksum bigint, \
             installed_by text, \
             installed_on timestamp, \
             execution_time int, \
             success boolean, \
             PRIMARY KEY (installed_rank))",
            self.table
        )
    }

    pub fn create_counts_table_statement(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (name text, count counter, PRIMARY KEY (name))",
            self.counts_table
        )
    }

    fn next_rank(&self) -> Result<i32, MigrationError> {
        self.session
            .execute(
                &format!(
                    "UPDATE {} SET count = count + 1 WHERE name = ?",
                    self.counts_table
                ),
                &[RANK_COUNTER.into()],
            )
            .map_err(MigrationError::HistoryWrite)?;

        let result = self
            .session
            .execute(
                &format!("SELECT count FROM {} WHERE name = ?", self.counts_table),
                &[RANK_COUNTER.into()],
            )
            .map_err(MigrationError::HistoryRead)?;
        let count = result
            .first()
            .map(|row| row.get::<i64>("count"))
            .transpose()
            .map_err(MigrationError::HistoryRead)?
            .unwrap_or(0);

        i32::try_from(count).map_err(|_| {
            MigrationError::HistoryWrite(crate::session::SessionError::Decode(format!(
                "rank counter {count} is out of range"
            )))
        })
    }
}

impl SchemaHistory for CqlSchemaHistory<'_> {
    fn ensure_initialized(&self) -> Result<(), MigrationError> {
        self.session
            .execute(&self.create_table_statement(), &[])
            .map_err(MigrationError::HistoryWrite)?;
        self.session
            .execute(&self.create_counts_table_statement(), &[])
            .map_err(MigrationError::HistoryWrite)?;
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        if !self.exists()? {
            log::debug!("Schema history table {} does not exist yet", self.table);
            return Ok(Vec::new());
        }
        let result = self
            .session
            .execute(&format!("SELECT {HISTORY_COLUMNS} FROM {}", self.table), &[])
            .map_err(MigrationError::HistoryRead)?;

        let mut records = result
            .rows()
            .iter()
            .map(AppliedMigration::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(MigrationError::HistoryRead)?;
        // Partitions come back in token order
        records.sort_by_key(|r| r.installed_rank);
        Ok(records)
    }

    fn append(&self, entry: HistoryEntry) -> Result<AppliedMigration, MigrationError> {
        let rank = self.next_rank()?;
        let record = entry.with_rank(rank);

        let values: Vec<CqlValue> = vec![
            record.installed_rank.into(),
            record.version.as_ref().map(ToString::to_string).into(),
            record.description.clone().into(),
            record.kind.as_str().into(),
            record.script.clone().into(),
            record.checksum.map(Checksum::to_column).into(),
            record.installed_by.clone().into(),
            record.installed_on.into(),
            record.execution_time_ms.into(),
            record.success.into(),
        ];
        self.session
            .execute(
                &format!(
                    "INSERT INTO {} ({HISTORY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    self.table
                ),
                &values,
            )
            .map_err(MigrationError::HistoryWrite)?;

        Ok(record)
    }

    fn remove(&self, rank: i32) -> Result<(), MigrationError> {
        self.session
            .execute(
                &format!("DELETE FROM {} WHERE installed_rank = ?", self.table),
                &[rank.into()],
            )
            .map_err(MigrationError::HistoryWrite)?;
        Ok(())
    }

    fn update_checksum(&self, rank: i32, checksum: Checksum) -> Result<(), MigrationError> {
        self.session
            .execute(
                &format!(
                    "UPDATE {} SET checksum = ? WHERE installed_rank = ?",
                    self.table
                ),
                &[checksum.to_column().into(), rank.into()],
            )
            .map_err(MigrationError::HistoryWrite)?;
        Ok(())
    }
}
