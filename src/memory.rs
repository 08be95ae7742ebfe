//! In-process implementations of the migration collaborators
//!
//! These back embedded use (a scratch cluster in a test suite, a dry run) and the
//! crate's own tests. Everything here is thread-safe so that several coordinators can
//! share one history and one lock store, the way separate processes share a cluster.

use crate::migration::lock::{LockAttempt, LockRow, LockStore};
use crate::migration::state_table::SchemaHistory;
use crate::migration::{
    AppliedMigration, Checksum, HistoryEntry, MigrationError, Resource, ResourceLister,
};
use crate::session::{CqlSession, CqlValue, ResultSet, SessionError};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session that records statements instead of sending them to a cluster
///
/// Responses and failures are matched by substring against the statement text; the
/// first matching rule wins. Unmatched statements succeed with an empty result.
#[derive(Default)]
pub struct MemorySession {
    responses: Vec<(String, ResultSet)>,
    failures: Vec<(String, SessionError)>,
    delay: Option<Duration>,
    log: Mutex<Vec<(String, Vec<CqlValue>)>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(mut self, pattern: impl Into<String>, result: ResultSet) -> Self {
        self.responses.push((pattern.into(), result));
        self
    }

    #[must_use]
    pub fn fail_on(mut self, pattern: impl Into<String>, error: SessionError) -> Self {
        self.failures.push((pattern.into(), error));
        self
    }

    /// Sleep before every statement, to widen race windows in concurrency tests
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Statements executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        locked(&self.log).iter().map(|(cql, _)| cql.clone()).collect()
    }

    /// Values bound to the statement at `index`
    pub fn bound_values(&self, index: usize) -> Vec<CqlValue> {
        locked(&self.log)
            .get(index)
            .map(|(_, values)| values.clone())
            .unwrap_or_default()
    }
}

impl CqlSession for MemorySession {
    fn execute(&self, cql: &str, values: &[CqlValue]) -> Result<ResultSet, SessionError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        locked(&self.log).push((cql.to_string(), values.to_vec()));

        if let Some((_, error)) = self.failures.iter().find(|(p, _)| cql.contains(p.as_str())) {
            return Err(error.clone());
        }
        Ok(self
            .responses
            .iter()
            .find(|(p, _)| cql.contains(p.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct HistoryState {
    rows: Vec<AppliedMigration>,
    last_rank: i32,
    initialized: bool,
}

/// Schema history kept in memory
///
/// Ranks come from a counter that only moves forward, so ranks of removed rows are
/// never handed out again.
#[derive(Default)]
pub struct MemorySchemaHistory {
    state: Mutex<HistoryState>,
}

impl MemorySchemaHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        locked(&self.state).initialized
    }

    /// Snapshot of the rows, ordered by rank
    pub fn rows(&self) -> Vec<AppliedMigration> {
        locked(&self.state).rows.clone()
    }
}

impl SchemaHistory for MemorySchemaHistory {
    fn ensure_initialized(&self) -> Result<(), MigrationError> {
        locked(&self.state).initialized = true;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        Ok(self.rows())
    }

    fn append(&self, entry: HistoryEntry) -> Result<AppliedMigration, MigrationError> {
        let mut state = locked(&self.state);
        state.last_rank += 1;
        let record = entry.with_rank(state.last_rank);
        state.rows.push(record.clone());
        Ok(record)
    }

    fn remove(&self, rank: i32) -> Result<(), MigrationError> {
        locked(&self.state).rows.retain(|row| row.installed_rank != rank);
        Ok(())
    }

    fn update_checksum(&self, rank: i32, checksum: Checksum) -> Result<(), MigrationError> {
        let mut state = locked(&self.state);
        if let Some(row) = state.rows.iter_mut().find(|row| row.installed_rank == rank) {
            row.checksum = Some(checksum);
        }
        Ok(())
    }
}

/// Lock row kept in memory, with the same compare-and-set semantics as the CQL table
#[derive(Default)]
pub struct MemoryLockStore {
    row: Mutex<Option<LockRow>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the holder unconditionally, as an operator editing the table would
    pub fn force_owner(&self, owner: &str) {
        *locked(&self.row) = Some(LockRow {
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        });
    }
}

impl LockStore for MemoryLockStore {
    fn ensure_initialized(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn insert_if_absent(&self, row: &LockRow) -> Result<LockAttempt, SessionError> {
        let mut current = locked(&self.row);
        match current.as_ref() {
            Some(holder) => Ok(LockAttempt::HeldBy(holder.clone())),
            None => {
                *current = Some(row.clone());
                Ok(LockAttempt::Acquired)
            }
        }
    }

    fn replace_if(&self, expected: &LockRow, replacement: &LockRow) -> Result<bool, SessionError> {
        let mut current = locked(&self.row);
        if current.as_ref() == Some(expected) {
            *current = Some(replacement.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<bool, SessionError> {
        match locked(&self.row).as_mut() {
            Some(holder) if holder.owner == owner => {
                holder.acquired_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_owner(&self, owner: &str) -> Result<bool, SessionError> {
        let mut current = locked(&self.row);
        if current.as_ref().is_some_and(|holder| holder.owner == owner) {
            *current = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn current(&self) -> Result<Option<LockRow>, SessionError> {
        Ok(locked(&self.row).clone())
    }
}

/// Fixed list of resources
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    resources: Vec<Resource>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.resources.push(Resource::new(name, content));
        self
    }
}

impl ResourceLister for MemoryResources {
    fn list(&self) -> Result<Vec<Resource>, MigrationError> {
        Ok(self.resources.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationVersion;

    #[test]
    fn test_session_matches_rules_in_order() {
        let session = MemorySession::new()
            .fail_on("DROP", SessionError::Execution("denied".to_string()))
            .with_response("SELECT", ResultSet::applied(true));

        assert!(session.execute("CREATE TABLE ks.t (k int PRIMARY KEY)", &[]).is_ok());
        assert_eq!(
            session.execute("SELECT * FROM ks.t", &[]).expect("select").was_applied(),
            Ok(true)
        );
        assert!(session.execute("DROP TABLE ks.t", &[1i32.into()]).is_err());
        assert_eq!(session.executed().len(), 3);
        assert_eq!(session.bound_values(2), vec![CqlValue::Int(1)]);
    }

    #[test]
    fn test_history_ranks_are_never_reused() {
        let history = MemorySchemaHistory::new();
        let base = |v: &str| {
            HistoryEntry::baseline(MigrationVersion::parse(v).expect("version"), "b", "ops")
        };

        let first = history.append(base("1")).expect("append");
        let second = history.append(base("2")).expect("append");
        history.remove(second.installed_rank).expect("remove");
        let third = history.append(base("3")).expect("append");

        assert_eq!(first.installed_rank, 1);
        assert_eq!(third.installed_rank, 3);
        let ranks: Vec<i32> = history.rows().iter().map(|r| r.installed_rank).collect();
        assert_eq!(ranks, vec![1, 3]);
    }

    #[test]
    fn test_lock_store_compare_and_set() {
        let store = MemoryLockStore::new();
        let a = LockRow {
            owner: "a".to_string(),
            acquired_at: Utc::now(),
        };
        let b = LockRow {
            owner: "b".to_string(),
            acquired_at: Utc::now(),
        };

        assert_eq!(store.insert_if_absent(&a), Ok(LockAttempt::Acquired));
        assert_eq!(store.insert_if_absent(&b), Ok(LockAttempt::HeldBy(a.clone())));
        assert_eq!(store.replace_if(&b, &b), Ok(false));
        assert_eq!(store.replace_if(&a, &b), Ok(true));
        assert_eq!(store.delete_if_owner("a"), Ok(false));
        assert_eq!(store.delete_if_owner("b"), Ok(true));
        assert_eq!(store.current(), Ok(None));
    }
}
