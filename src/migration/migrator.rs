//! Migrator - Core migration execution engine

use crate::config::MigrationConfig;
use crate::migration::lock::{CqlLockStore, DistributedLock, LockStore};
use crate::migration::script::split_statements;
use crate::migration::state_table::{CqlSchemaHistory, SchemaHistory};
use crate::migration::{
    AppliedMigration, HistoryEntry, MigrationError, MigrationInfoSet, MigrationKey,
    MigrationResolver, MigrationSource, MigrationVersion, ProceduralRegistry, ReconcilePolicy,
    ResolvedMigration, ResourceLister, ValidationPolicy,
};
use crate::session::{CqlSession, SessionError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// States of a locked coordinator run
///
/// `Idle → LockAcquired → Validating → Executing → Releasing → Idle`, with `Failed`
/// entered from `Executing` when a migration fails. `Releasing` is always reached once
/// the lock was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LockAcquired,
    Validating,
    Executing,
    Failed,
    Releasing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Idle => "IDLE",
            RunState::LockAcquired => "LOCK_ACQUIRED",
            RunState::Validating => "VALIDATING",
            RunState::Executing => "EXECUTING",
            RunState::Failed => "FAILED",
            RunState::Releasing => "RELEASING",
        })
    }
}

struct Run {
    command: &'static str,
    state: RunState,
}

impl Run {
    fn new(command: &'static str) -> Self {
        Self {
            command,
            state: RunState::Idle,
        }
    }

    fn transition(&mut self, next: RunState) {
        log::debug!("{}: {} -> {}", self.command, self.state, next);
        self.state = next;
    }
}

/// Core migration execution engine
///
/// The `Migrator` resolves migrations from a [`ResourceLister`] (and optionally a
/// [`ProceduralRegistry`]), reconciles them with the schema history, and applies the
/// pending ones one at a time while holding the cluster-wide migration lock.
///
/// By default the history and the lock live in `<keyspace>.<table>` and
/// `<keyspace>.<table>_lock`, accessed through the same session that runs the
/// migrations.
///
/// # Example
///
/// ```rust,no_run
/// use cassandra_migration::config::MigrationConfig;
/// use cassandra_migration::migration::{DirectoryLister, Migrator};
/// # fn session() -> cassandra_migration::memory::MemorySession { unimplemented!() }
///
/// let config = MigrationConfig::load()?;
/// let session = session();
/// let resources = DirectoryLister::new(&config.locations);
///
/// let applied = Migrator::new(config, &session, &resources).migrate()?;
/// println!("applied {applied} migration(s)");
/// # Ok::<(), cassandra_migration::migration::MigrationError>(())
/// ```
pub struct Migrator<'a> {
    config: MigrationConfig,
    session: &'a dyn CqlSession,
    resources: &'a dyn ResourceLister,
    procedures: Option<&'a dyn ProceduralRegistry>,
    history: Box<dyn SchemaHistory + 'a>,
    locks: Box<dyn LockStore + 'a>,
    owner: String,
}

impl<'a> Migrator<'a> {
    pub fn new(
        config: MigrationConfig,
        session: &'a dyn CqlSession,
        resources: &'a dyn ResourceLister,
    ) -> Self {
        let history = CqlSchemaHistory::new(session, &config.keyspace, &config.table);
        let locks = CqlLockStore::new(session, &config.keyspace, &config.table);
        let owner = format!("{}@{}", config.installed_by, uuid::Uuid::new_v4());
        Self {
            config,
            session,
            resources,
            procedures: None,
            history: Box::new(history),
            locks: Box::new(locks),
            owner,
        }
    }

    /// Also resolve procedural migrations from `registry`
    #[must_use]
    pub fn with_procedures(mut self, registry: &'a dyn ProceduralRegistry) -> Self {
        self.procedures = Some(registry);
        self
    }

    /// Keep the schema history somewhere other than the default CQL table
    #[must_use]
    pub fn with_history(mut self, history: impl SchemaHistory + 'a) -> Self {
        self.history = Box::new(history);
        self
    }

    /// Coordinate through a lock store other than the default CQL table
    #[must_use]
    pub fn with_lock_store(mut self, locks: impl LockStore + 'a) -> Self {
        self.locks = Box::new(locks);
        self
    }

    /// Identity written into the lock row; unique per `Migrator` by default
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Build the migration catalog
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Resource` if listing fails and `MigrationError::Parse`
    /// for malformed or colliding migrations.
    pub fn resolve(&self) -> Result<Vec<ResolvedMigration>, MigrationError> {
        let resources = self.resources.list()?;
        MigrationResolver::from_config(&self.config).resolve(&resources, self.procedures)
    }

    /// Create the schema history and lock tables without migrating
    pub fn initialize(&self) -> Result<(), MigrationError> {
        self.history.ensure_initialized()?;
        self.locks.ensure_initialized().map_err(|e| {
            MigrationError::Lock(format!("failed to create the migration lock table: {e}"))
        })?;
        log::info!(
            "Initialized schema history table {}.{}",
            self.config.keyspace, self.config.table
        );
        Ok(())
    }

    /// Classify every migration; read only, no lock
    pub fn info(&self) -> Result<MigrationInfoSet, MigrationError> {
        let catalog = self.resolve()?;
        self.reconcile(&catalog)
    }

    /// Validate resolved migrations against the history; read only, no lock
    ///
    /// # Errors
    ///
    /// Returns the first validation failure: a failed history entry, a checksum
    /// mismatch, out-of-order migrations, or (in strict mode) missing migrations.
    pub fn validate(&self) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("validate", keyspace = %self.config.keyspace).entered();

        let catalog = self.resolve()?;
        let infos = self.reconcile(&catalog)?;
        infos.validate(&self.validation_policy())?;
        log::info!(
            "Successfully validated {} migration(s)",
            infos.all().iter().filter(|i| i.resolved.is_some()).count()
        );
        Ok(())
    }

    /// Apply all pending migrations
    ///
    /// Migrations are executed strictly one after another. A failing migration is
    /// recorded in the history with `success = false` and stops the run; statements it
    /// already executed are not rolled back.
    ///
    /// # Returns
    ///
    /// Returns the number of migrations applied in this run.
    ///
    /// # Errors
    ///
    /// Parse errors are raised before the lock is acquired. Validation errors are raised
    /// before anything is executed. `MigrationError::Execution` names the failed
    /// migration and how many migrations this run applied before it.
    pub fn migrate(&self) -> Result<usize, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("migrate", keyspace = %self.config.keyspace).entered();

        let catalog = self.resolve()?;
        self.locked("migrate", |run, lost| {
            run.transition(RunState::Validating);
            let infos = self.reconcile(&catalog)?;
            infos.validate(&self.validation_policy())?;

            let pending = infos.pending();
            if pending.is_empty() {
                log::info!(
                    "Schema of keyspace '{}' is up to date, no migration necessary",
                    self.config.keyspace
                );
                return Ok(0);
            }

            run.transition(RunState::Executing);
            let mut applied = 0;
            for migration in pending {
                if lost.load(Ordering::SeqCst) {
                    run.transition(RunState::Failed);
                    return Err(MigrationError::Lock(format!(
                        "lost ownership of the migration lock after applying {applied} migration(s)"
                    )));
                }
                if let Err(e) = self.apply(migration, applied) {
                    run.transition(RunState::Failed);
                    return Err(e);
                }
                applied += 1;
            }

            log::info!(
                "Successfully applied {applied} migration(s) to keyspace '{}'",
                self.config.keyspace
            );
            Ok(applied)
        })
    }

    /// Mark `version` as the start of the history
    ///
    /// Migrations at or below `version` are never executed afterwards. Repeating the
    /// same baseline is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Baseline` if the history already holds versioned
    /// migrations or a different baseline.
    pub fn baseline(
        &self,
        version: MigrationVersion,
        description: &str,
    ) -> Result<AppliedMigration, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("baseline", version = %version).entered();

        self.locked("baseline", |run, _| {
            run.transition(RunState::Validating);
            let history = self.history.load_all()?;
            if let Some(existing) = history.iter().find(|row| row.is_baseline()) {
                if existing.version.as_ref() == Some(&version) {
                    log::info!("Schema history is already baselined at {version}");
                    return Ok(existing.clone());
                }
                return Err(MigrationError::Baseline(format!(
                    "schema history already has a baseline at {}",
                    existing.key()
                )));
            }
            if let Some(row) = history.iter().find(|row| row.version.is_some()) {
                return Err(MigrationError::Baseline(format!(
                    "schema history already contains {} (rank {})",
                    row.key(),
                    row.installed_rank
                )));
            }

            run.transition(RunState::Executing);
            let record = self
                .history
                .mark_baseline(version, description, &self.config.installed_by)?;
            log::info!("Created baseline {} - {}", record.key(), record.description);
            Ok(record)
        })
    }

    /// Baseline at the configured `baseline_version` and `baseline_description`
    pub fn baseline_from_config(&self) -> Result<AppliedMigration, MigrationError> {
        let version = MigrationVersion::parse(&self.config.baseline_version)
            .map_err(|e| MigrationError::Config(format!("baseline_version: {e}")))?;
        self.baseline(version, &self.config.baseline_description)
    }

    /// Remove failed history entries and realign checksums of applied migrations
    ///
    /// Partial changes left behind by a failed migration must be cleaned up by hand
    /// before running `repair`; the failed migration is then pending again.
    ///
    /// # Returns
    ///
    /// Returns the number of history rows removed or updated.
    pub fn repair(&self) -> Result<usize, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("repair", keyspace = %self.config.keyspace).entered();

        let catalog = self.resolve()?;
        let resolved: HashMap<MigrationKey, &ResolvedMigration> =
            catalog.iter().map(|m| (m.key(), m)).collect();

        self.locked("repair", |run, _| {
            run.transition(RunState::Validating);
            let history = self.history.load_all()?;

            run.transition(RunState::Executing);
            let mut repaired = 0;
            for row in &history {
                if !row.success {
                    self.history.remove(row.installed_rank)?;
                    log::info!(
                        "Removed failed migration {} (rank {}) from schema history",
                        row.key(),
                        row.installed_rank
                    );
                    repaired += 1;
                    continue;
                }
                if row.version.is_none() || row.is_baseline() {
                    continue;
                }
                let Some(migration) = resolved.get(&row.key()) else {
                    continue;
                };
                if row.checksum != Some(migration.checksum) {
                    self.history
                        .update_checksum(row.installed_rank, migration.checksum)?;
                    log::info!(
                        "Realigned checksum of {} to {}",
                        row.key(),
                        migration.checksum
                    );
                    repaired += 1;
                }
            }

            log::info!("Repaired {repaired} schema history entr(ies)");
            Ok(repaired)
        })
    }

    fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            target: self.config.target.clone(),
            allow_out_of_order: self.config.allow_out_of_order,
        }
    }

    fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            validate_checksums: self.config.validate_checksums,
            strict: self.config.strict,
        }
    }

    fn reconcile(&self, catalog: &[ResolvedMigration]) -> Result<MigrationInfoSet, MigrationError> {
        let history = self.history.load_all()?;
        Ok(MigrationInfoSet::reconcile(catalog, &history, &self.reconcile_policy()))
    }

    /// Run `work` while holding the migration lock
    ///
    /// The lock is released on every path; a release failure is logged and never
    /// replaces the outcome of `work`.
    fn locked<T>(
        &self,
        command: &'static str,
        work: impl FnOnce(&mut Run, &AtomicBool) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        let mut run = Run::new(command);
        self.locks.ensure_initialized().map_err(|e| {
            MigrationError::Lock(format!("failed to create the migration lock table: {e}"))
        })?;

        let lock = DistributedLock::new(
            self.locks.as_ref(),
            self.owner.clone(),
            self.config.lock_stale_after(),
        )
        .with_poll_interval(self.config.lock_poll_interval());
        let guard = lock.lock(self.config.lock_timeout())?;
        run.transition(RunState::LockAcquired);

        let result = lock.while_held(|lost| {
            self.history.ensure_initialized()?;
            work(&mut run, lost)
        });

        run.transition(RunState::Releasing);
        if let Err(e) = guard.release() {
            log::warn!("{command}: {e}");
        }
        run.transition(RunState::Idle);
        result
    }

    /// Execute one migration and record the outcome
    fn apply(
        &self,
        migration: &ResolvedMigration,
        applied_before: usize,
    ) -> Result<(), MigrationError> {
        log::info!(
            "Migrating keyspace '{}' to {} - {}",
            self.config.keyspace,
            migration.key(),
            migration.description
        );

        let start = Instant::now();
        let outcome = self.execute(migration);
        let elapsed = start.elapsed();
        let execution_time = i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX);

        let entry = HistoryEntry::for_migration(
            migration,
            &self.config.installed_by,
            execution_time,
            outcome.is_ok(),
        );
        let recorded = self.history.append(entry);

        match outcome {
            Ok(()) => {
                recorded?;
                #[cfg(feature = "metrics")]
                METRICS.record_applied(migration.kind(), elapsed);
                Ok(())
            }
            Err((statement, source)) => {
                #[cfg(feature = "metrics")]
                METRICS.record_failed(migration.kind(), elapsed);
                if let Err(e) = recorded {
                    log::error!("Could not record the failure of {}: {e}", migration.key());
                }
                log::error!("Migration {} failed: {source}", migration.key());
                Err(MigrationError::Execution {
                    key: migration.key(),
                    applied_before,
                    statement,
                    source,
                })
            }
        }
    }

    /// Run a migration's statements or procedure; on failure returns the failing
    /// statement (scripts only) and the session error
    fn execute(&self, migration: &ResolvedMigration) -> Result<(), (Option<String>, SessionError)> {
        match &migration.source {
            MigrationSource::Script { content } => {
                for statement in split_statements(content) {
                    log::debug!("Executing CQL: {statement}");
                    if let Err(e) = self.session.execute(&statement, &[]) {
                        return Err((Some(statement), e));
                    }
                }
                Ok(())
            }
            MigrationSource::Procedural { identity } => {
                let procedure = self
                    .procedures
                    .and_then(|registry| registry.lookup(identity))
                    .ok_or_else(|| {
                        (
                            None,
                            SessionError::Execution(format!(
                                "procedural migration '{identity}' is not registered"
                            )),
                        )
                    })?;
                procedure.migrate(self.session).map_err(|e| (None, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLockStore, MemoryResources, MemorySchemaHistory, MemorySession};
    use crate::migration::{MigrationRegistry, MigrationState};
    use crate::session::CqlValue;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).expect("valid version")
    }

    fn config() -> MigrationConfig {
        MigrationConfig {
            installed_by: "tester".to_string(),
            lock_timeout_secs: 0,
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn test_script_statements_run_in_order() {
        let session = MemorySession::new();
        let resources = MemoryResources::new()
            .with(
                "V1__init.cql",
                "CREATE KEYSPACE app WITH replication = \
                 {'class': 'SimpleStrategy', 'replication_factor': 1};\n\
                 CREATE TABLE app.users (id uuid PRIMARY KEY);",
            )
            .with("V2__index.cql", "CREATE INDEX ON app.users (id);");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();

        let applied = Migrator::new(config(), &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks)
            .migrate()
            .expect("migrate succeeds");

        assert_eq!(applied, 2);
        let executed = session.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[1].starts_with("CREATE TABLE app.users"));
        assert!(executed[2].starts_with("CREATE INDEX"));
        assert!(history.is_initialized());
        assert_eq!(locks.current().expect("read"), None);
    }

    #[test]
    fn test_failure_is_recorded_and_stops_run() {
        let session = MemorySession::new()
            .fail_on("BROKEN", SessionError::Execution("syntax error".to_string()));
        let resources = MemoryResources::new()
            .with("V1__ok.cql", "CREATE TABLE app.a (k int PRIMARY KEY);")
            .with("V2__bad.cql", "CREATE TABLE app.b (k int PRIMARY KEY);\nBROKEN STATEMENT;")
            .with("V3__never.cql", "CREATE TABLE app.c (k int PRIMARY KEY);");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();
        let migrator = Migrator::new(config(), &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks);

        match migrator.migrate() {
            Err(MigrationError::Execution { key, applied_before, statement, .. }) => {
                assert_eq!(key, MigrationKey::Versioned(v("2")));
                assert_eq!(applied_before, 1);
                assert_eq!(statement.as_deref(), Some("BROKEN STATEMENT"));
            }
            other => panic!("expected Execution error, got {other:?}"),
        }

        let rows = history.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].success);
        assert!(!rows[1].success);
        assert!(!session.executed().iter().any(|s| s.contains("app.c")));
        assert_eq!(locks.current().expect("read"), None, "lock released after failure");

        assert!(matches!(
            migrator.migrate(),
            Err(MigrationError::FailedMigration { rank: 2, .. })
        ));
    }

    #[test]
    fn test_procedural_migration_gets_live_session() {
        let session = MemorySession::new();
        let resources = MemoryResources::new();
        let registry = MigrationRegistry::new()
            .with(
                "app::migrations::V1__seed_roles",
                |session: &dyn CqlSession| -> Result<(), SessionError> {
                    session.execute("INSERT INTO app.roles (name) VALUES (?)", &["admin".into()])?;
                    Ok(())
                },
            )
            .expect("registered");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();

        let applied = Migrator::new(config(), &session, &resources)
            .with_procedures(&registry)
            .with_history(&history)
            .with_lock_store(&locks)
            .migrate()
            .expect("migrate succeeds");

        assert_eq!(applied, 1);
        assert_eq!(session.bound_values(0), vec![CqlValue::Text("admin".to_string())]);
        assert_eq!(history.rows()[0].kind, crate::migration::MigrationKind::Procedural);
    }

    #[test]
    fn test_parse_error_aborts_before_lock() {
        let session = MemorySession::new();
        let resources = MemoryResources::new().with("V1_x__bad.cql", "SELECT 1;");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();
        locks.force_owner("someone-else");

        let result = Migrator::new(config(), &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks)
            .migrate();

        assert!(matches!(result, Err(MigrationError::Parse { .. })));
        assert!(!history.is_initialized());
    }

    #[test]
    fn test_lock_timeout_touches_nothing() {
        let session = MemorySession::new();
        let resources = MemoryResources::new().with("V1__init.cql", "SELECT 1;");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();
        locks.force_owner("someone-else");

        let result = Migrator::new(config(), &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks)
            .migrate();

        assert!(matches!(result, Err(MigrationError::LockTimeout { .. })));
        assert!(!history.is_initialized());
        assert!(session.executed().is_empty());
    }

    #[test]
    fn test_info_and_validate_on_fresh_cluster_are_read_only() {
        let session = MemorySession::new().fail_on(
            "SELECT installed_rank",
            SessionError::Execution("unconfigured table cassandra_migration_version".to_string()),
        );
        let resources = MemoryResources::new()
            .with("V1__init.cql", "CREATE TABLE app.a (k int PRIMARY KEY);")
            .with("V2__more.cql", "CREATE TABLE app.b (k int PRIMARY KEY);");
        let migrator = Migrator::new(config(), &session, &resources);

        let info = migrator.info().expect("info on a fresh cluster");
        assert_eq!(info.pending().len(), 2);
        assert!(info.all().iter().all(|i| i.state == MigrationState::Pending));
        migrator.validate().expect("validate on a fresh cluster");

        assert!(session.executed().iter().all(|cql| cql.starts_with("SELECT table_name")));
    }

    #[test]
    fn test_baseline_refused_on_migrated_history() {
        let session = MemorySession::new();
        let resources = MemoryResources::new().with("V1__init.cql", "SELECT 1;");
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();
        let migrator = Migrator::new(config(), &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks);

        migrator.migrate().expect("migrate succeeds");
        assert!(matches!(
            migrator.baseline(v("5"), "<< Baseline >>"),
            Err(MigrationError::Baseline(_))
        ));
    }

    #[test]
    fn test_baseline_from_config() {
        let session = MemorySession::new();
        let resources = MemoryResources::new();
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();
        let config = MigrationConfig {
            baseline_version: "3.2".to_string(),
            ..config()
        };

        let marker = Migrator::new(config, &session, &resources)
            .with_history(&history)
            .with_lock_store(&locks)
            .baseline_from_config()
            .expect("baseline succeeds");

        assert_eq!(marker.version, Some(v("3.2")));
        assert_eq!(marker.description, "<< Cassandra Baseline >>");
        assert!(marker.is_baseline());
    }

    #[test]
    fn test_repair_realigns_checksum() {
        let session = MemorySession::new();
        let history = MemorySchemaHistory::new();
        let locks = MemoryLockStore::new();

        let original = MemoryResources::new()
            .with("V1__init.cql", "CREATE TABLE app.t (k int PRIMARY KEY);");
        Migrator::new(config(), &session, &original)
            .with_history(&history)
            .with_lock_store(&locks)
            .migrate()
            .expect("migrate succeeds");

        let edited = MemoryResources::new()
            .with("V1__init.cql", "CREATE TABLE app.t (k int PRIMARY KEY); -- reviewed");
        let migrator = Migrator::new(config(), &session, &edited)
            .with_history(&history)
            .with_lock_store(&locks);
        assert!(matches!(migrator.validate(), Err(MigrationError::ChecksumMismatch { .. })));

        assert_eq!(migrator.repair().expect("repair succeeds"), 1);
        migrator.validate().expect("checksums realigned");
        let info = migrator.info().expect("info");
        assert_eq!(info.all()[0].state, MigrationState::Success);
    }
}
