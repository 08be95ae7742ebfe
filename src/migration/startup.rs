//! In-process migration execution helpers

use crate::config::MigrationConfig;
use crate::migration::{DirectoryLister, MigrationError, Migrator, ProceduralRegistry};
use crate::session::CqlSession;

/// Run migrations on application startup
///
/// Loads [`MigrationConfig`] from `config/migration.toml` and the environment, scans the
/// configured locations and applies pending migrations. It handles:
/// - Lock acquisition (prevents concurrent execution in multi-instance deployments)
/// - Validation (checksums, ordering, failed entries) before anything executes
/// - Migration execution
///
/// # Behavior
///
/// - **First process wins:** The first process to start acquires the lock and runs migrations
/// - **Other processes wait:** Others wait up to `lock_timeout_secs` and then find nothing to do
/// - **Fail-fast:** If migrations fail, the application should not start
///
/// # Example
///
/// ```rust,no_run
/// use cassandra_migration::migration::startup_migrations;
/// # fn connect() -> cassandra_migration::memory::MemorySession { unimplemented!() }
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let session = connect();
///     startup_migrations(&session)?;
///
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
pub fn startup_migrations(session: &dyn CqlSession) -> Result<usize, MigrationError> {
    let config = MigrationConfig::load()?;
    startup_migrations_with_config(config, session, None)
}

/// Like [`startup_migrations`], with an explicit configuration and optional procedural
/// migrations
pub fn startup_migrations_with_config(
    config: MigrationConfig,
    session: &dyn CqlSession,
    procedures: Option<&dyn ProceduralRegistry>,
) -> Result<usize, MigrationError> {
    config.validate()?;
    let resources = DirectoryLister::new(&config.locations);

    let mut migrator = Migrator::new(config, session, &resources);
    if let Some(registry) = procedures {
        migrator = migrator.with_procedures(registry);
    }

    let applied = migrator.migrate()?;
    if applied > 0 {
        log::info!("Applied {applied} migration(s) on startup");
    } else {
        log::debug!("No pending migrations to apply");
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySession;
    use crate::session::ResultSet;

    #[test]
    fn test_startup_runs_scripts_from_configured_location() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join("V1__create_events.cql"),
            "CREATE TABLE app.events (id timeuuid PRIMARY KEY, payload text);",
        )
        .expect("write script");
        std::fs::write(dir.path().join("notes.txt"), "not a migration").expect("write note");

        let session = MemorySession::new()
            .with_response("VALUES (?, ?, ?) IF NOT EXISTS", ResultSet::applied(true))
            .with_response("IF owner = ?", ResultSet::applied(true));
        let config = MigrationConfig {
            keyspace: "app".to_string(),
            locations: vec![dir.path().display().to_string()],
            lock_timeout_secs: 0,
            ..MigrationConfig::default()
        };

        let applied =
            startup_migrations_with_config(config, &session, None).expect("startup succeeds");

        assert_eq!(applied, 1);
        let executed = session.executed();
        assert!(executed
            .iter()
            .any(|s| s.starts_with("CREATE TABLE app.events")));
        assert!(executed
            .iter()
            .any(|s| s.starts_with("INSERT INTO app.cassandra_migration_version (")));
        assert!(executed
            .last()
            .is_some_and(|s| s.starts_with("DELETE FROM app.cassandra_migration_version_lock")));
    }
}
