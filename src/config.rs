//! Migration configuration
//!
//! [`MigrationConfig::load`] reads `config/migration.toml` (optional) and environment
//! variables such as `CASSANDRA__MIGRATION__KEYSPACE` or
//! `CASSANDRA__MIGRATION__ALLOW_OUT_OF_ORDER=true`.

use crate::migration::{MigrationError, MigrationVersion, TargetVersion};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/migration.toml";
const ENV_PREFIX: &str = "CASSANDRA";
/// The lock staleness window must span this many poll intervals
const MIN_STALE_POLL_RATIO: u32 = 10;

/// File naming rules for migration scripts
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingConfig {
    pub versioned_prefix: String,
    pub repeatable_prefix: String,
    pub separator: String,
    pub suffix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            versioned_prefix: "V".to_string(),
            repeatable_prefix: "R".to_string(),
            separator: "__".to_string(),
            suffix: ".cql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Keyspace holding the schema history and lock tables
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    /// Schema history table name; the lock and rank counter tables derive from it
    #[serde(default = "default_table")]
    pub table: String,
    /// Script locations, either a list or a comma separated string
    #[serde(default = "default_locations", deserialize_with = "de::locations")]
    pub locations: Vec<String>,
    /// Encoding of CQL scripts. Only `UTF-8` is supported.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub naming: NamingConfig,
    /// `latest` or a version; migrations above it are held back
    #[serde(default, deserialize_with = "de::target")]
    pub target: TargetVersion,
    /// Allow pending migrations below the highest applied version to run
    #[serde(default)]
    pub allow_out_of_order: bool,
    /// Fail validation when an applied versioned migration was modified
    #[serde(default = "default_true")]
    pub validate_checksums: bool,
    /// Treat applied migrations without a local source as an error
    #[serde(default)]
    pub strict: bool,
    /// Fold `\r\n` into `\n` before computing script checksums
    #[serde(default)]
    pub normalize_line_endings: bool,
    /// Recorded in the `installed_by` column
    #[serde(default = "default_installed_by")]
    pub installed_by: String,
    /// How long `migrate` waits for the lock; `0` fails fast
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Lock rows not refreshed for this long are considered abandoned
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// Version written by `baseline` when none is given
    #[serde(default = "default_baseline_version")]
    pub baseline_version: String,
    #[serde(default = "default_baseline_description")]
    pub baseline_description: String,
}

fn default_keyspace() -> String {
    "migrations".to_string()
}

fn default_table() -> String {
    "cassandra_migration_version".to_string()
}

fn default_locations() -> Vec<String> {
    vec!["db/migration".to_string()]
}

fn default_encoding() -> String {
    "UTF-8".to_string()
}

fn default_true() -> bool {
    true
}

fn default_installed_by() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cassandra-migration".to_string())
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_lock_stale_secs() -> u64 {
    300
}

fn default_lock_poll_interval_ms() -> u64 {
    100
}

fn default_baseline_version() -> String {
    "1".to_string()
}

fn default_baseline_description() -> String {
    "<< Cassandra Baseline >>".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            keyspace: default_keyspace(),
            table: default_table(),
            locations: default_locations(),
            encoding: default_encoding(),
            naming: NamingConfig::default(),
            target: TargetVersion::Latest,
            allow_out_of_order: false,
            validate_checksums: true,
            strict: false,
            normalize_line_endings: false,
            installed_by: default_installed_by(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_stale_secs: default_lock_stale_secs(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            baseline_version: default_baseline_version(),
            baseline_description: default_baseline_description(),
        }
    }
}

impl MigrationConfig {
    /// Load the configuration from `config/migration.toml`, falling back to env vars
    pub fn load() -> Result<Self, MigrationError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load the configuration from `path` (optional) layered under env vars
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let env = || Environment::with_prefix(ENV_PREFIX).separator("__");

        let settings = match Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(env())
            .build()
        {
            Ok(cfg) => cfg,
            Err(err) => {
                // An unreadable file should not hide a usable environment
                if path.exists() {
                    log::warn!(
                        "Failed to load {}, falling back to environment: {err}",
                        path.display()
                    );
                }
                Config::builder().add_source(env()).build().map_err(|env_err| {
                    ConfigError::Message(format!(
                        "failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                    ))
                })?
            }
        };

        let config = match settings.get::<MigrationConfig>("migration") {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => MigrationConfig::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values the deserializer cannot
    pub fn validate(&self) -> Result<(), MigrationError> {
        let encoding = self.encoding.replace('-', "").to_ascii_lowercase();
        if encoding != "utf8" {
            return Err(MigrationError::Config(format!(
                "unsupported script encoding '{}', only UTF-8 is supported",
                self.encoding
            )));
        }
        if self.naming.separator.is_empty() {
            return Err(MigrationError::Config("naming.separator must not be empty".to_string()));
        }
        if self.naming.versioned_prefix.is_empty() || self.naming.repeatable_prefix.is_empty() {
            return Err(MigrationError::Config("migration prefixes must not be empty".to_string()));
        }
        if self.naming.versioned_prefix == self.naming.repeatable_prefix {
            return Err(MigrationError::Config(
                "versioned and repeatable prefixes must differ".to_string(),
            ));
        }
        if !is_identifier(&self.keyspace) || !is_identifier(&self.table) {
            return Err(MigrationError::Config(format!(
                "keyspace '{}' and table '{}' must be plain CQL identifiers",
                self.keyspace, self.table
            )));
        }
        MigrationVersion::parse(&self.baseline_version).map_err(|e| {
            MigrationError::Config(format!("baseline_version: {e}"))
        })?;
        // A live holder refreshes every third of the window and waiters poll in between
        if self.lock_stale_after() < self.lock_poll_interval() * MIN_STALE_POLL_RATIO {
            return Err(MigrationError::Config(format!(
                "lock_stale_secs ({}s) must be at least {MIN_STALE_POLL_RATIO} lock poll \
                 intervals ({}ms)",
                self.lock_stale_secs,
                self.lock_poll_interval().as_millis()
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

mod de {
    use crate::migration::TargetVersion;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Locations {
        List(Vec<String>),
        Csv(String),
    }

    pub(super) fn locations<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let list = match Locations::deserialize(d)? {
            Locations::List(list) => list,
            Locations::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        };
        Ok(list
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub(super) fn target<'de, D: Deserializer<'de>>(d: D) -> Result<TargetVersion, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert_eq!(config.table, "cassandra_migration_version");
        assert_eq!(config.locations, vec!["db/migration"]);
        assert_eq!(config.target, TargetVersion::Latest);
        assert!(!config.allow_out_of_order);
        assert!(config.validate_checksums);
        assert_eq!(config.naming, NamingConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[allow(clippy::expect_used)] // Test code - expect is acceptable
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("migration.toml");
        fs::write(
            &path,
            r#"
[migration]
keyspace = "app"
locations = "db/migration, db/extra"
target = "2.1"
allow_out_of_order = true
lock_timeout_secs = 5

[migration.naming]
suffix = ".cql3"
"#,
        )
        .expect("write config");

        let config = MigrationConfig::load_from(&path).expect("config loads");
        assert_eq!(config.keyspace, "app");
        assert_eq!(config.locations, vec!["db/migration", "db/extra"]);
        assert_eq!(
            config.target,
            TargetVersion::Version(MigrationVersion::parse("2.1").expect("version"))
        );
        assert!(config.allow_out_of_order);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.naming.suffix, ".cql3");
        assert_eq!(config.naming.versioned_prefix, "V");
    }

    #[test]
    #[allow(clippy::expect_used)] // Test code - expect is acceptable
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = MigrationConfig::load_from(dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.keyspace, "migrations");
    }

    #[test]
    fn test_validate_rejects_other_encodings() {
        let config = MigrationConfig {
            encoding: "ISO-8859-1".to_string(),
            ..MigrationConfig::default()
        };
        assert!(matches!(config.validate(), Err(MigrationError::Config(_))));

        let utf8 = MigrationConfig {
            encoding: "utf8".to_string(),
            ..MigrationConfig::default()
        };
        assert!(utf8.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unsafe_lock_windows() {
        let zero = MigrationConfig {
            lock_stale_secs: 0,
            ..MigrationConfig::default()
        };
        assert!(matches!(zero.validate(), Err(MigrationError::Config(_))));

        let slow_poll = MigrationConfig {
            lock_stale_secs: 1,
            lock_poll_interval_ms: 500,
            ..MigrationConfig::default()
        };
        assert!(matches!(slow_poll.validate(), Err(MigrationError::Config(_))));

        let tight = MigrationConfig {
            lock_stale_secs: 1,
            lock_poll_interval_ms: 100,
            ..MigrationConfig::default()
        };
        assert!(tight.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unsafe_table_names() {
        let config = MigrationConfig {
            table: "history; DROP KEYSPACE app".to_string(),
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
