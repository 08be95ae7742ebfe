//! Migration catalog: turns raw resources and procedural identities into an ordered
//! list of [`ResolvedMigration`]s

use crate::config::{MigrationConfig, NamingConfig};
use crate::migration::{
    Checksum, MigrationError, MigrationKey, MigrationSource, MigrationVersion,
    ProceduralRegistry, Resource, ResolvedMigration,
};
use regex::Regex;
use std::collections::HashMap;

/// Version and description parsed from a migration name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub version: Option<MigrationVersion>,
    pub description: String,
}

/// Builds the migration catalog for one run
pub struct MigrationResolver {
    naming: NamingConfig,
    normalize_line_endings: bool,
    versioned: Regex,
}

impl MigrationResolver {
    pub fn new(naming: NamingConfig, normalize_line_endings: bool) -> Self {
        // Version segments may be joined by '.', '_' or '__'. The pattern is greedy, so the
        // separator that ends the version is the last one followed by the description.
        let pattern = format!(
            r"^(?P<version>\d+(?:(?:\.|__|_)\d+)*){}(?P<description>.*)$",
            regex::escape(&naming.separator)
        );
        #[allow(clippy::expect_used)] // Pattern is built from an escaped literal
        let versioned = Regex::new(&pattern).expect("versioned migration pattern is valid");
        Self {
            naming,
            normalize_line_endings,
            versioned,
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.naming.clone(), config.normalize_line_endings)
    }

    /// Parse a migration name without its suffix
    ///
    /// Returns `Ok(None)` when the name does not start with a migration prefix.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` when the name carries a prefix but does not follow
    /// `<prefix><version><separator><description>` or `<prefix><separator><description>`.
    pub fn parse_name(
        &self,
        stem: &str,
        resource: &str,
    ) -> Result<Option<ParsedName>, MigrationError> {
        let fail = |reason: String| MigrationError::Parse {
            resource: resource.to_string(),
            reason,
        };
        let naming = &self.naming;

        // Check the longer prefix first in case one prefix starts with the other
        let repeatable_first = naming.repeatable_prefix.len() > naming.versioned_prefix.len();
        let repeatable_rest = stem.strip_prefix(naming.repeatable_prefix.as_str());
        let versioned_rest = stem.strip_prefix(naming.versioned_prefix.as_str());

        let (rest, repeatable) = match (repeatable_rest, versioned_rest) {
            (Some(r), Some(_)) if repeatable_first => (r, true),
            (_, Some(v)) => (v, false),
            (Some(r), None) => (r, true),
            (None, None) => return Ok(None),
        };

        if repeatable {
            let description = rest.strip_prefix(naming.separator.as_str()).ok_or_else(|| {
                fail(format!(
                    "repeatable migrations must be named {}{}<description>",
                    naming.repeatable_prefix, naming.separator
                ))
            })?;
            let description = Self::description(description)
                .ok_or_else(|| fail("description must not be empty".to_string()))?;
            return Ok(Some(ParsedName {
                version: None,
                description,
            }));
        }

        if !rest.contains(naming.separator.as_str()) {
            return Err(fail(format!(
                "missing separator '{}' between version and description",
                naming.separator
            )));
        }
        let captures = self.versioned.captures(rest).ok_or_else(|| {
            fail(format!(
                "expected {}<version>{}<description> with a numeric dotted version",
                naming.versioned_prefix, naming.separator
            ))
        })?;
        let raw_version = captures.name("version").map_or("", |m| m.as_str());
        let raw_description = captures.name("description").map_or("", |m| m.as_str());

        let version = MigrationVersion::parse(raw_version).map_err(|e| fail(e.to_string()))?;
        let description = Self::description(raw_description)
            .ok_or_else(|| fail("description must not be empty".to_string()))?;

        Ok(Some(ParsedName {
            version: Some(version),
            description,
        }))
    }

    fn description(raw: &str) -> Option<String> {
        let description = raw.replace('_', " ").trim().to_string();
        (!description.is_empty()).then_some(description)
    }

    /// Resolve a script resource; `Ok(None)` for files that are not migrations
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` for malformed names and non UTF-8 content.
    pub fn resolve_resource(
        &self,
        resource: &Resource,
    ) -> Result<Option<ResolvedMigration>, MigrationError> {
        let file_name = resource.file_name();
        let Some(stem) = file_name.strip_suffix(self.naming.suffix.as_str()) else {
            log::debug!("Skipping {}: no {} suffix", resource.name, self.naming.suffix);
            return Ok(None);
        };
        let Some(parsed) = self.parse_name(stem, &resource.name)? else {
            log::debug!("Skipping {}: not a migration name", resource.name);
            return Ok(None);
        };

        let bytes = resource
            .content
            .strip_prefix(b"\xEF\xBB\xBF".as_slice())
            .unwrap_or(&resource.content);
        let content = std::str::from_utf8(bytes).map_err(|e| MigrationError::Parse {
            resource: resource.name.clone(),
            reason: format!("content is not valid UTF-8: {e}"),
        })?;

        Ok(Some(ResolvedMigration {
            version: parsed.version,
            description: parsed.description,
            script: resource.name.clone(),
            checksum: Checksum::of_content(&resource.content, self.normalize_line_endings),
            source: MigrationSource::Script {
                content: content.to_string(),
            },
        }))
    }

    /// Resolve a procedural identity such as `app::migrations::V3_0__Seed`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the last path segment is not a migration name.
    pub fn resolve_procedural(&self, identity: &str) -> Result<ResolvedMigration, MigrationError> {
        let simple_name = match identity.rsplit_once("::") {
            Some((_, name)) => name,
            None => identity.rsplit_once('.').map_or(identity, |(_, name)| name),
        };
        let parsed = self.parse_name(simple_name, identity)?.ok_or_else(|| MigrationError::Parse {
            resource: identity.to_string(),
            reason: format!(
                "procedural migration names must start with '{}' or '{}'",
                self.naming.versioned_prefix, self.naming.repeatable_prefix
            ),
        })?;

        Ok(ResolvedMigration {
            version: parsed.version,
            description: parsed.description,
            script: identity.to_string(),
            checksum: Checksum::of_identity(identity),
            source: MigrationSource::Procedural {
                identity: identity.to_string(),
            },
        })
    }

    /// Build the ordered, duplicate-free catalog
    ///
    /// Versioned migrations come first in version order, followed by repeatable ones
    /// ordered by description.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` for malformed names and for two sources that
    /// resolve to the same key.
    pub fn resolve(
        &self,
        resources: &[Resource],
        procedures: Option<&dyn ProceduralRegistry>,
    ) -> Result<Vec<ResolvedMigration>, MigrationError> {
        let mut migrations = Vec::new();
        for resource in resources {
            if let Some(migration) = self.resolve_resource(resource)? {
                migrations.push(migration);
            }
        }
        if let Some(registry) = procedures {
            for identity in registry.identities() {
                migrations.push(self.resolve_procedural(&identity)?);
            }
        }

        let mut seen: HashMap<MigrationKey, &str> = HashMap::new();
        for migration in &migrations {
            if let Some(first) = seen.insert(migration.key(), migration.script.as_str()) {
                return Err(MigrationError::Parse {
                    resource: migration.script.clone(),
                    reason: format!(
                        "found more than one migration with {}: {first} and {}",
                        migration.key(),
                        migration.script
                    ),
                });
            }
        }

        migrations.sort_by(|a, b| match (&a.version, &b.version) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.description.cmp(&b.description),
        });
        Ok(migrations)
    }
}
