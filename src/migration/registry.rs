//! Procedural migration registry
//!
//! Procedural migrations are registered explicitly by the embedding application instead
//! of being discovered by scanning, so there is no process-wide state: the coordinator
//! receives the registry it should use.

use crate::migration::{MigrationError, ProceduralMigration};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lookup capability for procedural migrations
pub trait ProceduralRegistry: Send + Sync {
    /// All identities this registry can resolve, used to build the catalog
    fn identities(&self) -> Vec<String>;

    /// The callable registered under `identity`, if any
    fn lookup(&self, identity: &str) -> Option<Arc<dyn ProceduralMigration>>;
}

/// In-memory procedural registry
#[derive(Default, Clone)]
pub struct MigrationRegistry {
    migrations: BTreeMap<String, Arc<dyn ProceduralMigration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration under its identity
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the identity is already registered.
    pub fn register(
        &mut self,
        identity: impl Into<String>,
        migration: impl ProceduralMigration + 'static,
    ) -> Result<(), MigrationError> {
        let identity = identity.into();
        if self.migrations.contains_key(&identity) {
            return Err(MigrationError::Parse {
                resource: identity,
                reason: "procedural migration is already registered".to_string(),
            });
        }
        self.migrations.insert(identity, Arc::new(migration));
        Ok(())
    }

    /// Builder-style registration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the identity is already registered.
    pub fn with(
        mut self,
        identity: impl Into<String>,
        migration: impl ProceduralMigration + 'static,
    ) -> Result<Self, MigrationError> {
        self.register(identity, migration)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl ProceduralRegistry for MigrationRegistry {
    fn identities(&self) -> Vec<String> {
        self.migrations.keys().cloned().collect()
    }

    fn lookup(&self, identity: &str) -> Option<Arc<dyn ProceduralMigration>> {
        self.migrations.get(identity).cloned()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("identities", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}
