//! Migration resource discovery

use crate::migration::MigrationError;
use std::fs;
use std::path::{Path, PathBuf};

/// Raw migration resource: identifying name plus content bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Name of the resource, possibly with a location path (`db/migration/V1__init.cql`)
    pub name: String,
    pub content: Vec<u8>,
}

impl Resource {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// File name without any location path
    pub fn file_name(&self) -> &str {
        self.name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.name.as_str())
    }
}

/// Capability that lists candidate migration resources
pub trait ResourceLister: Send + Sync {
    /// # Errors
    ///
    /// Returns `MigrationError::Resource` if the resources cannot be listed or read.
    fn list(&self) -> Result<Vec<Resource>, MigrationError>;
}

/// Lists every file below a set of directories
///
/// Resource names are the paths relative to the scanned location, joined with `/`.
#[derive(Debug, Clone)]
pub struct DirectoryLister {
    locations: Vec<PathBuf>,
}

impl DirectoryLister {
    pub fn new<I, P>(locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            locations: locations
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
        }
    }

    fn scan(root: &Path, dir: &Path, out: &mut Vec<Resource>) -> Result<(), MigrationError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            MigrationError::Resource(format!(
                "failed to read migrations directory {}: {e}",
                dir.display()
            ))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::Resource(format!("failed to read directory entry: {e}"))
            })?;
            let path = entry.path();

            if path.is_dir() {
                Self::scan(root, &path, out)?;
                continue;
            }

            let content = fs::read(&path).map_err(|e| {
                MigrationError::Resource(format!(
                    "failed to read migration file {}: {e}",
                    path.display()
                ))
            })?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(Resource::new(name, content));
        }

        Ok(())
    }
}

impl ResourceLister for DirectoryLister {
    fn list(&self) -> Result<Vec<Resource>, MigrationError> {
        let mut resources = Vec::new();

        for location in &self.locations {
            if !location.exists() {
                log::warn!(
                    "Migration location {} does not exist, skipping",
                    location.display()
                );
                continue;
            }
            if !location.is_dir() {
                return Err(MigrationError::Resource(format!(
                    "migration location is not a directory: {}",
                    location.display()
                )));
            }
            Self::scan(location, location, &mut resources)?;
        }

        // read_dir order is platform dependent
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_strips_location() {
        assert_eq!(Resource::new("db/migration/V1__init.cql", "").file_name(), "V1__init.cql");
        assert_eq!(Resource::new("V1__init.cql", "").file_name(), "V1__init.cql");
        assert_eq!(Resource::new("db\\V2__x.cql", "").file_name(), "V2__x.cql");
    }

    #[test]
    #[allow(clippy::expect_used)] // Test code - expect is acceptable
    fn test_directory_lister_recurses_and_sorts() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("nested")).expect("nested dir");
        fs::write(dir.path().join("V2__second.cql"), "SELECT 2;").expect("write");
        fs::write(dir.path().join("V1__first.cql"), "SELECT 1;").expect("write");
        fs::write(dir.path().join("nested").join("R__view.cql"), "SELECT 3;").expect("write");

        let lister = DirectoryLister::new([dir.path()]);
        let resources = lister.list().expect("listing succeeds");
        let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();

        assert_eq!(names, vec!["V1__first.cql", "V2__second.cql", "nested/R__view.cql"]);
        assert_eq!(resources[0].content, b"SELECT 1;");
    }

    #[test]
    #[allow(clippy::expect_used)] // Test code - expect is acceptable
    fn test_directory_lister_skips_missing_location() {
        let dir = tempfile::tempdir().expect("temp dir");
        let lister = DirectoryLister::new([dir.path().join("does-not-exist")]);
        assert!(lister.list().expect("missing location is not an error").is_empty());
    }

    #[test]
    #[allow(clippy::expect_used)] // Test code - expect is acceptable
    fn test_directory_lister_rejects_file_location() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = dir.path().join("V1__init.cql");
        fs::write(&file, "SELECT 1;").expect("write");

        let err = DirectoryLister::new([file]).list().expect_err("file location is invalid");
        assert!(matches!(err, MigrationError::Resource(_)));
    }
}
