//! File-backed configuration store.
//!
//! Maps well-known keys to files in the working directory. Writes are
//! atomic (temp + rename) and back the destination up first, so every write
//! is reversible via a `restore-file` rollback action.

use crate::util::{atomic_write, timestamped_backup};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Well-known configuration files the orchestrator reads and backs up.
pub const WELL_KNOWN_KEYS: [&str; 4] = ["package", "wrangler", "env", "domains"];

pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a well-known key to its file path.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let file = match key {
            "package" => "package.json",
            "wrangler" => "wrangler.toml",
            "env" => ".env",
            "domains" => super::CONFIG_FILE,
            other => anyhow::bail!("Unknown config key '{other}'"),
        };
        Ok(self.root.join(file))
    }

    /// Paths for every well-known key that currently exists on disk.
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        WELL_KNOWN_KEYS
            .iter()
            .filter_map(|key| self.path_for(key).ok())
            .filter(|path| path.exists())
            .collect()
    }

    pub fn read(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config '{key}' at {}", path.display()))
    }

    /// Atomic write with backup-on-write. Returns the backup path when the
    /// destination already existed.
    pub fn write(&self, key: &str, contents: &str) -> Result<Option<PathBuf>> {
        let path = self.path_for(key)?;
        let backup = timestamped_backup(&path)?;
        atomic_write(&path, contents.as_bytes())?;
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_for_known_keys() {
        let store = ConfigStore::new("/work");
        assert_eq!(store.path_for("wrangler").unwrap(), Path::new("/work/wrangler.toml"));
        assert_eq!(store.path_for("env").unwrap(), Path::new("/work/.env"));
        assert!(store.path_for("bogus").is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let backup = store.write("package", "{\"name\":\"svc\"}").unwrap();
        assert!(backup.is_none());
        assert_eq!(store.read("package").unwrap(), "{\"name\":\"svc\"}");
    }

    #[test]
    fn second_write_backs_up_first() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.write("wrangler", "name = \"one\"").unwrap();
        let backup = store.write("wrangler", "name = \"two\"").unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "name = \"one\"");
        assert_eq!(store.read("wrangler").unwrap(), "name = \"two\"");
    }

    #[test]
    fn existing_paths_only_lists_present_files() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.existing_paths().is_empty());
        store.write("env", "KEY=value").unwrap();
        let paths = store.existing_paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with(".env"));
    }
}
