//! Pre-run state backup.
//!
//! Copies the well-known configuration files into a per-run directory,
//! captures textual platform listings (names only, never values), writes a
//! manifest, and emits one `restore-file` rollback action per backed-up
//! file.

use super::{PRIORITY_RESTORE_FILE, RollbackAction, RollbackTarget};
use crate::config::ConfigStore;
use crate::platform::Platform;
use crate::util::{atomic_write, encode_path};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub include_platform: bool,
    pub include_database: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_platform: true,
            include_database: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Written once per run; referenced by restore-file rollback actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<BackedUpFile>,
    pub platform_state: serde_json::Value,
    pub database_state: serde_json::Value,
}

pub struct BackupManager {
    platform: Arc<dyn Platform>,
    store: ConfigStore,
    backup_root: PathBuf,
    run_id: String,
}

impl BackupManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: ConfigStore,
        backup_root: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            store,
            backup_root: backup_root.into(),
            run_id: run_id.into(),
        }
    }

    fn configs_dir(&self) -> PathBuf {
        self.backup_root.join("configs").join(&self.run_id)
    }

    fn deployments_dir(&self) -> PathBuf {
        self.backup_root.join("deployments").join(&self.run_id)
    }

    /// Copy configs, capture platform listings, and write the manifest.
    /// Returns the manifest and the restore-file actions to record.
    pub async fn create_state_backup(
        &self,
        options: BackupOptions,
    ) -> Result<(BackupManifest, Vec<RollbackAction>)> {
        let mut files = Vec::new();
        let mut actions = Vec::new();

        for original in self.store.existing_paths() {
            let backup = self.backup_file(&original)?;
            actions.push(RollbackAction::new(
                RollbackTarget::RestoreFile {
                    original_path: original.clone(),
                    backup_path: backup.clone(),
                },
                PRIORITY_RESTORE_FILE,
                format!("restore {}", original.display()),
            ));
            files.push(BackedUpFile {
                original_path: original,
                backup_path: backup,
                timestamp: Utc::now(),
            });
        }

        let platform_state = if options.include_platform {
            self.capture_platform_state().await
        } else {
            json!({})
        };
        let database_state = if options.include_database {
            self.capture_database_state().await
        } else {
            json!({})
        };

        let manifest = BackupManifest {
            run_id: self.run_id.clone(),
            created_at: Utc::now(),
            files,
            platform_state,
            database_state,
        };

        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        atomic_write(
            &self.deployments_dir().join("backup-manifest.json"),
            manifest_json.as_bytes(),
        )
        .context("Failed to write backup manifest")?;

        Ok((manifest, actions))
    }

    fn backup_file(&self, original: &Path) -> Result<PathBuf> {
        let destination = self.configs_dir().join(encode_path(original));
        let contents = std::fs::read(original)
            .with_context(|| format!("Failed to read {}", original.display()))?;
        atomic_write(&destination, &contents)?;
        Ok(destination)
    }

    /// Worker and secret listings. Secret values are never requested, let
    /// alone captured.
    async fn capture_platform_state(&self) -> serde_json::Value {
        let workers = match self.platform.list_workers().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "could not capture worker listing for backup");
                String::new()
            }
        };
        let secrets = match self.platform.list_secrets().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "could not capture secret listing for backup");
                String::new()
            }
        };
        let state = json!({ "workers": workers, "secret_names": secrets });
        if let Err(err) = atomic_write(
            &self.deployments_dir().join("platform-state.json"),
            serde_json::to_string_pretty(&state)
                .unwrap_or_default()
                .as_bytes(),
        ) {
            warn!(error = %err, "could not write platform-state.json");
        }
        state
    }

    async fn capture_database_state(&self) -> serde_json::Value {
        let databases = match self.platform.list_databases().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "could not capture database listing for backup");
                String::new()
            }
        };
        let state = json!({ "databases": databases });
        let dir = self.backup_root.join("database").join(&self.run_id);
        if let Err(err) = atomic_write(
            &dir.join("database-state.json"),
            serde_json::to_string_pretty(&state)
                .unwrap_or_default()
                .as_bytes(),
        ) {
            warn!(error = %err, "could not write database-state.json");
        }
        state
    }
}
