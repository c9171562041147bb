//! Layered configuration for the armada orchestrator.
//!
//! Settings come from `armada.toml` in the working directory, overlaid by
//! environment variables and CLI flags. Every section deserializes with
//! defaults so a missing file behaves like a default one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! parallel_limit = 3
//! batch_pause_secs = 2
//! state_root = "./deployments"
//! backup_root = "./backups"
//! enable_auto_rollback = true
//! enable_shared_resources = true
//!
//! [platform]
//! mode = "shell"
//! cli = "wrangler"
//! base_url = "https://api.cloudflare.com/client/v4"
//! command_timeout_secs = 120
//! database_binding = "DB"
//!
//! [resolver]
//! public_suffixes = ["co.uk"]
//! skip_patterns = ["*.workers.dev"]
//!
//! [secrets]
//! keys = ["API_KEY", "JWT_SECRET", "WEBHOOK_SECRET"]
//!
//! [domains."api.example.com"]
//! dependencies = ["auth.example.com"]
//! ```

use crate::resolver::DomainOverrides;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

pub mod store;
pub mod wrangler;

pub use store::ConfigStore;
pub use wrangler::{CustomerConfigOptions, DatabaseBinding, WranglerManager};

pub const CONFIG_FILE: &str = "armada.toml";

/// Scheduler and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    #[serde(default = "default_batch_pause_secs")]
    pub batch_pause_secs: u64,
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
    #[serde(default)]
    pub skip_tests: bool,
    #[serde(default = "default_true")]
    pub enable_auto_rollback: bool,
    #[serde(default = "default_true")]
    pub enable_shared_resources: bool,
    #[serde(default = "default_true")]
    pub persistence_enabled: bool,
}

fn default_parallel_limit() -> usize {
    3
}

fn default_batch_pause_secs() -> u64 {
    2
}

fn default_state_root() -> PathBuf {
    PathBuf::from("./deployments")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            parallel_limit: default_parallel_limit(),
            batch_pause_secs: default_batch_pause_secs(),
            state_root: default_state_root(),
            backup_root: default_backup_root(),
            skip_tests: false,
            enable_auto_rollback: true,
            enable_shared_resources: true,
            persistence_enabled: true,
        }
    }
}

/// Which platform adapter backs the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformMode {
    #[default]
    Shell,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    #[serde(default)]
    pub mode: PlatformMode,
    #[serde(default = "default_cli")]
    pub cli: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_database_binding")]
    pub database_binding: String,
}

fn default_cli() -> String {
    "wrangler".to_string()
}

fn default_base_url() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_database_binding() -> String {
    "DB".to_string()
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            mode: PlatformMode::Shell,
            cli: default_cli(),
            base_url: default_base_url(),
            command_timeout_secs: default_command_timeout_secs(),
            database_binding: default_database_binding(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverSection {
    /// Public-suffix entries consulted for root-domain derivation.
    #[serde(default)]
    pub public_suffixes: Vec<String>,
    /// Glob patterns for synthetic subdomains to skip during discovery.
    /// Provider strings are configuration, never code.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsSection {
    /// Logical secret group uploaded per (domain, environment).
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Optional pipeline override: phase names plus criticality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default)]
    pub pipeline: Vec<PhaseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub name: String,
    #[serde(default)]
    pub critical: bool,
}

/// The full `armada.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmadaToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub secrets: SecretsSection,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub domains: HashMap<String, DomainOverrides>,
}

impl ArmadaToml {
    pub fn path_in(working_dir: &Path) -> PathBuf {
        working_dir.join(CONFIG_FILE)
    }

    /// Load from the working directory, falling back to defaults when the
    /// file is absent.
    pub fn load_or_default(working_dir: &Path) -> Result<Self> {
        let path = Self::path_in(working_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, working_dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(working_dir);
        let content = toml::to_string_pretty(self).context("Failed to serialize armada.toml")?;
        crate::util::atomic_write(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Validate settings. Fatal issues come back as `Err`; the `Ok` vec
    /// holds warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let limit = self.orchestrator.parallel_limit;
        if !(1..=10).contains(&limit) {
            anyhow::bail!("orchestrator.parallel_limit must be between 1 and 10, got {limit}");
        }
        if limit > 5 {
            warnings.push(format!(
                "parallel_limit {limit} is above 5; platform rate limiting may slow batches down"
            ));
        }
        for entry in &self.phases.pipeline {
            if entry.name.trim().is_empty() {
                anyhow::bail!("phases.pipeline contains an entry with an empty name");
            }
        }
        for pattern in &self.resolver.skip_patterns {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("resolver.skip_patterns entry '{pattern}' is not a valid glob"));
            }
        }
        Ok(warnings)
    }
}

/// Advisory lock making a working directory run-exclusive. Held for the
/// life of the orchestration; dropped on scope exit.
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(working_dir: &Path) -> Result<Self> {
        let path = working_dir.join(".armada.lock");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create lock file {}", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another orchestration already holds {}; concurrent runs against one working directory are not supported",
                path.display()
            )
        })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
