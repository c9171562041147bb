//! CLI command handlers for the armada binary.

use anyhow::Result;
use armada::config::{ArmadaToml, PlatformMode};
use armada::environment::Environment;
use armada::errors::OrchestratorError;
use armada::platform::{DEFAULT_COMMAND_TIMEOUT, HttpPlatform, Platform, PlatformAuth, ShellPlatform};
use armada::resolver::DomainResolver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod backup;
pub mod config;
pub mod deploy;
pub mod health;
pub mod resolve;
pub mod rollback;
pub mod status;

/// Load `armada.toml` and run its validation. Fatal issues become a typed
/// configuration error; warnings flow into the initialization phase.
pub fn load_config(working_dir: &Path) -> Result<(ArmadaToml, Vec<String>)> {
    let config = ArmadaToml::load_or_default(working_dir)?;
    let warnings = config
        .validate()
        .map_err(|e| OrchestratorError::Config(e.to_string()))?;
    Ok((config, warnings))
}

pub fn build_resolver(config: &ArmadaToml) -> Arc<DomainResolver> {
    Arc::new(DomainResolver::new(
        config.domains.clone(),
        config.resolver.public_suffixes.clone(),
    ))
}

pub fn build_platform(config: &ArmadaToml, working_dir: &Path) -> Arc<dyn Platform> {
    let timeout = if config.platform.command_timeout_secs == 0 {
        DEFAULT_COMMAND_TIMEOUT
    } else {
        Duration::from_secs(config.platform.command_timeout_secs)
    };
    match config.platform.mode {
        PlatformMode::Http => Arc::new(HttpPlatform::new(
            config.platform.base_url.clone(),
            PlatformAuth::from_env(),
            timeout,
        )),
        PlatformMode::Shell => Arc::new(ShellPlatform::new(
            config.platform.cli.clone(),
            working_dir,
            timeout,
        )),
    }
}

/// Resolve a configured root against the working directory.
fn resolve_root(working_dir: &Path, root: &Path) -> PathBuf {
    if root.is_absolute() {
        root.to_path_buf()
    } else {
        working_dir.join(root)
    }
}

pub fn state_root(config: &ArmadaToml, working_dir: &Path) -> PathBuf {
    resolve_root(working_dir, &config.orchestrator.state_root)
}

pub fn backup_root(config: &ArmadaToml, working_dir: &Path) -> PathBuf {
    resolve_root(working_dir, &config.orchestrator.backup_root)
}

/// Environment from the CLI flag, falling back to `ENVIRONMENT`/`NODE_ENV`.
pub fn pick_environment(flag: Option<Environment>) -> Environment {
    flag.unwrap_or_else(Environment::from_env)
}
