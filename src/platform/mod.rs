//! Platform adapter: the narrow capability set the orchestrator consumes.
//!
//! Two implementations ship with the crate: an authenticated HTTP client
//! (`HttpPlatform`) and a local CLI wrapper (`ShellPlatform`). The
//! orchestrator core only ever sees the `Platform` trait. A scriptable
//! `RecordingPlatform` backs the test suites.

use crate::environment::Environment;
use crate::errors::PlatformError;
use crate::secrets::SecretString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod http;
pub mod retry;
pub mod shell;
pub mod testing;

pub use http::HttpPlatform;
pub use shell::ShellPlatform;

/// Default per-command timeout for platform operations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Output of a worker deployment invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Result of a single health-check probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    pub status_code: u16,
    pub response_time_ms: u64,
}

/// Credentials and identity material for platform calls.
#[derive(Debug, Clone, Default)]
pub struct PlatformAuth {
    pub api_token: Option<SecretString>,
    pub account_id: Option<String>,
    pub zone_id: Option<String>,
    /// Secondary token used for the one-shot OAuth fallback after a
    /// `PermissionDenied`. Using it logs a warning that the effective
    /// identity changed.
    pub fallback_token: Option<SecretString>,
}

impl PlatformAuth {
    /// Read credentials from the process environment. Missing values stay
    /// `None`; prerequisite validation reports them as warnings.
    pub fn from_env() -> Self {
        let read = |var: &str| std::env::var(var).ok().filter(|v| !v.is_empty());
        Self {
            api_token: read("CLOUDFLARE_API_TOKEN").map(SecretString::new),
            account_id: read("CLOUDFLARE_ACCOUNT_ID"),
            zone_id: read("CLOUDFLARE_ZONE_ID"),
            fallback_token: read("CLOUDFLARE_OAUTH_TOKEN").map(SecretString::new),
        }
    }
}

/// The capability set the deployment core consumes.
///
/// Every method suspends on I/O and returns a typed `PlatformError` on
/// failure. Adapters own their retry discipline (3 attempts, 2s delay,
/// jittered for rate limits); callers treat a returned error as final.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool, PlatformError>;

    /// Create a managed database and return its platform identifier.
    async fn create_database(&self, name: &str) -> Result<String, PlatformError>;

    async fn get_database_id(&self, name: &str) -> Result<String, PlatformError>;

    async fn apply_migrations(
        &self,
        database: &str,
        binding: &str,
        environment: Environment,
        remote: bool,
    ) -> Result<(), PlatformError>;

    async fn put_secret(
        &self,
        scope: &str,
        key: &str,
        value: &SecretString,
        environment: Environment,
    ) -> Result<(), PlatformError>;

    async fn delete_secret(&self, key: &str, environment: Environment)
    -> Result<(), PlatformError>;

    async fn deploy_worker(
        &self,
        environment: Environment,
        working_dir: &Path,
    ) -> Result<CommandOutput, PlatformError>;

    async fn delete_worker(&self, name: &str, environment: Environment)
    -> Result<(), PlatformError>;

    async fn delete_database(&self, name: &str) -> Result<(), PlatformError>;

    /// Textual listing of deployed workers. Values are never included.
    async fn list_workers(&self) -> Result<String, PlatformError>;

    /// Textual listing of secret names. Values are never included.
    async fn list_secrets(&self) -> Result<String, PlatformError>;

    /// Textual listing of managed databases.
    async fn list_databases(&self) -> Result<String, PlatformError>;

    async fn health_check(&self, url: &str, timeout: Duration)
    -> Result<HealthProbe, PlatformError>;
}

/// Shared HTTP health probe used by both adapters.
pub(crate) async fn http_health_check(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<HealthProbe, PlatformError> {
    let started = std::time::Instant::now();
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                PlatformError::Timeout {
                    operation: format!("health check {url}"),
                    seconds: timeout.as_secs(),
                }
            } else {
                PlatformError::Transport(format!("health check {url}: {e}"))
            }
        })?;
    Ok(HealthProbe {
        status_code: response.status().as_u16(),
        response_time_ms: started.elapsed().as_millis() as u64,
    })
}
