//! Shared-resource preparation and cross-domain CORS validation.
//!
//! A resource shared by several domains (a database, a secret group) is
//! prepared exactly once per run: a per-resource lock serializes concurrent
//! preparations and a prepared-set makes repeats no-ops.

use crate::environment::Environment;
use crate::errors::PlatformError;
use crate::platform::Platform;
use crate::resolver::DomainConfig;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// What preparing a shared database did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    Created { first_time: bool },
    Found { first_time: bool },
    AlreadyPrepared,
}

#[derive(Default)]
pub struct SharedResources {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    prepared: Mutex<HashSet<String>>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensure a shared database exists, at most once per run. Concurrent
    /// callers for the same resource serialize on the per-resource lock;
    /// later callers observe `AlreadyPrepared`.
    pub async fn prepare_database(
        &self,
        platform: &Arc<dyn Platform>,
        name: &str,
        environment: Environment,
    ) -> Result<Prepared, PlatformError> {
        let key = format!("db:{name}:{environment}");
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        if self.prepared.lock().await.contains(&key) {
            return Ok(Prepared::AlreadyPrepared);
        }

        let outcome = if platform.database_exists(name).await? {
            Prepared::Found { first_time: true }
        } else {
            platform.create_database(name).await?;
            info!(database = name, %environment, "created shared database");
            Prepared::Created { first_time: true }
        };
        self.prepared.lock().await.insert(key);
        Ok(outcome)
    }

    /// Mark a logical secret group prepared; returns false when it already
    /// was. The actual generation lives in the `SecretManager`, which also
    /// dedupes per scope.
    pub async fn claim_secret_group(&self, group: &str, environment: Environment) -> bool {
        let key = format!("secrets:{group}:{environment}");
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;
        self.prepared.lock().await.insert(key)
    }
}

/// One CORS incompatibility between two portfolio domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsMismatch {
    pub from: String,
    pub to: String,
    pub missing_origin: String,
}

impl std::fmt::Display for CorsMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} does not allow {} (origin {})",
            self.from, self.to, self.missing_origin
        )
    }
}

/// Check every ordered pair of domains in one environment: does A's origin
/// list allow B's environment URL? Mismatches are warnings, never fatal.
pub fn validate_cors(
    configs: &BTreeMap<String, DomainConfig>,
    environment: Environment,
) -> Vec<CorsMismatch> {
    let mut mismatches = Vec::new();
    for (from, from_config) in configs {
        let Some(origins) = from_config.cors_origins.get(&environment) else {
            // No CORS policy declared: nothing to check for this domain.
            continue;
        };
        for (to, to_config) in configs {
            if from == to {
                continue;
            }
            let url = to_config.environments.get(environment);
            if !origins.iter().any(|origin| origin_allows(origin, url)) {
                mismatches.push(CorsMismatch {
                    from: from.clone(),
                    to: to.clone(),
                    missing_origin: url.to_string(),
                });
            }
        }
    }
    mismatches
}

/// Origin matching: exact, global wildcard, or suffix match after stripping
/// the scheme and any leading wildcard.
fn origin_allows(origin: &str, url: &str) -> bool {
    if origin == "*" || origin == url {
        return true;
    }
    let host = url.trim_start_matches("https://").trim_start_matches("http://");
    let pattern = origin
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == pattern || host.contains(pattern)
}
