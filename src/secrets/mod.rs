//! Secret generation and redaction.
//!
//! Secret values live inside `SecretString`, whose `Debug`, `Display`, and
//! `Serialize` impls all emit `[REDACTED]`. The only places a raw value ever
//! leaves memory are the platform upload call and the distribution artifacts
//! written into the run's backup directory.

use crate::environment::Environment;
use crate::util::{atomic_write, hex_encode};
use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Default logical secret group uploaded for every (domain, environment).
pub const DEFAULT_SECRET_KEYS: [&str; 3] = ["API_KEY", "JWT_SECRET", "WEBHOOK_SECRET"];

/// A secret value that never renders itself.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Callers own the obligation not to log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// Serialization redacts: snapshots and audit details can safely embed
// secret-bearing structs.
impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SecretString(String::deserialize(deserializer)?))
    }
}

/// One generated secret.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedSecret {
    pub key: String,
    pub value: SecretString,
}

/// The secret set produced for a (scope, environment) pair.
#[derive(Debug, Clone, Serialize)]
pub struct SecretSet {
    pub scope: String,
    pub environment: Environment,
    pub secrets: Vec<GeneratedSecret>,
    /// True when an earlier generation for the same pair was reused.
    pub reused: bool,
}

impl SecretSet {
    pub fn key_names(&self) -> Vec<String> {
        self.secrets.iter().map(|s| s.key.clone()).collect()
    }
}

/// Generates (or reuses) secret sets per logical scope, at most once per
/// (scope, environment) for the life of the manager.
pub struct SecretManager {
    keys: Vec<String>,
    generated: Mutex<HashMap<(String, Environment), Vec<GeneratedSecret>>>,
}

impl SecretManager {
    pub fn new(keys: Vec<String>) -> Self {
        let keys = if keys.is_empty() {
            DEFAULT_SECRET_KEYS.iter().map(|k| k.to_string()).collect()
        } else {
            keys
        };
        Self {
            keys,
            generated: Mutex::new(HashMap::new()),
        }
    }

    /// Generate the secret set for a scope, reusing any earlier generation
    /// for the same (scope, environment).
    pub async fn generate_for(&self, scope: &str, environment: Environment) -> SecretSet {
        let mut generated = self.generated.lock().await;
        let entry = generated.entry((scope.to_string(), environment));
        match entry {
            std::collections::hash_map::Entry::Occupied(existing) => SecretSet {
                scope: scope.to_string(),
                environment,
                secrets: existing.get().clone(),
                reused: true,
            },
            std::collections::hash_map::Entry::Vacant(slot) => {
                let secrets: Vec<GeneratedSecret> = self
                    .keys
                    .iter()
                    .map(|key| GeneratedSecret {
                        key: key.clone(),
                        value: random_secret(),
                    })
                    .collect();
                slot.insert(secrets.clone());
                SecretSet {
                    scope: scope.to_string(),
                    environment,
                    secrets,
                    reused: false,
                }
            }
        }
    }

    /// Write a `.env`-style artifact into the backup directory. This file is
    /// the one sanctioned sink for raw values besides the platform upload.
    pub fn write_env_artifact(&self, dir: &Path, set: &SecretSet) -> Result<PathBuf> {
        let path = dir.join(format!("{}.{}.env", set.scope, set.environment));
        let mut body = String::new();
        for secret in &set.secrets {
            body.push_str(&format!("{}={}\n", secret.key, secret.value.expose()));
        }
        atomic_write(&path, body.as_bytes())?;
        Ok(path)
    }

    /// Write a CLI upload script mirroring the platform distribution.
    pub fn write_upload_script(&self, dir: &Path, cli: &str, set: &SecretSet) -> Result<PathBuf> {
        let path = dir.join(format!("{}.{}.secrets.sh", set.scope, set.environment));
        let mut body = String::from("#!/bin/sh\nset -eu\n");
        for secret in &set.secrets {
            body.push_str(&format!(
                "printf '%s' '{}' | {} secret put {} --env {}\n",
                secret.value.expose().replace('\'', "'\\''"),
                cli,
                secret.key,
                set.environment
            ));
        }
        atomic_write(&path, body.as_bytes())?;
        Ok(path)
    }
}

fn random_secret() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    SecretString::new(hex_encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn secret_string_never_renders_its_value() {
        let secret = SecretString::new("super-sensitive");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"[REDACTED]\"");
        assert_eq!(secret.expose(), "super-sensitive");
    }

    #[tokio::test]
    async fn generates_default_key_set() {
        let manager = SecretManager::new(Vec::new());
        let set = manager
            .generate_for("api.example.com", Environment::Production)
            .await;
        assert_eq!(set.key_names(), vec!["API_KEY", "JWT_SECRET", "WEBHOOK_SECRET"]);
        assert!(!set.reused);
        for secret in &set.secrets {
            assert_eq!(secret.value.expose().len(), 64);
        }
    }

    #[tokio::test]
    async fn reuses_generation_per_scope_and_environment() {
        let manager = SecretManager::new(vec!["API_KEY".to_string()]);
        let first = manager.generate_for("shared-auth", Environment::Staging).await;
        let second = manager.generate_for("shared-auth", Environment::Staging).await;
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(
            first.secrets[0].value.expose(),
            second.secrets[0].value.expose()
        );

        // A different environment generates fresh material.
        let other = manager
            .generate_for("shared-auth", Environment::Production)
            .await;
        assert!(!other.reused);
        assert_ne!(
            first.secrets[0].value.expose(),
            other.secrets[0].value.expose()
        );
    }

    #[tokio::test]
    async fn env_artifact_contains_raw_values() {
        let dir = tempdir().unwrap();
        let manager = SecretManager::new(vec!["API_KEY".to_string()]);
        let set = manager
            .generate_for("api.example.com", Environment::Development)
            .await;
        let path = manager.write_env_artifact(dir.path(), &set).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.starts_with("API_KEY="));
        assert!(body.contains(set.secrets[0].value.expose()));
        assert!(!body.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn upload_script_targets_configured_cli() {
        let dir = tempdir().unwrap();
        let manager = SecretManager::new(vec!["API_KEY".to_string()]);
        let set = manager
            .generate_for("api.example.com", Environment::Staging)
            .await;
        let path = manager
            .write_upload_script(dir.path(), "wrangler", &set)
            .unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("wrangler secret put API_KEY --env staging"));
    }
}
