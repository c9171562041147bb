//! Scriptable platform fake used by the unit and scenario suites.
//!
//! Records every capability call, simulates database existence, scripts
//! deploy and health-check outcomes, and can be armed to panic on any
//! mutating call for dry-run purity checks.

use super::{CommandOutput, HealthProbe, Platform};
use crate::environment::Environment;
use crate::errors::PlatformError;
use crate::secrets::SecretString;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Default stdout returned by scripted deploys.
pub const DEFAULT_DEPLOY_STDOUT: &str =
    "Total Upload: 48.2 KiB\nDeployed to https://worker.example.workers.dev\nCurrent Version ID: 1";

#[derive(Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<String>>,
    databases: Mutex<HashSet<String>>,
    /// Scripted deploy outcomes, consumed front-first; empty means success
    /// with `DEFAULT_DEPLOY_STDOUT`.
    deploy_script: Mutex<VecDeque<Result<CommandOutput, PlatformError>>>,
    /// Scripted health outcomes, consumed front-first; empty means HTTP 200.
    health_script: Mutex<VecDeque<Result<HealthProbe, PlatformError>>>,
    /// When set, any mutating call panics. Used to prove dry-run purity.
    forbid_mutations: bool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake that treats every mutating capability call as a test failure.
    pub fn read_only() -> Self {
        Self {
            forbid_mutations: true,
            ..Self::default()
        }
    }

    pub fn with_existing_database(self, name: &str) -> Self {
        self.databases.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn push_deploy_result(&self, result: Result<CommandOutput, PlatformError>) {
        self.deploy_script.lock().unwrap().push_back(result);
    }

    pub fn push_health_result(&self, result: Result<HealthProbe, PlatformError>) {
        self.health_script.lock().unwrap().push_back(result);
    }

    /// All recorded calls, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls that mutate platform state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                call.starts_with("create_database")
                    || call.starts_with("apply_migrations")
                    || call.starts_with("put_secret")
                    || call.starts_with("delete_")
                    || call.starts_with("deploy_worker")
            })
            .collect()
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String, mutating: bool) {
        if mutating && self.forbid_mutations {
            panic!("mutating platform call during a run that promised none: {call}");
        }
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn database_exists(&self, name: &str) -> Result<bool, PlatformError> {
        self.record(format!("database_exists {name}"), false);
        Ok(self.databases.lock().unwrap().contains(name))
    }

    async fn create_database(&self, name: &str) -> Result<String, PlatformError> {
        self.record(format!("create_database {name}"), true);
        self.databases.lock().unwrap().insert(name.to_string());
        Ok(format!("uuid-{name}"))
    }

    async fn get_database_id(&self, name: &str) -> Result<String, PlatformError> {
        self.record(format!("get_database_id {name}"), false);
        if self.databases.lock().unwrap().contains(name) {
            Ok(format!("uuid-{name}"))
        } else {
            Err(PlatformError::NotFound(format!("database '{name}'")))
        }
    }

    async fn apply_migrations(
        &self,
        database: &str,
        binding: &str,
        environment: Environment,
        remote: bool,
    ) -> Result<(), PlatformError> {
        self.record(
            format!("apply_migrations {database} {binding} {environment} remote={remote}"),
            true,
        );
        Ok(())
    }

    async fn put_secret(
        &self,
        scope: &str,
        key: &str,
        _value: &SecretString,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        // Deliberately records the key but never the value.
        self.record(format!("put_secret {scope} {key} {environment}"), true);
        Ok(())
    }

    async fn delete_secret(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.record(format!("delete_secret {key} {environment}"), true);
        Ok(())
    }

    async fn deploy_worker(
        &self,
        environment: Environment,
        working_dir: &Path,
    ) -> Result<CommandOutput, PlatformError> {
        self.record(
            format!("deploy_worker {environment} {}", working_dir.display()),
            true,
        );
        match self.deploy_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CommandOutput {
                stdout: DEFAULT_DEPLOY_STDOUT.to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
        }
    }

    async fn delete_worker(
        &self,
        name: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.record(format!("delete_worker {name} {environment}"), true);
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> Result<(), PlatformError> {
        self.record(format!("delete_database {name}"), true);
        self.databases.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_workers(&self) -> Result<String, PlatformError> {
        self.record("list_workers".to_string(), false);
        Ok("api-example-com-data-service\nauth-example-com-data-service".to_string())
    }

    async fn list_secrets(&self) -> Result<String, PlatformError> {
        self.record("list_secrets".to_string(), false);
        Ok("API_KEY\nJWT_SECRET".to_string())
    }

    async fn list_databases(&self) -> Result<String, PlatformError> {
        self.record("list_databases".to_string(), false);
        let names: Vec<String> = self.databases.lock().unwrap().iter().cloned().collect();
        Ok(names.join("\n"))
    }

    async fn health_check(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> Result<HealthProbe, PlatformError> {
        self.record(format!("health_check {url}"), false);
        match self.health_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(HealthProbe {
                status_code: 200,
                response_time_ms: 12,
            }),
        }
    }
}
