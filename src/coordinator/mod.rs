//! Deployment coordinator: the per-domain phase state machine and the
//! batched portfolio scheduler.
//!
//! Each domain walks a fixed pipeline (validation, initialization,
//! database, secrets, deployment, post-validation). Critical phase failures
//! terminate the domain; non-critical failures downgrade the final status
//! to `completed_with_warnings`. Everything a phase creates gets a matching
//! rollback action.

use crate::config::{CustomerConfigOptions, DatabaseBinding, WranglerManager};
use crate::environment::Environment;
use crate::errors::OrchestratorError;
use crate::platform::Platform;
use crate::resolver::{DomainConfig, DomainResolver};
use crate::rollback::{
    PRIORITY_DELETE_DATABASE, PRIORITY_DELETE_SECRET, PRIORITY_DELETE_WORKER,
    PRIORITY_RESTORE_FILE, RollbackAction, RollbackTarget,
};
use crate::secrets::SecretManager;
use crate::state::{AuditEvent, DomainPatch, DomainState, PhaseRecord, StateManager};
use crate::util::{atomic_write, encode_path, extract_https_url};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod phases;
pub mod scheduler;

pub use phases::{PhaseOutput, PhaseSpec, default_pipeline, pipeline_from_config};
pub use scheduler::{BatchOutcome, DomainFailure, contiguous_batches, validate_parallel_limit};

/// Health-check discipline for post-validation.
const HEALTH_ATTEMPTS: u32 = 3;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Simulated phase latency under dry-run.
const DRY_RUN_PHASE_DELAY: Duration = Duration::from_millis(100);

/// A phase failure carrying the phase that raised it.
#[derive(Debug, Error)]
#[error("phase '{phase}' failed for {domain}: {source}")]
pub struct PhaseFailure {
    pub domain: String,
    pub phase: String,
    #[source]
    pub source: OrchestratorError,
}

/// Optional caller-supplied validator consulted during the validation
/// phase.
#[async_trait]
pub trait DomainValidator: Send + Sync {
    async fn validate(&self, domain: &str, config: &DomainConfig) -> ValidationVerdict;
}

#[derive(Debug, Clone, Default)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Events emitted during deployment, for progress rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    DomainStarted {
        domain: String,
    },
    PhaseCompleted {
        domain: String,
        phase: String,
        success: bool,
    },
    DomainFinished {
        domain: String,
        success: bool,
    },
    BatchStarted {
        batch: usize,
        domains: Vec<String>,
    },
    BatchCompleted {
        batch: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// Run-scoped settings for the coordinator.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub environment: Environment,
    pub working_dir: PathBuf,
    pub backup_root: PathBuf,
    pub dry_run: bool,
    pub skip_tests: bool,
    pub parallel_limit: usize,
    pub batch_pause: Duration,
    pub database_binding: String,
    pub cli: String,
    pub account_id: Option<String>,
    /// Warnings surfaced by configuration validation, re-emitted during the
    /// initialization phase.
    pub config_warnings: Vec<String>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            working_dir: PathBuf::from("."),
            backup_root: PathBuf::from("./backups"),
            dry_run: false,
            skip_tests: false,
            parallel_limit: 3,
            batch_pause: Duration::from_secs(2),
            database_binding: "DB".to_string(),
            cli: "wrangler".to_string(),
            account_id: None,
            config_warnings: Vec::new(),
        }
    }
}

/// Drives domains through the phase pipeline.
pub struct DeployCoordinator {
    state: StateManager,
    platform: Arc<dyn Platform>,
    resolver: Arc<DomainResolver>,
    secrets: Arc<SecretManager>,
    wrangler: Arc<WranglerManager>,
    validator: Option<Arc<dyn DomainValidator>>,
    pipeline: Vec<PhaseSpec>,
    options: DeployOptions,
    event_tx: Option<mpsc::Sender<DeployEvent>>,
}

impl DeployCoordinator {
    pub fn new(
        state: StateManager,
        platform: Arc<dyn Platform>,
        resolver: Arc<DomainResolver>,
        secrets: Arc<SecretManager>,
        options: DeployOptions,
    ) -> Self {
        let wrangler = Arc::new(WranglerManager::new(&options.working_dir));
        Self {
            state,
            platform,
            resolver,
            secrets,
            wrangler,
            validator: None,
            pipeline: default_pipeline(),
            options,
            event_tx: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Vec<PhaseSpec>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn DomainValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<DeployEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub fn resolver(&self) -> Arc<DomainResolver> {
        self.resolver.clone()
    }

    pub fn secrets(&self) -> Arc<SecretManager> {
        self.secrets.clone()
    }

    async fn emit(&self, event: DeployEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Run the full pipeline for one domain.
    pub async fn deploy_domain(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<DomainState, PhaseFailure> {
        let Some(initial) = self.state.get_domain(domain).await else {
            return Err(PhaseFailure {
                domain: domain.to_string(),
                phase: phases::PHASE_VALIDATION.to_string(),
                source: OrchestratorError::Validation(format!(
                    "domain '{domain}' was never initialized in run state"
                )),
            });
        };

        self.state
            .append_audit(
                AuditEvent::DeploymentStart,
                Some(domain),
                json!({ "deployment_id": initial.deployment_id, "dry_run": self.options.dry_run }),
            )
            .await;
        let _ = self.state.mark_started(domain).await;
        self.emit(DeployEvent::DomainStarted {
            domain: domain.to_string(),
        })
        .await;

        for spec in &self.pipeline {
            if cancel.is_cancelled() {
                return Err(self.fail_domain(domain, &spec.name, OrchestratorError::Cancelled).await);
            }
            if spec.name == phases::PHASE_POST_VALIDATION && self.options.skip_tests {
                // Skipped entirely: not run, not recorded.
                continue;
            }

            let result = if self.options.dry_run {
                tokio::time::sleep(DRY_RUN_PHASE_DELAY).await;
                Ok(PhaseOutput::default())
            } else {
                self.run_phase(&spec.name, domain, &initial.config, cancel).await
            };

            match result {
                Ok(output) => {
                    for warning in &output.warnings {
                        warn!(domain, phase = %spec.name, warning = %warning, "phase warning");
                    }
                    let mut patch = DomainPatch {
                        phase: Some(format!("{}-complete", spec.name)),
                        phase_result: Some((
                            spec.name.clone(),
                            PhaseRecord::success_with(output.warnings.clone()),
                        )),
                        ..Default::default()
                    };
                    if let Some(url) = output.url {
                        patch.worker_url = Some(url);
                    }
                    let _ = self.state.update_domain(domain, patch).await;
                    self.emit(DeployEvent::PhaseCompleted {
                        domain: domain.to_string(),
                        phase: spec.name.clone(),
                        success: true,
                    })
                    .await;
                }
                Err(err) if err.is_cancelled() => {
                    return Err(self.fail_domain(domain, &spec.name, err).await);
                }
                Err(err) if spec.critical => {
                    let _ = self
                        .state
                        .update_domain(
                            domain,
                            DomainPatch {
                                phase_result: Some((
                                    spec.name.clone(),
                                    PhaseRecord::failure(err.to_string()),
                                )),
                                ..Default::default()
                            },
                        )
                        .await;
                    return Err(self.fail_domain(domain, &spec.name, err).await);
                }
                Err(err) => {
                    warn!(
                        domain,
                        phase = %spec.name,
                        error = %err,
                        "non-critical phase failed; continuing"
                    );
                    let _ = self
                        .state
                        .update_domain(
                            domain,
                            DomainPatch {
                                phase_result: Some((
                                    spec.name.clone(),
                                    PhaseRecord::failure(err.to_string()),
                                )),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.emit(DeployEvent::PhaseCompleted {
                        domain: domain.to_string(),
                        phase: spec.name.clone(),
                        success: false,
                    })
                    .await;
                }
            }
        }

        let current = self
            .state
            .get_domain(domain)
            .await
            .expect("domain state exists for deployed domain");
        let finished = if current.all_phases_succeeded() {
            self.state.mark_completed(domain).await
        } else {
            self.state.mark_completed_with_warnings(domain).await
        }
        .map_err(|source| PhaseFailure {
            domain: domain.to_string(),
            phase: "finalize".to_string(),
            source,
        })?;

        self.state
            .append_audit(
                AuditEvent::DeploymentSuccess,
                Some(domain),
                json!({
                    "deployment_id": finished.deployment_id,
                    "status": finished.status,
                    "worker_url": finished.worker_url,
                    "custom_url": finished.custom_url,
                }),
            )
            .await;
        self.emit(DeployEvent::DomainFinished {
            domain: domain.to_string(),
            success: true,
        })
        .await;
        info!(domain, status = ?finished.status, "domain deployment finished");
        Ok(finished)
    }

    async fn fail_domain(
        &self,
        domain: &str,
        phase: &str,
        source: OrchestratorError,
    ) -> PhaseFailure {
        let message = source.to_string();
        let _ = self.state.mark_failed(domain, message.clone()).await;
        self.state
            .append_audit(
                AuditEvent::DeploymentFailed,
                Some(domain),
                json!({ "phase": phase, "error": message }),
            )
            .await;
        self.emit(DeployEvent::DomainFinished {
            domain: domain.to_string(),
            success: false,
        })
        .await;
        PhaseFailure {
            domain: domain.to_string(),
            phase: phase.to_string(),
            source,
        }
    }

    async fn run_phase(
        &self,
        phase: &str,
        domain: &str,
        config: &DomainConfig,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutput, OrchestratorError> {
        match phase {
            phases::PHASE_VALIDATION => self.phase_validation(domain, config).await,
            phases::PHASE_INITIALIZATION => self.phase_initialization(domain).await,
            phases::PHASE_DATABASE => self.phase_database(domain, config).await,
            phases::PHASE_SECRETS => self.phase_secrets(domain, config).await,
            phases::PHASE_DEPLOYMENT => self.phase_deployment(domain, config).await,
            phases::PHASE_POST_VALIDATION => self.phase_post_validation(domain, cancel).await,
            other => Err(OrchestratorError::Config(format!(
                "no handler for phase '{other}'"
            ))),
        }
    }

    async fn phase_validation(
        &self,
        domain: &str,
        config: &DomainConfig,
    ) -> Result<PhaseOutput, OrchestratorError> {
        let report = self.resolver.validate_prerequisites(domain);
        if !report.valid {
            return Err(OrchestratorError::Validation(report.issues.join("; ")));
        }
        let mut output = PhaseOutput::default();
        output.warnings.extend(report.warnings);

        if let Some(validator) = &self.validator {
            let verdict = validator.validate(domain, config).await;
            if !verdict.valid {
                return Err(OrchestratorError::Validation(verdict.errors.join("; ")));
            }
        }
        Ok(output)
    }

    async fn phase_initialization(&self, domain: &str) -> Result<PhaseOutput, OrchestratorError> {
        let mut output = PhaseOutput::default();

        if !self.options.config_warnings.is_empty() {
            self.state
                .append_audit(
                    AuditEvent::ValidationWarnings,
                    Some(domain),
                    json!({ "warnings": self.options.config_warnings }),
                )
                .await;
            output.warnings.extend(self.options.config_warnings.clone());
        }

        // Back up the active platform config before later phases mutate it.
        let active = self.wrangler.active_path().to_path_buf();
        if active.exists() {
            let run_id = self.state.orchestration_id().await;
            let backup = self
                .options
                .backup_root
                .join("configs")
                .join(&run_id)
                .join(encode_path(&active));
            let contents = std::fs::read(&active)
                .map_err(|e| OrchestratorError::Config(format!("read {}: {e}", active.display())))?;
            atomic_write(&backup, &contents)?;
            self.state
                .add_rollback_action(
                    domain,
                    RollbackAction::new(
                        RollbackTarget::RestoreFile {
                            original_path: active.clone(),
                            backup_path: backup,
                        },
                        PRIORITY_RESTORE_FILE,
                        format!("restore {}", active.display()),
                    ),
                )
                .await?;
        }
        Ok(output)
    }

    async fn phase_database(
        &self,
        domain: &str,
        config: &DomainConfig,
    ) -> Result<PhaseOutput, OrchestratorError> {
        let environment = self.options.environment;
        let database_name = config.database_name.clone().unwrap_or_else(|| {
            format!("{}-{}-db", config.clean_name, environment)
        });
        let mut output = PhaseOutput::default();

        let _ = self
            .state
            .update_domain(
                domain,
                DomainPatch {
                    database_name: Some(database_name.clone()),
                    ..Default::default()
                },
            )
            .await;

        let database_id = if self.platform.database_exists(&database_name).await? {
            let id = self.platform.get_database_id(&database_name).await?;
            self.state
                .append_audit(
                    AuditEvent::DatabaseFound,
                    Some(domain),
                    json!({ "database": database_name, "database_id": id }),
                )
                .await;
            id
        } else {
            let id = self.platform.create_database(&database_name).await?;
            self.state
                .append_audit(
                    AuditEvent::DatabaseCreated,
                    Some(domain),
                    json!({ "database": database_name, "database_id": id }),
                )
                .await;
            self.state
                .add_rollback_action(
                    domain,
                    RollbackAction::new(
                        RollbackTarget::DeleteDatabase {
                            name: database_name.clone(),
                        },
                        PRIORITY_DELETE_DATABASE,
                        format!("delete database {database_name}"),
                    ),
                )
                .await?;
            id
        };

        let _ = self
            .state
            .update_domain(
                domain,
                DomainPatch {
                    database_id: Some(database_id.clone()),
                    ..Default::default()
                },
            )
            .await;

        self.wrangler.ensure_environment(environment)?;
        self.wrangler.add_database_binding(
            environment,
            &DatabaseBinding {
                binding: self.options.database_binding.clone(),
                database_name: database_name.clone(),
                database_id,
            },
        )?;

        if let Err(err) = self
            .platform
            .apply_migrations(
                &database_name,
                &self.options.database_binding,
                environment,
                true,
            )
            .await
        {
            output = output.with_warning(format!(
                "migrations for {database_name} failed: {err}; deployment continues"
            ));
        }
        Ok(output)
    }

    async fn phase_secrets(
        &self,
        domain: &str,
        config: &DomainConfig,
    ) -> Result<PhaseOutput, OrchestratorError> {
        let environment = self.options.environment;
        let set = self.secrets.generate_for(domain, environment).await;

        for secret in &set.secrets {
            self.platform
                .put_secret(&config.worker_name, &secret.key, &secret.value, environment)
                .await?;
            self.state
                .add_rollback_action(
                    domain,
                    RollbackAction::new(
                        RollbackTarget::DeleteSecret {
                            key: secret.key.clone(),
                            environment,
                        },
                        PRIORITY_DELETE_SECRET,
                        format!("delete secret {}", secret.key),
                    ),
                )
                .await?;
        }

        let run_id = self.state.orchestration_id().await;
        let artifacts_dir = self.options.backup_root.join("secrets").join(&run_id);
        std::fs::create_dir_all(&artifacts_dir)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        self.secrets.write_env_artifact(&artifacts_dir, &set)?;
        self.secrets
            .write_upload_script(&artifacts_dir, &self.options.cli, &set)?;

        self.state
            .append_audit(
                AuditEvent::SecretsGenerated,
                Some(domain),
                json!({
                    "count": set.secrets.len(),
                    "keys": set.key_names(),
                    "reused": set.reused,
                }),
            )
            .await;
        Ok(PhaseOutput::default())
    }

    async fn phase_deployment(
        &self,
        domain: &str,
        config: &DomainConfig,
    ) -> Result<PhaseOutput, OrchestratorError> {
        let environment = self.options.environment;
        let zone = self.resolver.root_domain(domain);

        let customer_config = self.wrangler.generate_customer_config(
            &zone,
            &CustomerConfigOptions {
                account_id: self.options.account_id.clone(),
                environment,
                worker_name: config.worker_name.clone(),
            },
        )?;
        self.wrangler.copy_customer_config(&customer_config)?;

        let out = self
            .platform
            .deploy_worker(environment, &self.options.working_dir)
            .await?;

        self.state
            .add_rollback_action(
                domain,
                RollbackAction::new(
                    RollbackTarget::DeleteWorker {
                        name: config.worker_name.clone(),
                        environment,
                    },
                    PRIORITY_DELETE_WORKER,
                    format!("delete worker {}", config.worker_name),
                ),
            )
            .await?;

        let worker_url = extract_https_url(&out.stdout);
        let custom_url = config.environments.get(environment).to_string();
        let _ = self
            .state
            .update_domain(
                domain,
                DomainPatch {
                    custom_url: Some(custom_url),
                    ..Default::default()
                },
            )
            .await;

        let mut output = PhaseOutput {
            deployed: true,
            url: worker_url.clone(),
            ..Default::default()
        };
        if worker_url.is_none() {
            output = output.with_warning(
                "could not parse a worker URL from deploy output; custom domain only",
            );
        }
        Ok(output)
    }

    async fn phase_post_validation(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutput, OrchestratorError> {
        let state = self
            .state
            .get_domain(domain)
            .await
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown domain '{domain}'")))?;

        // Prefer the worker URL: the custom domain may not be DNS-routable
        // yet.
        let base = state
            .worker_url
            .or(state.custom_url)
            .ok_or_else(|| OrchestratorError::Validation("no URL available for health check".into()))?;
        let url = format!("{}/health", base.trim_end_matches('/'));

        let mut output = PhaseOutput::default();
        for attempt in 1..=HEALTH_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            match self.platform.health_check(&url, HEALTH_TIMEOUT).await {
                Ok(probe) if probe.status_code == 200 => {
                    self.state
                        .append_audit(
                            AuditEvent::HealthCheckPassed,
                            Some(domain),
                            json!({
                                "url": url,
                                "attempt": attempt,
                                "response_time_ms": probe.response_time_ms,
                            }),
                        )
                        .await;
                    return Ok(output);
                }
                Ok(probe) => {
                    self.state
                        .append_audit(
                            AuditEvent::HealthCheckWarning,
                            Some(domain),
                            json!({ "url": url, "attempt": attempt, "status": probe.status_code }),
                        )
                        .await;
                    return Ok(output.with_warning(format!(
                        "health check returned HTTP {}",
                        probe.status_code
                    )));
                }
                Err(err) if attempt < HEALTH_ATTEMPTS => {
                    warn!(domain, attempt, error = %err, "health check failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                        _ = tokio::time::sleep(HEALTH_RETRY_DELAY) => {}
                    }
                }
                Err(err) => {
                    self.state
                        .append_audit(
                            AuditEvent::HealthCheckFailed,
                            Some(domain),
                            json!({ "url": url, "attempts": HEALTH_ATTEMPTS, "error": err.to_string() }),
                        )
                        .await;
                    output = output.with_warning(format!(
                        "health check failed after {HEALTH_ATTEMPTS} attempts: {err}"
                    ));
                    return Ok(output);
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlatformError;
    use crate::platform::testing::RecordingPlatform;
    use crate::platform::{CommandOutput, HealthProbe};
    use crate::resolver::DomainResolver;
    use crate::state::{AuditEvent, DomainStatus, RunOptions};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Harness {
        coordinator: DeployCoordinator,
        platform: Arc<RecordingPlatform>,
        _working: TempDir,
        _backups: TempDir,
    }

    async fn harness_with(platform: RecordingPlatform, dry_run: bool) -> Harness {
        let working = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let platform = Arc::new(platform);

        let state = StateManager::init_run(RunOptions {
            environment: Environment::Production,
            dry_run,
            ..Default::default()
        })
        .await;
        let resolver = Arc::new(DomainResolver::new(HashMap::new(), Vec::new()));
        let configs = resolver
            .resolve_many(&["api.example.com".to_string()])
            .unwrap();
        state.init_domain_states(&configs).await;

        let options = DeployOptions {
            environment: Environment::Production,
            working_dir: working.path().to_path_buf(),
            backup_root: backups.path().to_path_buf(),
            dry_run,
            ..Default::default()
        };
        let coordinator = DeployCoordinator::new(
            state,
            platform.clone(),
            resolver,
            Arc::new(SecretManager::new(Vec::new())),
            options,
        );
        Harness {
            coordinator,
            platform,
            _working: working,
            _backups: backups,
        }
    }

    async fn harness() -> Harness {
        harness_with(RecordingPlatform::new(), false).await
    }

    fn audit_events(log: &[crate::state::AuditEntry]) -> Vec<AuditEvent> {
        log.iter().map(|e| e.event).collect()
    }

    #[tokio::test]
    async fn happy_path_walks_all_six_phases() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        let state = h
            .coordinator
            .deploy_domain("api.example.com", &cancel)
            .await
            .unwrap();

        assert_eq!(state.status, DomainStatus::Completed);
        assert_eq!(state.phase, "post-validation-complete");
        assert_eq!(state.phase_results.len(), 6);
        assert!(state.all_phases_succeeded());
        assert_eq!(
            state.worker_url.as_deref(),
            Some("https://worker.example.workers.dev")
        );
        assert_eq!(state.custom_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(
            state.database_name.as_deref(),
            Some("api-example-com-production-db")
        );

        let events = audit_events(&h.coordinator.state().audit_log().await);
        assert!(events.contains(&AuditEvent::DeploymentStart));
        assert!(events.contains(&AuditEvent::DatabaseCreated));
        assert!(events.contains(&AuditEvent::SecretsGenerated));
        assert!(events.contains(&AuditEvent::HealthCheckPassed));
        assert!(events.contains(&AuditEvent::DeploymentSuccess));
    }

    #[tokio::test]
    async fn critical_deploy_failure_stops_the_machine() {
        let h = harness().await;
        h.platform.push_deploy_result(Err(PlatformError::Auth(
            "token rejected".into(),
        )));

        let cancel = CancellationToken::new();
        let failure = h
            .coordinator
            .deploy_domain("api.example.com", &cancel)
            .await
            .unwrap_err();
        assert_eq!(failure.phase, "deployment");

        let state = h
            .coordinator
            .state()
            .get_domain("api.example.com")
            .await
            .unwrap();
        assert_eq!(state.status, DomainStatus::Failed);
        assert!(state.end_time.is_some());
        // post-validation never ran.
        assert!(!state.phase_results.contains_key("post-validation"));
        assert_eq!(h.platform.count_of("health_check"), 0);

        let events = audit_events(&h.coordinator.state().audit_log().await);
        assert!(events.contains(&AuditEvent::DeploymentFailed));
        assert!(!events.contains(&AuditEvent::DeploymentSuccess));
    }

    #[tokio::test]
    async fn worker_url_survives_database_phase_failure() {
        // Sink the database phase with a platform whose database calls fail.
        struct FlakyDatabases(RecordingPlatform);
        #[async_trait]
        impl Platform for FlakyDatabases {
            async fn database_exists(&self, _name: &str) -> Result<bool, PlatformError> {
                Err(PlatformError::Transport("d1 listing unavailable".into()))
            }
            async fn create_database(&self, name: &str) -> Result<String, PlatformError> {
                self.0.create_database(name).await
            }
            async fn get_database_id(&self, name: &str) -> Result<String, PlatformError> {
                self.0.get_database_id(name).await
            }
            async fn apply_migrations(
                &self,
                database: &str,
                binding: &str,
                environment: Environment,
                remote: bool,
            ) -> Result<(), PlatformError> {
                self.0
                    .apply_migrations(database, binding, environment, remote)
                    .await
            }
            async fn put_secret(
                &self,
                scope: &str,
                key: &str,
                value: &crate::secrets::SecretString,
                environment: Environment,
            ) -> Result<(), PlatformError> {
                self.0.put_secret(scope, key, value, environment).await
            }
            async fn delete_secret(
                &self,
                key: &str,
                environment: Environment,
            ) -> Result<(), PlatformError> {
                self.0.delete_secret(key, environment).await
            }
            async fn deploy_worker(
                &self,
                environment: Environment,
                working_dir: &std::path::Path,
            ) -> Result<CommandOutput, PlatformError> {
                self.0.deploy_worker(environment, working_dir).await
            }
            async fn delete_worker(
                &self,
                name: &str,
                environment: Environment,
            ) -> Result<(), PlatformError> {
                self.0.delete_worker(name, environment).await
            }
            async fn delete_database(&self, name: &str) -> Result<(), PlatformError> {
                self.0.delete_database(name).await
            }
            async fn list_workers(&self) -> Result<String, PlatformError> {
                self.0.list_workers().await
            }
            async fn list_secrets(&self) -> Result<String, PlatformError> {
                self.0.list_secrets().await
            }
            async fn list_databases(&self) -> Result<String, PlatformError> {
                self.0.list_databases().await
            }
            async fn health_check(
                &self,
                url: &str,
                timeout: Duration,
            ) -> Result<HealthProbe, PlatformError> {
                self.0.health_check(url, timeout).await
            }
        }

        let working = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let state = StateManager::init_run(RunOptions {
            environment: Environment::Production,
            ..Default::default()
        })
        .await;
        let resolver = Arc::new(DomainResolver::new(HashMap::new(), Vec::new()));
        let configs = resolver
            .resolve_many(&["api.example.com".to_string()])
            .unwrap();
        state.init_domain_states(&configs).await;
        let coordinator = DeployCoordinator::new(
            state,
            Arc::new(FlakyDatabases(RecordingPlatform::new())),
            resolver,
            Arc::new(SecretManager::new(Vec::new())),
            DeployOptions {
                environment: Environment::Production,
                working_dir: working.path().to_path_buf(),
                backup_root: backups.path().to_path_buf(),
                ..Default::default()
            },
        );

        let final_state = coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(final_state.status, DomainStatus::CompletedWithWarnings);
        assert!(!final_state.phase_results["database"].success);
        // Deployment still ran and the worker URL was captured.
        assert_eq!(
            final_state.worker_url.as_deref(),
            Some("https://worker.example.workers.dev")
        );
    }

    #[tokio::test]
    async fn second_run_finds_database_instead_of_creating() {
        let h = harness_with(
            RecordingPlatform::new().with_existing_database("api-example-com-production-db"),
            false,
        )
        .await;
        h.coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.platform.count_of("create_database"), 0);
        let events = audit_events(&h.coordinator.state().audit_log().await);
        assert!(events.contains(&AuditEvent::DatabaseFound));
        assert!(!events.contains(&AuditEvent::DatabaseCreated));

        // No delete-database rollback action for a database this run did
        // not create.
        let state = h
            .coordinator
            .state()
            .get_domain("api.example.com")
            .await
            .unwrap();
        assert!(
            !state
                .rollback_actions
                .iter()
                .any(|a| a.target.kind() == "delete-database")
        );
    }

    #[tokio::test]
    async fn rollback_actions_carry_spec_priorities() {
        let h = harness().await;
        h.coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        let state = h
            .coordinator
            .state()
            .get_domain("api.example.com")
            .await
            .unwrap();

        let priority_of = |kind: &str| {
            state
                .rollback_actions
                .iter()
                .find(|a| a.target.kind() == kind)
                .map(|a| a.priority)
        };
        assert_eq!(priority_of("delete-database"), Some(PRIORITY_DELETE_DATABASE));
        assert_eq!(priority_of("delete-secret"), Some(PRIORITY_DELETE_SECRET));
        assert_eq!(priority_of("delete-worker"), Some(PRIORITY_DELETE_WORKER));
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_flaps_then_recovers() {
        let h = harness().await;
        h.platform
            .push_health_result(Err(PlatformError::Transport("refused".into())));
        h.platform
            .push_health_result(Err(PlatformError::Transport("refused".into())));
        // Third attempt hits the default 200.

        let state = h
            .coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, DomainStatus::Completed);
        assert!(state.phase_results["post-validation"].success);

        let log = h.coordinator.state().audit_log().await;
        let passed: Vec<_> = log
            .iter()
            .filter(|e| e.event == AuditEvent::HealthCheckPassed)
            .collect();
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].details["attempt"], 3);
        assert_eq!(h.platform.count_of("health_check"), 3);
    }

    #[tokio::test]
    async fn non_200_health_is_a_warning_not_a_failure() {
        let h = harness().await;
        h.platform.push_health_result(Ok(HealthProbe {
            status_code: 503,
            response_time_ms: 2,
        }));
        let state = h
            .coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, DomainStatus::Completed);
        let warnings = &state.phase_results["post-validation"].warnings;
        assert!(warnings.iter().any(|w| w.contains("503")));
        let events = audit_events(&h.coordinator.state().audit_log().await);
        assert!(events.contains(&AuditEvent::HealthCheckWarning));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_health_attempts_still_complete_the_domain() {
        let h = harness().await;
        for _ in 0..3 {
            h.platform
                .push_health_result(Err(PlatformError::Transport("refused".into())));
        }
        let state = h
            .coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        // Health failure is surfaced as a warning, not a phase failure.
        assert_eq!(state.status, DomainStatus::Completed);
        assert!(
            state.phase_results["post-validation"]
                .warnings
                .iter()
                .any(|w| w.contains("3 attempts"))
        );
        let events = audit_events(&h.coordinator.state().audit_log().await);
        assert!(events.contains(&AuditEvent::HealthCheckFailed));
    }

    #[tokio::test]
    async fn skip_tests_never_runs_post_validation() {
        let working = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        let state = StateManager::init_run(RunOptions {
            environment: Environment::Production,
            skip_tests: true,
            ..Default::default()
        })
        .await;
        let resolver = Arc::new(DomainResolver::new(HashMap::new(), Vec::new()));
        let configs = resolver
            .resolve_many(&["api.example.com".to_string()])
            .unwrap();
        state.init_domain_states(&configs).await;
        let coordinator = DeployCoordinator::new(
            state,
            platform.clone(),
            resolver,
            Arc::new(SecretManager::new(Vec::new())),
            DeployOptions {
                environment: Environment::Production,
                working_dir: working.path().to_path_buf(),
                backup_root: backups.path().to_path_buf(),
                skip_tests: true,
                ..Default::default()
            },
        );

        let final_state = coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(final_state.status, DomainStatus::Completed);
        assert!(!final_state.phase_results.contains_key("post-validation"));
        assert_eq!(platform.count_of("health_check"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_touches_nothing() {
        let h = harness_with(RecordingPlatform::read_only(), true).await;
        let state = h
            .coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, DomainStatus::Completed);
        assert!(state.rollback_actions.is_empty());
        // The read-only fake would have panicked on any mutating call; it
        // saw no calls at all.
        assert!(h.platform.calls().is_empty());
        // No wrangler config was written either.
        assert!(!h._working.path().join("wrangler.toml").exists());
    }

    #[tokio::test]
    async fn cancellation_before_start_fails_with_cancelled() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = h
            .coordinator
            .deploy_domain("api.example.com", &cancel)
            .await
            .unwrap_err();
        assert!(failure.source.is_cancelled());

        let state = h
            .coordinator
            .state()
            .get_domain("api.example.com")
            .await
            .unwrap();
        assert_eq!(state.status, DomainStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("cancelled"));
        assert!(state.rollback_actions.is_empty());
    }

    #[tokio::test]
    async fn missing_worker_url_is_a_warning() {
        let h = harness().await;
        h.platform.push_deploy_result(Ok(CommandOutput {
            stdout: "Uploaded. Done.".to_string(),
            stderr: String::new(),
            exit_code: 0,
        }));
        let state = h
            .coordinator
            .deploy_domain("api.example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert!(state.worker_url.is_none());
        assert_eq!(state.custom_url.as_deref(), Some("https://api.example.com"));
        assert!(
            state.phase_results["deployment"]
                .warnings
                .iter()
                .any(|w| w.contains("worker URL"))
        );
        // Post-validation fell back to the custom domain.
        assert!(
            h.platform
                .calls()
                .iter()
                .any(|c| c == "health_check https://api.example.com/health")
        );
    }
}
