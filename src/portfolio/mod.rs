//! Cross-domain coordination: portfolio discovery, dependency-aware
//! batching, shared-resource preparation, coordinated deployment, and
//! reverse-order rollback on portfolio failure.

use crate::config::ArmadaToml;
use crate::coordinator::{DeployCoordinator, DomainFailure};
use crate::errors::OrchestratorError;
use crate::report::PortfolioReport;
use crate::rollback::{RollbackContext, RollbackManager};
use crate::state::AuditEvent;
use serde_json::json;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod graph;
pub mod health;
pub mod shared;

pub use graph::{DependencyGraph, shared_database_map};
pub use health::{HealthStatus, HealthSummary, monitor_portfolio_health};
pub use shared::{SharedResources, validate_cors};

/// Portfolio-level toggles.
#[derive(Debug, Clone)]
pub struct PortfolioOptions {
    pub enable_shared_resources: bool,
    pub enable_auto_rollback: bool,
    /// Re-probe every successful domain after deployment; failures demote
    /// the domain from success to failure.
    pub verify_after_deploy: bool,
}

impl Default for PortfolioOptions {
    fn default() -> Self {
        Self {
            enable_shared_resources: true,
            enable_auto_rollback: true,
            verify_after_deploy: true,
        }
    }
}

/// Result of portfolio discovery across sources.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Deduplicated domains, explicit sources first.
    pub domains: Vec<String>,
    /// Per-source errors; discovery itself never fails.
    pub source_errors: Vec<String>,
}

pub struct CrossDomainCoordinator {
    coordinator: DeployCoordinator,
    rollback: RollbackManager,
    shared: SharedResources,
    options: PortfolioOptions,
    coordination_id: String,
}

impl CrossDomainCoordinator {
    pub fn new(
        coordinator: DeployCoordinator,
        rollback: RollbackManager,
        options: PortfolioOptions,
    ) -> Self {
        Self {
            coordinator,
            rollback,
            shared: SharedResources::new(),
            options,
            coordination_id: format!("coordination-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn coordination_id(&self) -> &str {
        &self.coordination_id
    }

    pub fn coordinator(&self) -> &DeployCoordinator {
        &self.coordinator
    }

    /// Discover the portfolio from an explicit list, the configuration
    /// file, and (optionally) the live platform. Duplicates merge; source
    /// errors collect without failing discovery.
    pub async fn discover_portfolio(
        &self,
        explicit: &[String],
        config: &ArmadaToml,
        include_platform: bool,
    ) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut push = |domain: &str, report: &mut DiscoveryReport| {
            let domain = domain.trim();
            if !domain.is_empty() && !report.domains.iter().any(|d| d == domain) {
                report.domains.push(domain.to_string());
            }
        };

        for domain in explicit {
            push(domain, &mut report);
        }

        let mut configured: Vec<&String> = config.domains.keys().collect();
        configured.sort();
        for domain in configured {
            push(domain, &mut report);
        }

        // Sidecar domain-list files next to armada.toml.
        let working_dir = self.coordinator.options().working_dir.clone();
        for entry in walkdir::WalkDir::new(&working_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().is_file() || !name.ends_with(".domains.toml") {
                continue;
            }
            match read_domain_list(entry.path()) {
                Ok(domains) => {
                    for domain in domains {
                        push(&domain, &mut report);
                    }
                }
                Err(err) => report
                    .source_errors
                    .push(format!("{}: {err}", entry.path().display())),
            }
        }

        if include_platform {
            match self.coordinator.platform().list_workers().await {
                Ok(listing) => {
                    for line in listing.lines() {
                        let candidate = line.trim();
                        if crate::resolver::is_valid_domain(candidate)
                            && !is_skipped(candidate, &config.resolver.skip_patterns)
                        {
                            push(candidate, &mut report);
                        }
                    }
                }
                Err(err) => report
                    .source_errors
                    .push(format!("platform discovery failed: {err}")),
            }
        }

        report
    }

    /// Deploy a portfolio through the four coordination stages: validation,
    /// preparation, batched deployment, verification. Rolls back the
    /// success set in reverse completion order when enabled and anything
    /// failed.
    pub async fn coordinate_deployment(
        &self,
        domains: &[String],
        cancel: &CancellationToken,
    ) -> Result<PortfolioReport, OrchestratorError> {
        let started = std::time::Instant::now();
        let state = self.coordinator.state().clone();
        let resolver = self.coordinator.resolver();
        let environment = self.coordinator.options().environment;

        // Stage 1 - validation. The graph is checked before any domain
        // starts; a cycle aborts with no DEPLOYMENT_START ever emitted.
        let configs = resolver.resolve_many(domains)?;
        let graph = DependencyGraph::build(domains, &configs)?;

        state
            .append_audit(
                AuditEvent::PortfolioInitialized,
                None,
                json!({
                    "coordination_id": self.coordination_id,
                    "domains": domains,
                    "batches": graph.batches(self.coordinator.options().parallel_limit).len(),
                }),
            )
            .await;

        for domain in domains {
            let report = resolver.validate_prerequisites(domain);
            if !report.valid {
                return Err(OrchestratorError::Validation(format!(
                    "portfolio validation failed for {domain}: {}",
                    report.issues.join("; ")
                )));
            }
        }

        for (domain, missing) in graph.unknown_dependencies() {
            warn!(
                domain = %domain,
                missing = %missing,
                "declared dependency is outside the portfolio; ignoring for ordering"
            );
        }

        let cors_mismatches = validate_cors(&configs, environment);
        if !cors_mismatches.is_empty() {
            let rendered: Vec<String> =
                cors_mismatches.iter().map(|m| m.to_string()).collect();
            warn!(count = rendered.len(), "cross-domain CORS mismatches");
            state
                .append_audit(
                    AuditEvent::ValidationWarnings,
                    None,
                    json!({ "cors": rendered }),
                )
                .await;
        }

        // Stage 2 - preparation.
        state.init_domain_states(&configs).await;
        if self.options.enable_shared_resources && !self.coordinator.options().dry_run {
            self.prepare_shared_resources(&configs).await?;
        }

        // Stage 3 - batched deployment.
        let batches = graph.batches(self.coordinator.options().parallel_limit);
        let outcome = self.coordinator.run_batches(&batches, cancel).await;
        let mut successful: Vec<String> =
            outcome.successes.iter().map(|s| s.domain.clone()).collect();
        let mut failed = outcome.failures;
        let skipped = outcome.skipped;

        // Stage 4 - verification.
        if self.options.verify_after_deploy
            && !self.coordinator.options().dry_run
            && !successful.is_empty()
            && !cancel.is_cancelled()
        {
            let demoted = self.verify_deployments(&successful, cancel).await;
            if !demoted.is_empty() {
                successful.retain(|domain| !demoted.iter().any(|d| d.domain == *domain));
                failed.extend(demoted);
            }
        }

        // Portfolio rollback.
        let mut rolled_back = Vec::new();
        let any_failure = !failed.is_empty() || !skipped.is_empty();
        if any_failure && self.options.enable_auto_rollback && !successful.is_empty() {
            rolled_back = self.rollback_successes(&successful, &failed).await;
        }

        let (event, details) = if any_failure {
            (
                AuditEvent::PortfolioFailed,
                json!({
                    "coordination_id": self.coordination_id,
                    "failed": failed.iter().map(|f| f.domain.clone()).collect::<Vec<_>>(),
                    "rolled_back_domains": rolled_back.len(),
                }),
            )
        } else {
            (
                AuditEvent::PortfolioComplete,
                json!({
                    "coordination_id": self.coordination_id,
                    "completed": successful.len(),
                }),
            )
        };
        state.append_audit(event, None, details).await;
        state.finish_run().await;

        let (successful, failed, skipped, summary) =
            PortfolioReport::summarize(successful, failed, skipped);
        Ok(PortfolioReport {
            orchestration_id: state.orchestration_id().await,
            coordination_id: Some(self.coordination_id.clone()),
            environment,
            dry_run: self.coordinator.options().dry_run,
            successful,
            failed,
            rolled_back,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            summary,
        })
    }

    async fn prepare_shared_resources(
        &self,
        configs: &BTreeMap<String, crate::resolver::DomainConfig>,
    ) -> Result<(), OrchestratorError> {
        let state = self.coordinator.state();
        let platform = self.coordinator.platform();
        let environment = self.coordinator.options().environment;

        for ((name, env), consumers) in shared_database_map(configs) {
            let outcome = self
                .shared
                .prepare_database(&platform, &name, env)
                .await
                .map_err(OrchestratorError::Platform)?;
            let event = match outcome {
                shared::Prepared::Created { .. } => Some(AuditEvent::DatabaseCreated),
                shared::Prepared::Found { .. } => Some(AuditEvent::DatabaseFound),
                shared::Prepared::AlreadyPrepared => None,
            };
            if let Some(event) = event {
                state
                    .append_audit(
                        event,
                        None,
                        json!({
                            "database": name,
                            "environment": env,
                            "shared_with": consumers,
                        }),
                    )
                    .await;
            }

            // One secret group per shared database, generated at most once.
            if self
                .shared
                .claim_secret_group(&format!("shared-{name}"), environment)
                .await
            {
                let set = self
                    .coordinator
                    .secrets()
                    .generate_for(&format!("shared-{name}"), environment)
                    .await;
                state
                    .append_audit(
                        AuditEvent::SecretsGenerated,
                        None,
                        json!({
                            "scope": set.scope,
                            "count": set.secrets.len(),
                            "keys": set.key_names(),
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Health-probe every successful deployment once; a failing probe
    /// demotes the domain to failure.
    async fn verify_deployments(
        &self,
        successful: &[String],
        cancel: &CancellationToken,
    ) -> Vec<DomainFailure> {
        let state = self.coordinator.state();
        let mut targets = Vec::new();
        for domain in successful {
            if let Some(domain_state) = state.get_domain(domain).await {
                if let Some(url) = domain_state.worker_url.or(domain_state.custom_url) {
                    targets.push((domain.clone(), url));
                }
            }
        }

        let summary =
            monitor_portfolio_health(self.coordinator.platform(), targets, cancel).await;
        let mut demoted = Vec::new();
        for check in &summary.checks {
            if check.status != HealthStatus::Healthy {
                state
                    .append_audit(
                        AuditEvent::HealthCheckFailed,
                        Some(&check.domain),
                        json!({ "stage": "verification", "details": check.details }),
                    )
                    .await;
                demoted.push(DomainFailure {
                    domain: check.domain.clone(),
                    phase: "verification".to_string(),
                    error: check.details.clone(),
                });
            }
        }
        demoted
    }

    /// Walk the remaining successes in reverse completion order, rolling
    /// each back. Individual failures log and the sweep continues.
    async fn rollback_successes(
        &self,
        successful: &[String],
        failed: &[DomainFailure],
    ) -> Vec<String> {
        let state = self.coordinator.state();
        let reason = failed
            .first()
            .map(|f| format!("portfolio failure: {} ({})", f.domain, f.error))
            .unwrap_or_else(|| "portfolio failure".to_string());

        let order: Vec<String> = state
            .completion_order()
            .await
            .into_iter()
            .filter(|domain| successful.iter().any(|s| s == domain))
            .rev()
            .collect();

        state
            .append_audit(
                AuditEvent::CrossDomainRollbackStart,
                None,
                json!({
                    "coordination_id": self.coordination_id,
                    "domains": order,
                    "reason": reason,
                }),
            )
            .await;

        let mut rolled_back = Vec::new();
        for domain in &order {
            let Some(domain_state) = state.get_domain(domain).await else {
                continue;
            };
            let report = self
                .rollback
                .execute(
                    &domain_state.rollback_actions,
                    Some(domain),
                    RollbackContext {
                        deployment_id: Some(domain_state.deployment_id.clone()),
                        coordination_id: Some(self.coordination_id.clone()),
                        reason: reason.clone(),
                    },
                )
                .await;
            if report.failed.is_empty() {
                info!(domain = %domain, "rollback complete");
            } else {
                warn!(
                    domain = %domain,
                    failed = report.failed.len(),
                    "rollback finished with failures; continuing the sweep"
                );
            }
            rolled_back.push(domain.clone());
        }

        state
            .append_audit(
                AuditEvent::CrossDomainRollbackCompleted,
                None,
                json!({
                    "coordination_id": self.coordination_id,
                    "rolled_back_domains": rolled_back.len(),
                }),
            )
            .await;
        rolled_back
    }

    /// Fan-out health sweep across the whole portfolio.
    pub async fn monitor_portfolio_health(
        &self,
        domains: &[String],
        cancel: &CancellationToken,
    ) -> Result<HealthSummary, OrchestratorError> {
        let resolver = self.coordinator.resolver();
        let environment = self.coordinator.options().environment;
        let mut targets = Vec::new();
        for domain in domains {
            let config = resolver.resolve(domain)?;
            targets.push((
                domain.clone(),
                config.environments.get(environment).to_string(),
            ));
        }
        Ok(monitor_portfolio_health(self.coordinator.platform(), targets, cancel).await)
    }
}

#[derive(serde::Deserialize)]
struct DomainListFile {
    #[serde(default)]
    domains: Vec<String>,
}

fn read_domain_list(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let parsed: DomainListFile = toml::from_str(&content)?;
    Ok(parsed.domains)
}

fn is_skipped(domain: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(domain))
            .unwrap_or(false)
    })
}
