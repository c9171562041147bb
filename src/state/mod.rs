//! Run and per-domain state: the data model owned by the `StateManager`.
//!
//! Everything here serializes into the persisted run summary at
//! `deployments/<orchestration_id>.json`.

use crate::environment::Environment;
use crate::resolver::DomainConfig;
use crate::rollback::RollbackAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod manager;

pub use manager::{ALL_DOMAINS, RunOptions, StateManager};

/// Per-domain deployment status. Transitions are monotone: once terminal,
/// a state never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[default]
    Pending,
    Deploying,
    Completed,
    CompletedWithWarnings,
    Failed,
}

impl DomainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithWarnings | Self::Failed
        )
    }

    /// Whether the domain deployed (possibly with warnings).
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithWarnings)
    }

    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Deploying => 1,
            Self::Completed | Self::CompletedWithWarnings | Self::Failed => 2,
        }
    }
}

/// Result of one executed phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PhaseRecord {
    pub fn success_with(warnings: Vec<String>) -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// One domain's state within an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainState {
    pub domain: String,
    pub deployment_id: String,
    /// Last completed phase marker (`"<phase>-complete"`), or `"pending"`.
    pub phase: String,
    pub status: DomainStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config: DomainConfig,
    #[serde(default)]
    pub rollback_actions: Vec<RollbackAction>,
    #[serde(default)]
    pub phase_results: BTreeMap<String, PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl DomainState {
    pub fn new(domain: &str, deployment_id: String, config: DomainConfig) -> Self {
        Self {
            domain: domain.to_string(),
            deployment_id,
            phase: "pending".to_string(),
            status: DomainStatus::Pending,
            start_time: None,
            end_time: None,
            error: None,
            config,
            rollback_actions: Vec::new(),
            phase_results: BTreeMap::new(),
            worker_url: None,
            custom_url: None,
            database_name: None,
            database_id: None,
            last_updated: Utc::now(),
        }
    }

    /// Whether every recorded phase succeeded.
    pub fn all_phases_succeeded(&self) -> bool {
        self.phase_results.values().all(|r| r.success)
    }
}

/// A partial update applied through `StateManager::update_domain`.
#[derive(Debug, Clone, Default)]
pub struct DomainPatch {
    pub phase: Option<String>,
    pub status: Option<DomainStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub worker_url: Option<String>,
    pub custom_url: Option<String>,
    pub database_name: Option<String>,
    pub database_id: Option<String>,
    pub phase_result: Option<(String, PhaseRecord)>,
}

/// Append-only audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    OrchestratorInitialized,
    PortfolioInitialized,
    DeploymentStart,
    DeploymentSuccess,
    DeploymentFailed,
    ValidationWarnings,
    DatabaseCreated,
    DatabaseFound,
    SecretsGenerated,
    HealthCheckPassed,
    HealthCheckWarning,
    HealthCheckFailed,
    PortfolioComplete,
    PortfolioFailed,
    CrossDomainRollbackStart,
    CrossDomainRollbackCompleted,
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serde already owns the canonical SCREAMING_SNAKE_CASE names.
        let name = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(name.trim_matches('"'))
    }
}

/// One entry in the run's ordered event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub orchestration_id: String,
    /// Contiguous within a run, starting at 1.
    pub sequence_number: u64,
    pub event: AuditEvent,
    /// Affected domain, or `"ALL"` for portfolio-level events.
    pub domain: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Run-level flags persisted in snapshot metadata.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunFlags {
    pub dry_run: bool,
    pub persistence_enabled: bool,
    pub rollback_enabled: bool,
}

/// Immutable run attributes fixed at orchestrator construction.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub orchestration_id: String,
    pub environment: Environment,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub parallel_limit: usize,
    pub batch_pause: Duration,
    pub skip_tests: bool,
    pub flags: RunFlags,
}

/// A rollback action paired with the domain that recorded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRollback {
    pub domain: String,
    pub action: RollbackAction,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Serializable view of a full run; the persisted file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub orchestration_id: String,
    pub environment: Environment,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub domain_states: BTreeMap<String, DomainState>,
    pub rollback_plan: Vec<PlannedRollback>,
    pub audit_log: Vec<AuditEntry>,
    pub metadata: RunFlags,
}

impl RunSnapshot {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run snapshot {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run snapshot {}", path.display()))
    }
}
