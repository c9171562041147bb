//! Rollback plan execution.
//!
//! Walks an ordered plan, dispatching each action to the platform adapter
//! with per-action retry. Critical failures stop the sweep and mark the
//! plan partial; non-critical (or `continue_on_failure`) actions only log.
//! Every execution writes a JSON report into the run's backup directory.

use super::{RollbackAction, RollbackTarget, order_plan};
use crate::platform::Platform;
use crate::platform::retry::{RetryPolicy, with_retry};
use crate::util::atomic_write;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Why a rollback is running, threaded into the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_id: Option<String>,
    pub reason: String,
}

/// Outcome of one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_id: String,
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub rollback_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub context: RollbackContext,
    pub executed_at: DateTime<Utc>,
    pub dry_run: bool,
    /// True when a critical failure stopped the sweep early.
    pub partial: bool,
    pub successful: Vec<ActionOutcome>,
    pub failed: Vec<ActionOutcome>,
    pub skipped: Vec<ActionOutcome>,
    pub summary: String,
}

/// Records and executes reversible actions for one orchestration run.
pub struct RollbackManager {
    platform: Arc<dyn Platform>,
    backup_root: PathBuf,
    run_id: String,
    dry_run: bool,
    retry: RetryPolicy,
}

impl RollbackManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        backup_root: impl Into<PathBuf>,
        run_id: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            platform,
            backup_root: backup_root.into(),
            run_id: run_id.into(),
            dry_run,
            retry: RetryPolicy::new(3, Duration::from_secs(2)),
        }
    }

    fn report_dir(&self) -> PathBuf {
        self.backup_root.join("deployments").join(&self.run_id)
    }

    /// Execute a plan for one domain (or the whole run when `domain` is
    /// `None`). Actions are ordered here; callers pass them as recorded.
    pub async fn execute(
        &self,
        actions: &[RollbackAction],
        domain: Option<&str>,
        context: RollbackContext,
    ) -> RollbackReport {
        let ordered = order_plan(actions);
        let mut report = RollbackReport {
            rollback_id: format!("rollback-{}", Uuid::new_v4().simple()),
            domain: domain.map(String::from),
            context,
            executed_at: Utc::now(),
            dry_run: self.dry_run,
            partial: false,
            successful: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            summary: String::new(),
        };

        let mut stop_index = None;
        for (index, action) in ordered.iter().enumerate() {
            let outcome = ActionOutcome {
                action_id: action.id.clone(),
                kind: action.target.kind().to_string(),
                description: action.description.clone(),
                error: None,
            };

            if self.dry_run {
                info!(
                    kind = action.target.kind(),
                    description = %action.description,
                    "dry-run: would execute rollback action"
                );
                report.successful.push(outcome);
                continue;
            }

            match self.execute_action(action).await {
                Ok(()) => {
                    info!(
                        kind = action.target.kind(),
                        description = %action.description,
                        "rollback action succeeded"
                    );
                    report.successful.push(outcome);
                }
                Err(err) => {
                    warn!(
                        kind = action.target.kind(),
                        description = %action.description,
                        error = %err,
                        "rollback action failed"
                    );
                    report.failed.push(ActionOutcome {
                        error: Some(err.to_string()),
                        ..outcome
                    });
                    if action.critical && !action.continue_on_failure {
                        report.partial = true;
                        stop_index = Some(index + 1);
                        break;
                    }
                }
            }
        }

        if let Some(from) = stop_index {
            for action in &ordered[from..] {
                report.skipped.push(ActionOutcome {
                    action_id: action.id.clone(),
                    kind: action.target.kind().to_string(),
                    description: action.description.clone(),
                    error: None,
                });
            }
        }

        report.summary = format!(
            "{} succeeded, {} failed, {} skipped{}",
            report.successful.len(),
            report.failed.len(),
            report.skipped.len(),
            if report.partial { " (partial)" } else { "" }
        );

        if let Err(err) = self.write_report(&report) {
            warn!(error = %err, "failed to write rollback report");
        }
        report
    }

    async fn execute_action(&self, action: &RollbackAction) -> Result<()> {
        match &action.target {
            RollbackTarget::RestoreFile {
                original_path,
                backup_path,
            } => restore_file(original_path, backup_path),
            RollbackTarget::DeleteSecret { key, environment } => {
                let (key, environment) = (key.clone(), *environment);
                with_retry("rollback delete_secret", self.retry, |_| {
                    let key = key.clone();
                    async move { self.platform.delete_secret(&key, environment).await }
                })
                .await
                .map_err(Into::into)
            }
            RollbackTarget::DeleteDatabase { name } => {
                let name = name.clone();
                with_retry("rollback delete_database", self.retry, |_| {
                    let name = name.clone();
                    async move { self.platform.delete_database(&name).await }
                })
                .await
                .map_err(Into::into)
            }
            RollbackTarget::DeleteWorker { name, environment } => {
                let (name, environment) = (name.clone(), *environment);
                with_retry("rollback delete_worker", self.retry, |_| {
                    let name = name.clone();
                    async move { self.platform.delete_worker(&name, environment).await }
                })
                .await
                .map_err(Into::into)
            }
            RollbackTarget::CustomCommand { command, args } => {
                let output = tokio::process::Command::new(command)
                    .args(args)
                    .output()
                    .await?;
                if output.status.success() {
                    Ok(())
                } else {
                    anyhow::bail!(
                        "custom command '{command}' exited {}: {}",
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr).trim()
                    )
                }
            }
        }
    }

    fn write_report(&self, report: &RollbackReport) -> Result<()> {
        let dir = self.report_dir();
        let json = serde_json::to_string_pretty(report)?;
        atomic_write(&dir.join("rollback-report.json"), json.as_bytes())?;

        // Append to the cumulative log so multi-domain sweeps keep every
        // report.
        let log_path = dir.join("rollback-log.json");
        let mut log: Vec<RollbackReport> = if log_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&log_path)?).unwrap_or_default()
        } else {
            Vec::new()
        };
        log.push(report.clone());
        atomic_write(&log_path, serde_json::to_string_pretty(&log)?.as_bytes())
    }
}

fn restore_file(original: &Path, backup: &Path) -> Result<()> {
    if !backup.exists() {
        // The backup is the source of truth for this action; without it
        // there is nothing safe to restore.
        anyhow::bail!(
            "backup file {} no longer exists; cannot restore {}",
            backup.display(),
            original.display()
        );
    }
    let contents = std::fs::read(backup)?;
    atomic_write(original, &contents)
}
