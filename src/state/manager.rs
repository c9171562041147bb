//! Single owner of run and per-domain state.
//!
//! All mutation funnels through one mutex so audit sequence numbers stay
//! contiguous under concurrent phase completions and no two writers race a
//! `DomainState`. Disk persistence is best-effort: in-memory state is
//! authoritative during the run, the on-disk snapshot serves post-mortem and
//! rollback.

use super::{
    AuditEntry, AuditEvent, DomainPatch, DomainState, DomainStatus, PlannedRollback, RunFlags,
    RunMetadata, RunSnapshot, RunSummary,
};
use crate::environment::Environment;
use crate::errors::OrchestratorError;
use crate::ids;
use crate::resolver::DomainConfig;
use crate::rollback::RollbackAction;
use crate::util::atomic_write;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Domain label used for portfolio-level audit entries.
pub const ALL_DOMAINS: &str = "ALL";

struct RunState {
    meta: RunMetadata,
    domains: BTreeMap<String, DomainState>,
    audit: Vec<AuditEntry>,
    next_sequence: u64,
    rollback_plan: Vec<PlannedRollback>,
    /// Successful domains in the order they completed.
    completion_order: Vec<String>,
    /// Monotone version for persisted snapshots.
    snapshot_version: u64,
}

impl RunState {
    fn snapshot(&self) -> RunSnapshot {
        let completed = self
            .domains
            .values()
            .filter(|d| d.status.is_success())
            .count();
        let failed = self
            .domains
            .values()
            .filter(|d| d.status == DomainStatus::Failed)
            .count();
        RunSnapshot {
            orchestration_id: self.meta.orchestration_id.clone(),
            environment: self.meta.environment,
            start_time: self.meta.start_time,
            end_time: self.meta.end_time,
            summary: RunSummary {
                total: self.domains.len(),
                completed,
                failed,
            },
            domain_states: self.domains.clone(),
            rollback_plan: self.rollback_plan.clone(),
            audit_log: self.audit.clone(),
            metadata: self.meta.flags,
        }
    }
}

/// Handle to the shared run state. Cheap to clone; all clones observe the
/// same run.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<Mutex<RunState>>,
    persist_root: Option<PathBuf>,
    /// Highest snapshot version written so far. Persistence tasks run
    /// fire-and-forget; the gate drops stale snapshots so a slow early
    /// write never clobbers a newer one.
    persist_gate: Arc<Mutex<u64>>,
}

/// Options for `StateManager::init_run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub environment: Environment,
    pub parallel_limit: usize,
    pub batch_pause: Duration,
    pub dry_run: bool,
    pub skip_tests: bool,
    pub rollback_enabled: bool,
    /// `None` disables persistence entirely.
    pub persist_root: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            parallel_limit: 3,
            batch_pause: Duration::from_secs(2),
            dry_run: false,
            skip_tests: false,
            rollback_enabled: true,
            persist_root: None,
        }
    }
}

impl StateManager {
    /// Create the run and persist an initial empty snapshot.
    pub async fn init_run(options: RunOptions) -> Self {
        let orchestration_id = ids::orchestration_id();
        let meta = RunMetadata {
            orchestration_id,
            environment: options.environment,
            start_time: Utc::now(),
            end_time: None,
            parallel_limit: options.parallel_limit,
            batch_pause: options.batch_pause,
            skip_tests: options.skip_tests,
            flags: RunFlags {
                dry_run: options.dry_run,
                persistence_enabled: options.persist_root.is_some(),
                rollback_enabled: options.rollback_enabled,
            },
        };
        let manager = Self {
            inner: Arc::new(Mutex::new(RunState {
                meta,
                domains: BTreeMap::new(),
                audit: Vec::new(),
                next_sequence: 1,
                rollback_plan: Vec::new(),
                completion_order: Vec::new(),
                snapshot_version: 0,
            })),
            persist_root: options.persist_root,
            persist_gate: Arc::new(Mutex::new(0)),
        };
        manager.persist_now().await;
        manager
    }

    pub async fn orchestration_id(&self) -> String {
        self.inner.lock().await.meta.orchestration_id.clone()
    }

    pub async fn metadata(&self) -> RunMetadata {
        self.inner.lock().await.meta.clone()
    }

    /// Seed domain states with `status=pending`.
    pub async fn init_domain_states(&self, configs: &BTreeMap<String, DomainConfig>) {
        let mut state = self.inner.lock().await;
        for (domain, config) in configs {
            state.domains.entry(domain.clone()).or_insert_with(|| {
                DomainState::new(domain, ids::deployment_id(domain), config.clone())
            });
        }
    }

    pub async fn get_domain(&self, domain: &str) -> Option<DomainState> {
        self.inner.lock().await.domains.get(domain).cloned()
    }

    pub async fn domains(&self) -> BTreeMap<String, DomainState> {
        self.inner.lock().await.domains.clone()
    }

    /// Merge a patch into a domain's state. Reverse status transitions are
    /// rejected: a terminal state never changes, and `deploying` never goes
    /// back to `pending`.
    pub async fn update_domain(
        &self,
        domain: &str,
        patch: DomainPatch,
    ) -> Result<DomainState, OrchestratorError> {
        let mut state = self.inner.lock().await;
        let entry = state.domains.get_mut(domain).ok_or_else(|| {
            OrchestratorError::Validation(format!("unknown domain '{domain}' in state update"))
        })?;

        if let Some(next) = patch.status {
            let current = entry.status;
            let reverse = next.rank() < current.rank()
                || (current.is_terminal() && next != current);
            if reverse {
                return Err(OrchestratorError::Validation(format!(
                    "refusing status transition {current:?} -> {next:?} for '{domain}'"
                )));
            }
            entry.status = next;
        }
        if let Some(phase) = patch.phase {
            entry.phase = phase;
        }
        if let Some(start) = patch.start_time {
            entry.start_time = Some(start);
        }
        if let Some(end) = patch.end_time {
            entry.end_time = Some(end);
        }
        if let Some(error) = patch.error {
            entry.error = Some(error);
        }
        if let Some(url) = patch.worker_url {
            entry.worker_url = Some(url);
        }
        if let Some(url) = patch.custom_url {
            entry.custom_url = Some(url);
        }
        if let Some(name) = patch.database_name {
            entry.database_name = Some(name);
        }
        if let Some(id) = patch.database_id {
            entry.database_id = Some(id);
        }
        if let Some((phase, record)) = patch.phase_result {
            entry.phase_results.insert(phase, record);
        }
        entry.last_updated = Utc::now();
        Ok(entry.clone())
    }

    pub async fn mark_started(&self, domain: &str) -> Result<DomainState, OrchestratorError> {
        self.update_domain(
            domain,
            DomainPatch {
                status: Some(DomainStatus::Deploying),
                start_time: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn mark_completed(&self, domain: &str) -> Result<DomainState, OrchestratorError> {
        self.mark_finished(domain, DomainStatus::Completed, None).await
    }

    pub async fn mark_completed_with_warnings(
        &self,
        domain: &str,
    ) -> Result<DomainState, OrchestratorError> {
        self.mark_finished(domain, DomainStatus::CompletedWithWarnings, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        domain: &str,
        error: impl Into<String>,
    ) -> Result<DomainState, OrchestratorError> {
        self.mark_finished(domain, DomainStatus::Failed, Some(error.into()))
            .await
    }

    async fn mark_finished(
        &self,
        domain: &str,
        status: DomainStatus,
        error: Option<String>,
    ) -> Result<DomainState, OrchestratorError> {
        let updated = self
            .update_domain(
                domain,
                DomainPatch {
                    status: Some(status),
                    end_time: Some(Utc::now()),
                    error,
                    ..Default::default()
                },
            )
            .await?;
        if status.is_success() {
            let mut state = self.inner.lock().await;
            if !state.completion_order.iter().any(|d| d == domain) {
                state.completion_order.push(domain.to_string());
            }
        }
        Ok(updated)
    }

    /// Successful domains in completion order.
    pub async fn completion_order(&self) -> Vec<String> {
        self.inner.lock().await.completion_order.clone()
    }

    /// Append an audit entry. Sequence numbers are assigned under the state
    /// lock and stay contiguous regardless of caller concurrency. The disk
    /// write happens off the caller's path and never fails the deployment.
    pub async fn append_audit(
        &self,
        event: AuditEvent,
        domain: Option<&str>,
        details: serde_json::Value,
    ) -> u64 {
        let (sequence, persist) = {
            let mut state = self.inner.lock().await;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let entry = AuditEntry {
                timestamp: Utc::now(),
                orchestration_id: state.meta.orchestration_id.clone(),
                sequence_number: sequence,
                event,
                domain: domain.unwrap_or(ALL_DOMAINS).to_string(),
                details,
            };
            tracing::debug!(
                event = %entry.event,
                domain = %entry.domain,
                sequence,
                "audit"
            );
            state.audit.push(entry);
            let persist = self.persist_root.as_ref().map(|root| {
                state.snapshot_version += 1;
                (root.clone(), state.snapshot(), state.snapshot_version)
            });
            (sequence, persist)
        };

        if let Some((root, snapshot, version)) = persist {
            let gate = self.persist_gate.clone();
            tokio::spawn(async move {
                persist_with_retry(&root, &snapshot, version, &gate).await;
            });
        }
        sequence
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    /// Record a rollback action on both the domain and the portfolio plan.
    pub async fn add_rollback_action(
        &self,
        domain: &str,
        action: RollbackAction,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.inner.lock().await;
        let entry = state.domains.get_mut(domain).ok_or_else(|| {
            OrchestratorError::Validation(format!("unknown domain '{domain}' for rollback action"))
        })?;
        entry.rollback_actions.push(action.clone());
        state.rollback_plan.push(PlannedRollback {
            domain: domain.to_string(),
            action,
        });
        Ok(())
    }

    pub async fn rollback_plan(&self) -> Vec<PlannedRollback> {
        self.inner.lock().await.rollback_plan.clone()
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.inner.lock().await.snapshot()
    }

    /// Close the run and write a final snapshot.
    pub async fn finish_run(&self) {
        {
            let mut state = self.inner.lock().await;
            state.meta.end_time = Some(Utc::now());
        }
        self.persist_now().await;
    }

    /// Awaited best-effort persistence of the current snapshot.
    pub async fn persist_now(&self) {
        let Some(root) = self.persist_root.clone() else {
            return;
        };
        let (snapshot, version) = {
            let mut state = self.inner.lock().await;
            state.snapshot_version += 1;
            (state.snapshot(), state.snapshot_version)
        };
        persist_with_retry(&root, &snapshot, version, &self.persist_gate).await;
    }
}

async fn persist_with_retry(
    root: &std::path::Path,
    snapshot: &RunSnapshot,
    version: u64,
    gate: &Mutex<u64>,
) {
    // The gate serializes writers and drops snapshots older than one
    // already on disk.
    let mut written = gate.lock().await;
    if version <= *written {
        return;
    }
    for attempt in 1..=2 {
        match write_snapshot(root, snapshot) {
            Ok(()) => {
                *written = version;
                return;
            }
            Err(err) if attempt == 1 => {
                warn!(error = %err, "snapshot persistence failed, retrying once");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(err) => {
                // In-memory state stays authoritative; losing the disk copy
                // only degrades post-mortem tooling.
                warn!(error = %err, "snapshot persistence failed; continuing without it");
            }
        }
    }
}

fn write_snapshot(root: &std::path::Path, snapshot: &RunSnapshot) -> anyhow::Result<()> {
    let path = root.join(format!("{}.json", snapshot.orchestration_id));
    let json = serde_json::to_string_pretty(snapshot)?;
    atomic_write(&path, json.as_bytes())
}
