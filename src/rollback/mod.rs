//! Rollback actions and plan ordering.
//!
//! Phases record a reversible action for everything they create. Plans
//! execute by descending priority; within equal priority, later-recorded
//! actions run first (LIFO), so teardown mirrors creation order.

use crate::environment::Environment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub mod backup;
pub mod executor;

pub use backup::{BackupManager, BackupManifest, BackupOptions};
pub use executor::{RollbackContext, RollbackManager, RollbackReport};

/// Restore backed-up configuration files. Runs last.
pub const PRIORITY_RESTORE_FILE: i32 = 10;
/// Delete created databases. Runs after worker deletion.
pub const PRIORITY_DELETE_DATABASE: i32 = 20;
pub const PRIORITY_DELETE_SECRET: i32 = 30;
/// Delete deployed workers. Runs first.
pub const PRIORITY_DELETE_WORKER: i32 = 40;

/// What a rollback action undoes, dispatched by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RollbackTarget {
    RestoreFile {
        original_path: PathBuf,
        backup_path: PathBuf,
    },
    DeleteSecret {
        key: String,
        environment: Environment,
    },
    DeleteDatabase {
        name: String,
    },
    DeleteWorker {
        name: String,
        environment: Environment,
    },
    CustomCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl RollbackTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RestoreFile { .. } => "restore-file",
            Self::DeleteSecret { .. } => "delete-secret",
            Self::DeleteDatabase { .. } => "delete-database",
            Self::DeleteWorker { .. } => "delete-worker",
            Self::CustomCommand { .. } => "custom-command",
        }
    }
}

/// One reversible operation recorded during deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub id: String,
    #[serde(flatten)]
    pub target: RollbackTarget,
    pub priority: i32,
    pub description: String,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_critical() -> bool {
    true
}

impl RollbackAction {
    pub fn new(target: RollbackTarget, priority: i32, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            priority,
            description: description.into(),
            critical: true,
            continue_on_failure: false,
        }
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Order a plan for execution: priority descending, later insertions first
/// within equal priority.
pub fn order_plan(actions: &[RollbackAction]) -> Vec<RollbackAction> {
    let mut indexed: Vec<(usize, &RollbackAction)> = actions.iter().enumerate().collect();
    indexed.sort_by_key(|(index, action)| (std::cmp::Reverse(action.priority), std::cmp::Reverse(*index)));
    indexed.into_iter().map(|(_, action)| action.clone()).collect()
}
