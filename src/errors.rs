//! Typed error hierarchy for the armada orchestrator.
//!
//! Two top-level enums cover the two layers:
//! - `PlatformError` — typed failures from the platform adapter capability set
//! - `OrchestratorError` — coordinator, scheduler, and portfolio failures
//!
//! `exit_code` maps an error chain onto the process exit surface.

use thiserror::Error;

/// Errors returned by platform adapter operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl PlatformError {
    /// Whether the adapter retry loop should re-attempt this failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout { .. } | Self::Transport(_)
        )
    }
}

/// Errors from the orchestrator itself: phase machine, scheduler, portfolio
/// coordination, and state persistence.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing or invalid credentials: {0}")]
    Credential(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Circular dependency detected at '{node}' (cycle: {})", cycle.join(" -> "))]
    CircularDependency { node: String, cycle: Vec<String> },

    #[error("cancelled")]
    Cancelled,

    #[error("State persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Map an error chain onto the documented exit surface.
///
/// 1 generic failure, 3 invalid configuration, 4 credential error,
/// 5 not found, 7 timeout, 8 validation error. Argument errors (2) are
/// produced by clap before any of this code runs.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(orch) = cause.downcast_ref::<OrchestratorError>() {
            return match orch {
                OrchestratorError::Validation(_) => 8,
                OrchestratorError::Credential(_) => 4,
                OrchestratorError::Config(_) => 3,
                OrchestratorError::CircularDependency { .. } => 3,
                OrchestratorError::Cancelled => 1,
                OrchestratorError::Persistence(_) => 1,
                OrchestratorError::Platform(p) => platform_exit_code(p),
                OrchestratorError::Other(_) => continue,
            };
        }
        if let Some(platform) = cause.downcast_ref::<PlatformError>() {
            return platform_exit_code(platform);
        }
    }
    1
}

fn platform_exit_code(err: &PlatformError) -> i32 {
    match err {
        PlatformError::Auth(_) | PlatformError::PermissionDenied(_) => 4,
        PlatformError::NotFound(_) => 5,
        PlatformError::Timeout { .. } => 7,
        PlatformError::RateLimited(_) | PlatformError::Transport(_) => 1,
    }
}
