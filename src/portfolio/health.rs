//! Portfolio-wide health sweeps.
//!
//! One task per domain, unbounded fan-out, cancellation-aware. Each probe
//! records healthy / unhealthy / error with a timestamp and detail string.

use crate::platform::Platform;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainHealth {
    pub domain: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub checks: Vec<DomainHealth>,
    pub healthy: usize,
    pub unhealthy: usize,
    pub errors: usize,
}

impl HealthSummary {
    pub fn all_healthy(&self) -> bool {
        self.unhealthy == 0 && self.errors == 0
    }
}

/// Probe every `(domain, base_url)` pair concurrently.
pub async fn monitor_portfolio_health(
    platform: Arc<dyn Platform>,
    targets: Vec<(String, String)>,
    cancel: &CancellationToken,
) -> HealthSummary {
    let probes = targets.into_iter().map(|(domain, base)| {
        let platform = platform.clone();
        let cancel = cancel.clone();
        async move {
            let url = format!("{}/health", base.trim_end_matches('/'));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = platform.health_check(&url, PROBE_TIMEOUT) => Some(result),
            };
            match outcome {
                None => DomainHealth {
                    domain,
                    status: HealthStatus::Error,
                    timestamp: Utc::now(),
                    details: "cancelled".to_string(),
                },
                Some(Ok(probe)) if probe.status_code == 200 => DomainHealth {
                    domain,
                    status: HealthStatus::Healthy,
                    timestamp: Utc::now(),
                    details: format!("HTTP 200 in {}ms", probe.response_time_ms),
                },
                Some(Ok(probe)) => DomainHealth {
                    domain,
                    status: HealthStatus::Unhealthy,
                    timestamp: Utc::now(),
                    details: format!("HTTP {}", probe.status_code),
                },
                Some(Err(err)) => DomainHealth {
                    domain,
                    status: HealthStatus::Error,
                    timestamp: Utc::now(),
                    details: err.to_string(),
                },
            }
        }
    });

    let checks = join_all(probes).await;
    let mut summary = HealthSummary::default();
    for check in checks {
        match check.status {
            HealthStatus::Healthy => summary.healthy += 1,
            HealthStatus::Unhealthy => summary.unhealthy += 1,
            HealthStatus::Error => summary.errors += 1,
        }
        summary.checks.push(check);
    }
    summary
}
