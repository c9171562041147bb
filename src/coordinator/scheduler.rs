//! Batched parallel scheduling across a portfolio.
//!
//! Domains run in contiguous batches of at most `parallel_limit`, settle
//! together (one domain's failure never cancels its batch siblings), and
//! pause between batches to soften platform rate limits.

use super::{DeployCoordinator, DeployEvent, PhaseFailure};
use crate::errors::OrchestratorError;
use crate::state::DomainState;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One failed domain with the phase that sank it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainFailure {
    pub domain: String,
    pub phase: String,
    pub error: String,
}

impl From<PhaseFailure> for DomainFailure {
    fn from(failure: PhaseFailure) -> Self {
        Self {
            domain: failure.domain,
            phase: failure.phase,
            error: failure.source.to_string(),
        }
    }
}

/// Settled results of a batched run.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Final states of successful domains, in input order.
    pub successes: Vec<DomainState>,
    pub failures: Vec<DomainFailure>,
    /// Domains never attempted because the run was cancelled first.
    pub skipped: Vec<String>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

/// Validate a requested parallel limit: 1 through 10, warning above 5.
pub fn validate_parallel_limit(limit: usize) -> Result<usize, OrchestratorError> {
    if !(1..=10).contains(&limit) {
        return Err(OrchestratorError::Config(format!(
            "parallel limit must be between 1 and 10, got {limit}"
        )));
    }
    if limit > 5 {
        warn!(limit, "parallel limit above 5 may trip platform rate limits");
    }
    Ok(limit)
}

/// Split an ordered domain list into contiguous batches.
pub fn contiguous_batches(domains: &[String], limit: usize) -> Vec<Vec<String>> {
    domains
        .chunks(limit.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

impl DeployCoordinator {
    /// Deploy pre-computed batches. Batch order is preserved; domains inside
    /// a batch run concurrently and settle together.
    pub async fn run_batches(
        &self,
        batches: &[Vec<String>],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let total = batches.len();

        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome
                    .skipped
                    .extend(batches[index..].iter().flatten().cloned());
                warn!(
                    skipped = outcome.skipped.len(),
                    "cancellation observed; remaining batches skipped"
                );
                break;
            }

            info!(batch = index + 1, of = total, domains = ?batch, "starting batch");
            self.emit(DeployEvent::BatchStarted {
                batch: index + 1,
                domains: batch.clone(),
            })
            .await;

            let results = join_all(
                batch
                    .iter()
                    .map(|domain| self.deploy_domain(domain, cancel)),
            )
            .await;

            let mut succeeded = 0;
            let mut failed = 0;
            for result in results {
                match result {
                    Ok(state) => {
                        succeeded += 1;
                        outcome.successes.push(state);
                    }
                    Err(failure) => {
                        failed += 1;
                        outcome.failures.push(failure.into());
                    }
                }
            }
            self.emit(DeployEvent::BatchCompleted {
                batch: index + 1,
                succeeded,
                failed,
            })
            .await;

            // Inter-batch pause, skipped after the final batch.
            let pause = self.options().batch_pause;
            if index + 1 < total && !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        outcome
    }

    /// Deploy an ordered domain list with plain contiguous batching (no
    /// dependency constraints).
    pub async fn deploy_portfolio(
        &self,
        domains: &[String],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let batches = contiguous_batches(domains, self.options().parallel_limit);
        self.run_batches(&batches, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn batches_are_contiguous_and_bounded() {
        let batches = contiguous_batches(&domains(&["a", "b", "c", "d", "e"]), 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], domains(&["a", "b"]));
        assert_eq!(batches[1], domains(&["c", "d"]));
        assert_eq!(batches[2], domains(&["e"]));
    }

    #[test]
    fn batch_of_limit_one_serializes() {
        let batches = contiguous_batches(&domains(&["a", "b"]), 1);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn parallel_limit_bounds() {
        assert!(validate_parallel_limit(0).is_err());
        assert!(validate_parallel_limit(11).is_err());
        assert_eq!(validate_parallel_limit(1).unwrap(), 1);
        assert_eq!(validate_parallel_limit(10).unwrap(), 10);
        assert_eq!(validate_parallel_limit(7).unwrap(), 7);
    }
}
