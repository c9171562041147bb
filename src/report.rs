//! Final structured report for an orchestration run.

use crate::coordinator::DomainFailure;
use crate::environment::Environment;
use console::style;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Percentage of the portfolio that deployed, e.g. `100.0`.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioReport {
    pub orchestration_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_id: Option<String>,
    pub environment: Environment,
    pub dry_run: bool,
    pub successful: Vec<String>,
    pub failed: Vec<DomainFailure>,
    pub rolled_back: Vec<String>,
    /// Domains never attempted (cancellation).
    pub skipped: Vec<String>,
    pub duration_ms: u64,
    pub summary: ReportSummary,
}

impl PortfolioReport {
    pub fn summarize(
        successful: Vec<String>,
        failed: Vec<DomainFailure>,
        skipped: Vec<String>,
    ) -> (Vec<String>, Vec<DomainFailure>, Vec<String>, ReportSummary) {
        let total = successful.len() + failed.len() + skipped.len();
        let summary = ReportSummary {
            total,
            completed: successful.len(),
            failed: failed.len(),
            success_rate: if total == 0 {
                100.0
            } else {
                (successful.len() as f64 / total as f64) * 100.0
            },
        };
        (successful, failed, skipped, summary)
    }

    pub fn succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Terminal rendering for the CLI surface.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let header = if self.succeeded() {
            style("Deployment complete").green().bold()
        } else {
            style("Deployment finished with failures").red().bold()
        };
        out.push_str(&format!("{header}\n"));
        out.push_str(&format!(
            "  run:         {}\n  environment: {}{}\n",
            self.orchestration_id,
            self.environment,
            if self.dry_run { " (dry run)" } else { "" }
        ));
        out.push_str(&format!(
            "  summary:     {}/{} deployed ({:.1}%), {} failed\n",
            self.summary.completed, self.summary.total, self.summary.success_rate, self.summary.failed
        ));
        for domain in &self.successful {
            out.push_str(&format!("  {} {}\n", style("ok").green(), domain));
        }
        for failure in &self.failed {
            out.push_str(&format!(
                "  {} {} ({}: {})\n",
                style("failed").red(),
                failure.domain,
                failure.phase,
                failure.error
            ));
        }
        for domain in &self.skipped {
            out.push_str(&format!("  {} {}\n", style("skipped").yellow(), domain));
        }
        if !self.rolled_back.is_empty() {
            out.push_str(&format!(
                "  rolled back: {}\n",
                self.rolled_back.join(", ")
            ));
        }
        out.push_str(&format!("  duration:    {:.1}s\n", self.duration_ms as f64 / 1000.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(domain: &str) -> DomainFailure {
        DomainFailure {
            domain: domain.to_string(),
            phase: "deployment".to_string(),
            error: "boom".to_string(),
        }
    }

    #[test]
    fn success_rate_is_a_percentage() {
        let (_, _, _, summary) = PortfolioReport::summarize(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            vec![],
            vec![],
        );
        assert_eq!(summary.total, 4);
        assert_eq!(summary.success_rate, 100.0);

        let (_, _, _, summary) =
            PortfolioReport::summarize(vec!["a".into()], vec![failure("b")], vec![]);
        assert_eq!(summary.success_rate, 50.0);
    }

    #[test]
    fn empty_portfolio_counts_as_fully_successful() {
        let (_, _, _, summary) = PortfolioReport::summarize(vec![], vec![], vec![]);
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(summary.total, 0);
    }

    #[test]
    fn render_mentions_failures_and_rollbacks() {
        let (successful, failed, skipped, summary) =
            PortfolioReport::summarize(vec!["a.example.com".into()], vec![failure("b.example.com")], vec![]);
        let report = PortfolioReport {
            orchestration_id: "orchestration-x".into(),
            coordination_id: None,
            environment: Environment::Production,
            dry_run: false,
            successful,
            failed,
            rolled_back: vec!["a.example.com".into()],
            skipped,
            duration_ms: 1234,
            summary,
        };
        let rendered = console::strip_ansi_codes(&report.render()).to_string();
        assert!(rendered.contains("b.example.com (deployment: boom)"));
        assert!(rendered.contains("rolled back: a.example.com"));
        assert!(rendered.contains("1/2 deployed (50.0%)"));
    }
}
