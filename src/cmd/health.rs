//! Portfolio health sweep — `armada health`.

use anyhow::Result;
use armada::environment::Environment;
use armada::portfolio::{HealthStatus, monitor_portfolio_health};
use console::style;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn run_health(
    working_dir: &Path,
    domains: Vec<String>,
    environment: Option<Environment>,
) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let environment = super::pick_environment(environment);
    let resolver = super::build_resolver(&config);
    let platform = super::build_platform(&config, working_dir);

    let domains = if domains.is_empty() {
        let mut configured: Vec<String> = config.domains.keys().cloned().collect();
        configured.sort();
        configured
    } else {
        domains
    };
    if domains.is_empty() {
        anyhow::bail!("no domains to check: pass them explicitly or configure [domains]");
    }

    let mut targets = Vec::new();
    for domain in &domains {
        let resolved = resolver.resolve(domain)?;
        targets.push((
            domain.clone(),
            resolved.environments.get(environment).to_string(),
        ));
    }

    let summary =
        monitor_portfolio_health(platform, targets, &CancellationToken::new()).await;
    for check in &summary.checks {
        let marker = match check.status {
            HealthStatus::Healthy => style("healthy").green(),
            HealthStatus::Unhealthy => style("unhealthy").yellow(),
            HealthStatus::Error => style("error").red(),
        };
        println!("{:40} {:10} {}", check.domain, marker, check.details);
    }
    println!(
        "{} healthy, {} unhealthy, {} errors",
        summary.healthy, summary.unhealthy, summary.errors
    );

    if summary.all_healthy() {
        Ok(())
    } else {
        anyhow::bail!("portfolio is not fully healthy")
    }
}
