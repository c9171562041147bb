//! Out-of-band rollback of a persisted run — `armada rollback <run-id>`.

use anyhow::{Context, Result};
use armada::rollback::{RollbackContext, RollbackManager};
use armada::state::RunSnapshot;
use console::style;
use std::path::Path;

pub async fn run_rollback(
    working_dir: &Path,
    run_id: &str,
    reason: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let root = super::state_root(&config, working_dir);
    let snapshot_path = root.join(format!("{run_id}.json"));
    let snapshot = RunSnapshot::load(&snapshot_path)
        .with_context(|| format!("run '{run_id}' not found under {}", root.display()))?;

    let platform = super::build_platform(&config, working_dir);
    let manager = RollbackManager::new(
        platform,
        super::backup_root(&config, working_dir),
        run_id,
        dry_run,
    );
    let reason = reason.unwrap_or("manual rollback").to_string();

    // Successful domains, most recently finished first.
    let mut targets: Vec<_> = snapshot
        .domain_states
        .values()
        .filter(|state| state.status.is_success() && !state.rollback_actions.is_empty())
        .collect();
    targets.sort_by_key(|state| std::cmp::Reverse(state.end_time));

    if targets.is_empty() {
        println!("Nothing to roll back for {run_id}");
        return Ok(());
    }

    let mut failures = 0;
    for state in targets {
        eprintln!(
            "{} {} ({} action(s))",
            style("Rolling back").yellow().bold(),
            state.domain,
            state.rollback_actions.len()
        );
        let report = manager
            .execute(
                &state.rollback_actions,
                Some(&state.domain),
                RollbackContext {
                    deployment_id: Some(state.deployment_id.clone()),
                    coordination_id: None,
                    reason: reason.clone(),
                },
            )
            .await;
        println!("  {}", report.summary);
        failures += report.failed.len();
    }

    if failures > 0 {
        anyhow::bail!("{failures} rollback action(s) failed; see rollback-log.json");
    }
    Ok(())
}
