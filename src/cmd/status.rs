//! Run inspection — `armada status` and `armada list`.

use anyhow::{Context, Result};
use armada::state::RunSnapshot;
use console::style;
use std::path::{Path, PathBuf};

/// List persisted runs, most recent first.
pub fn run_list(working_dir: &Path) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let root = super::state_root(&config, working_dir);
    let runs = list_run_files(&root)?;
    if runs.is_empty() {
        println!("No orchestration runs found under {}", root.display());
        return Ok(());
    }
    for path in runs {
        match RunSnapshot::load(&path) {
            Ok(snapshot) => {
                let status = if snapshot.summary.failed > 0 {
                    style("failed").red()
                } else if snapshot.end_time.is_some() {
                    style("complete").green()
                } else {
                    style("in progress").yellow()
                };
                println!(
                    "{}  {}  {}  {}/{} deployed",
                    snapshot.start_time.format("%Y-%m-%d %H:%M:%S"),
                    status,
                    snapshot.orchestration_id,
                    snapshot.summary.completed,
                    snapshot.summary.total,
                );
            }
            Err(err) => println!("{}  (unreadable: {err})", path.display()),
        }
    }
    Ok(())
}

/// Show one run in detail; defaults to the most recent.
pub fn run_status(working_dir: &Path, run_id: Option<&str>) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let root = super::state_root(&config, working_dir);
    let path = match run_id {
        Some(id) => root.join(format!("{id}.json")),
        None => list_run_files(&root)?
            .into_iter()
            .next()
            .context("no orchestration runs found; deploy first")?,
    };
    let snapshot = RunSnapshot::load(&path)?;

    println!(
        "{} {}",
        style("Run").bold(),
        style(&snapshot.orchestration_id).cyan()
    );
    println!(
        "  environment: {}  started: {}  ended: {}",
        snapshot.environment,
        snapshot.start_time.format("%Y-%m-%d %H:%M:%S"),
        snapshot
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    println!(
        "  summary: {} total, {} deployed, {} failed",
        snapshot.summary.total, snapshot.summary.completed, snapshot.summary.failed
    );

    for (domain, state) in &snapshot.domain_states {
        println!(
            "  {:40} {:25} {}",
            domain,
            format!("{:?}", state.status),
            state.worker_url.as_deref().unwrap_or("-"),
        );
        if let Some(error) = &state.error {
            println!("    error: {error}");
        }
    }

    let tail = snapshot.audit_log.iter().rev().take(10).collect::<Vec<_>>();
    if !tail.is_empty() {
        println!("  {}", style("recent audit events").bold());
        for entry in tail.into_iter().rev() {
            println!(
                "    #{:<4} {} {:35} {}",
                entry.sequence_number,
                entry.timestamp.format("%H:%M:%S"),
                entry.event.to_string(),
                entry.domain,
            );
        }
    }
    Ok(())
}

fn list_run_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map(|e| e == "json").unwrap_or(false)
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("orchestration-"))
                    .unwrap_or(false)
        })
        .collect();
    runs.sort();
    runs.reverse();
    Ok(runs)
}
