//! Portfolio deployment — `armada deploy`.

use anyhow::Result;
use armada::config::{ConfigStore, RunLock};
use armada::coordinator::{
    DeployCoordinator, DeployEvent, DeployOptions, pipeline_from_config, validate_parallel_limit,
};
use armada::environment::Environment;
use armada::errors::OrchestratorError;
use armada::portfolio::{CrossDomainCoordinator, PortfolioOptions};
use armada::report::PortfolioReport;
use armada::rollback::{BackupManager, BackupOptions, RollbackContext, RollbackManager};
use armada::secrets::SecretManager;
use armada::state::{AuditEvent, RunOptions, StateManager};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct DeployArgs {
    pub domains: Vec<String>,
    pub environment: Option<Environment>,
    pub dry_run: bool,
    pub skip_tests: bool,
    pub parallel: Option<usize>,
    pub batch_pause_secs: Option<u64>,
    pub no_rollback: bool,
    pub no_shared: bool,
    pub discover: bool,
    pub skip_backup: bool,
}

pub async fn run_deploy(working_dir: &Path, args: DeployArgs) -> Result<()> {
    dotenvy::from_path(working_dir.join(".env")).ok();
    let (config, config_warnings) = super::load_config(working_dir)?;
    let _lock = RunLock::acquire(working_dir)?;

    let environment = super::pick_environment(args.environment);
    let parallel_limit =
        validate_parallel_limit(args.parallel.unwrap_or(config.orchestrator.parallel_limit))?;
    let batch_pause = Duration::from_secs(
        args.batch_pause_secs
            .unwrap_or(config.orchestrator.batch_pause_secs),
    );
    let skip_tests = args.skip_tests || config.orchestrator.skip_tests;
    let rollback_enabled = !args.no_rollback && config.orchestrator.enable_auto_rollback;

    let resolver = super::build_resolver(&config);
    let platform = super::build_platform(&config, working_dir);
    let state_root = super::state_root(&config, working_dir);
    let backup_root = super::backup_root(&config, working_dir);

    let state = StateManager::init_run(RunOptions {
        environment,
        parallel_limit,
        batch_pause,
        dry_run: args.dry_run,
        skip_tests,
        rollback_enabled,
        persist_root: config
            .orchestrator
            .persistence_enabled
            .then(|| state_root.clone()),
    })
    .await;
    let run_id = state.orchestration_id().await;
    state
        .append_audit(
            AuditEvent::OrchestratorInitialized,
            None,
            json!({
                "environment": environment,
                "parallel_limit": parallel_limit,
                "dry_run": args.dry_run,
            }),
        )
        .await;

    let secrets = Arc::new(SecretManager::new(config.secrets.keys.clone()));
    let options = DeployOptions {
        environment,
        working_dir: working_dir.to_path_buf(),
        backup_root: backup_root.clone(),
        dry_run: args.dry_run,
        skip_tests,
        parallel_limit,
        batch_pause,
        database_binding: config.platform.database_binding.clone(),
        cli: config.platform.cli.clone(),
        account_id: std::env::var("CLOUDFLARE_ACCOUNT_ID").ok(),
        config_warnings,
    };

    let (event_tx, event_rx) = mpsc::channel::<DeployEvent>(64);
    let coordinator = DeployCoordinator::new(
        state.clone(),
        platform.clone(),
        resolver,
        secrets,
        options,
    )
    .with_pipeline(pipeline_from_config(&config.phases.pipeline)?)
    .with_event_channel(event_tx);

    // Pre-run state backup; its restore actions run after any portfolio
    // rollback, via the run-level plan below.
    let mut run_level_actions = Vec::new();
    if !args.skip_backup && !args.dry_run {
        let backups = BackupManager::new(
            platform.clone(),
            ConfigStore::new(working_dir),
            backup_root.clone(),
            run_id.clone(),
        );
        match backups.create_state_backup(BackupOptions::default()).await {
            Ok((_, actions)) => run_level_actions = actions,
            Err(err) => warn!(error = %err, "pre-run backup failed; continuing without it"),
        }
    }

    let rollback = RollbackManager::new(
        platform.clone(),
        backup_root.clone(),
        run_id.clone(),
        args.dry_run,
    );
    let cross = CrossDomainCoordinator::new(
        coordinator,
        rollback,
        PortfolioOptions {
            enable_shared_resources: !args.no_shared && config.orchestrator.enable_shared_resources,
            enable_auto_rollback: rollback_enabled,
            verify_after_deploy: !skip_tests,
        },
    );

    // Discover the portfolio when asked (or when no explicit domains came
    // in on the command line).
    let domains = if args.domains.is_empty() || args.discover {
        let discovery = cross
            .discover_portfolio(&args.domains, &config, args.discover)
            .await;
        for error in &discovery.source_errors {
            warn!(error = %error, "portfolio discovery source failed");
        }
        discovery.domains
    } else {
        args.domains.clone()
    };
    if domains.is_empty() {
        anyhow::bail!(OrchestratorError::Config(
            "no domains to deploy: pass them on the command line or configure [domains] in armada.toml"
                .into()
        ));
    }

    eprintln!(
        "{} {} domain(s) to {} (run {})",
        style("Deploying").cyan().bold(),
        domains.len(),
        environment,
        run_id
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());
    let progress = spawn_progress_renderer(event_rx, domains.len() as u64);

    let report = cross.coordinate_deployment(&domains, &cancel).await;
    // The event sender lives inside the coordinator; dropping it closes the
    // channel and lets the renderer finish.
    drop(cross);
    progress.await.ok();
    let report = report?;

    // Run-level restore actions (pre-run backup) execute only when the
    // portfolio failed and rollback is on.
    if !report.succeeded() && rollback_enabled && !run_level_actions.is_empty() {
        let run_rollback =
            RollbackManager::new(platform, backup_root, run_id.clone(), args.dry_run);
        run_rollback
            .execute(
                &run_level_actions,
                None,
                RollbackContext {
                    deployment_id: None,
                    coordination_id: report.coordination_id.clone(),
                    reason: "restore pre-run configuration backup".into(),
                },
            )
            .await;
    }

    println!("{}", report.render());
    finish(report)
}

fn finish(report: PortfolioReport) -> Result<()> {
    if report.succeeded() {
        Ok(())
    } else {
        anyhow::bail!(
            "deployment incomplete: {} failed, {} skipped of {} domain(s)",
            report.summary.failed,
            report.skipped.len(),
            report.summary.total
        )
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} finishing in-flight phases, skipping the rest",
                style("Cancelling:").yellow().bold()
            );
            cancel.cancel();
        }
    });
}

fn spawn_progress_renderer(
    mut events: mpsc::Receiver<DeployEvent>,
    total: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{bar:30.cyan/dim} {pos}/{len} {msg}")
                .expect("progress template is valid"),
        );
        while let Some(event) = events.recv().await {
            match event {
                DeployEvent::BatchStarted { batch, domains } => {
                    bar.set_message(format!("batch {batch}: {}", domains.join(", ")));
                }
                DeployEvent::PhaseCompleted { domain, phase, success } => {
                    if !success {
                        bar.println(format!("  warn {domain}: phase {phase} failed"));
                    }
                }
                DeployEvent::DomainFinished { domain, success } => {
                    bar.inc(1);
                    let marker = if success { "done" } else { "FAILED" };
                    bar.println(format!("  {marker} {domain}"));
                }
                _ => {}
            }
        }
        bar.finish_and_clear();
    })
}
