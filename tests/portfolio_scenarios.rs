//! End-to-end portfolio scenarios driven against the recording platform
//! fake: happy paths, batching, dependency ordering, portfolio rollback,
//! and cycle refusal.

use armada::config::ArmadaToml;
use armada::coordinator::{DeployCoordinator, DeployOptions};
use armada::environment::Environment;
use armada::errors::{OrchestratorError, PlatformError};
use armada::platform::testing::RecordingPlatform;
use armada::portfolio::{CrossDomainCoordinator, PortfolioOptions};
use armada::resolver::{DomainOverrides, DomainResolver};
use armada::rollback::RollbackManager;
use armada::secrets::SecretManager;
use armada::state::{AuditEvent, DomainStatus, RunOptions, StateManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Stack {
    cross: CrossDomainCoordinator,
    platform: Arc<RecordingPlatform>,
    state: StateManager,
    _working: TempDir,
    _backups: TempDir,
}

struct StackConfig {
    overrides: HashMap<String, DomainOverrides>,
    parallel_limit: usize,
    batch_pause: Duration,
    dry_run: bool,
    verify_after_deploy: bool,
    enable_auto_rollback: bool,
    platform: RecordingPlatform,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            parallel_limit: 3,
            batch_pause: Duration::from_secs(2),
            dry_run: false,
            verify_after_deploy: false,
            enable_auto_rollback: true,
            platform: RecordingPlatform::new(),
        }
    }
}

async fn build_stack(config: StackConfig) -> Stack {
    let working = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let platform = Arc::new(config.platform);

    let state = StateManager::init_run(RunOptions {
        environment: Environment::Production,
        parallel_limit: config.parallel_limit,
        batch_pause: config.batch_pause,
        dry_run: config.dry_run,
        ..Default::default()
    })
    .await;
    let resolver = Arc::new(DomainResolver::new(config.overrides, Vec::new()));
    let coordinator = DeployCoordinator::new(
        state.clone(),
        platform.clone(),
        resolver,
        Arc::new(SecretManager::new(Vec::new())),
        DeployOptions {
            environment: Environment::Production,
            working_dir: working.path().to_path_buf(),
            backup_root: backups.path().to_path_buf(),
            dry_run: config.dry_run,
            parallel_limit: config.parallel_limit,
            batch_pause: config.batch_pause,
            ..Default::default()
        },
    );
    let rollback = RollbackManager::new(
        platform.clone(),
        backups.path(),
        state.orchestration_id().await,
        config.dry_run,
    );
    let cross = CrossDomainCoordinator::new(
        coordinator,
        rollback,
        PortfolioOptions {
            enable_shared_resources: true,
            enable_auto_rollback: config.enable_auto_rollback,
            verify_after_deploy: config.verify_after_deploy,
        },
    );
    Stack {
        cross,
        platform,
        state,
        _working: working,
        _backups: backups,
    }
}

fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn with_deps(deps: &[(&str, &[&str])]) -> HashMap<String, DomainOverrides> {
    deps.iter()
        .map(|(domain, prereqs)| {
            (
                domain.to_string(),
                DomainOverrides {
                    dependencies: prereqs.iter().map(|p| p.to_string()).collect(),
                    ..Default::default()
                },
            )
        })
        .collect()
}

// S1 - single production domain, happy path.
#[tokio::test]
async fn single_domain_happy_path() {
    let stack = build_stack(StackConfig::default()).await;
    let report = stack
        .cross
        .coordinate_deployment(&domains(&["api.example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.successful, vec!["api.example.com"]);
    assert_eq!(report.summary.success_rate, 100.0);

    let state = stack.state.get_domain("api.example.com").await.unwrap();
    assert_eq!(state.status, DomainStatus::Completed);
    assert_eq!(state.phase_results.len(), 6);
    assert_eq!(
        state.worker_url.as_deref(),
        Some("https://worker.example.workers.dev")
    );
    assert_eq!(state.custom_url.as_deref(), Some("https://api.example.com"));

    let events: Vec<AuditEvent> = stack
        .state
        .audit_log()
        .await
        .iter()
        .map(|e| e.event)
        .collect();
    for expected in [
        AuditEvent::DeploymentStart,
        AuditEvent::DatabaseCreated,
        AuditEvent::SecretsGenerated,
        AuditEvent::HealthCheckPassed,
        AuditEvent::DeploymentSuccess,
        AuditEvent::PortfolioComplete,
    ] {
        assert!(events.contains(&expected), "missing audit event {expected}");
    }
}

// S2 - four independent domains, parallel_limit 2: two batches with one
// two-second pause between them.
#[tokio::test(start_paused = true)]
async fn four_domains_two_batches_with_pause() {
    let stack = build_stack(StackConfig {
        parallel_limit: 2,
        ..Default::default()
    })
    .await;
    let list = domains(&[
        "d1.example.com",
        "d2.example.com",
        "d3.example.com",
        "d4.example.com",
    ]);

    let started = tokio::time::Instant::now();
    let report = stack
        .cross
        .coordinate_deployment(&list, &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.summary.completed, 4);
    assert_eq!(report.summary.success_rate, 100.0);
    // One inter-batch pause of 2s; everything else is instantaneous under
    // the paused clock.
    assert!(elapsed >= Duration::from_secs(2), "pause was not observed");
    assert!(elapsed < Duration::from_secs(4), "too many pauses: {elapsed:?}");

    // Batch membership: d1/d2 finish before d3/d4 start.
    let order = stack.state.completion_order().await;
    let position = |d: &str| order.iter().position(|x| x == d).unwrap();
    assert!(position("d1.example.com") < position("d3.example.com"));
    assert!(position("d2.example.com") < position("d4.example.com"));
}

// S3 - dependency chain forces one domain per batch despite a generous
// parallel limit.
#[tokio::test]
async fn dependency_chain_serializes_batches() {
    let stack = build_stack(StackConfig {
        parallel_limit: 5,
        batch_pause: Duration::ZERO,
        overrides: with_deps(&[
            ("a.example.com", &[]),
            ("b.example.com", &["a.example.com"]),
            ("c.example.com", &["b.example.com"]),
        ]),
        ..Default::default()
    })
    .await;

    let report = stack
        .cross
        .coordinate_deployment(
            &domains(&["a.example.com", "b.example.com", "c.example.com"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(
        stack.state.completion_order().await,
        domains(&["a.example.com", "b.example.com", "c.example.com"])
    );
}

// S4 - third domain fails in deployment; the two successes roll back in
// reverse completion order.
#[tokio::test]
async fn portfolio_failure_rolls_back_in_reverse() {
    let platform = RecordingPlatform::new();
    platform.push_deploy_result(Ok(armada::platform::CommandOutput {
        stdout: "Deployed to https://d1.workers.dev".into(),
        stderr: String::new(),
        exit_code: 0,
    }));
    platform.push_deploy_result(Ok(armada::platform::CommandOutput {
        stdout: "Deployed to https://d2.workers.dev".into(),
        stderr: String::new(),
        exit_code: 0,
    }));
    platform.push_deploy_result(Err(PlatformError::Transport("upload exploded".into())));

    let stack = build_stack(StackConfig {
        parallel_limit: 1,
        batch_pause: Duration::ZERO,
        platform,
        ..Default::default()
    })
    .await;
    let list = domains(&["d1.example.com", "d2.example.com", "d3.example.com"]);

    let report = stack
        .cross
        .coordinate_deployment(&list, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].domain, "d3.example.com");
    assert_eq!(report.failed[0].phase, "deployment");
    assert_eq!(report.rolled_back, domains(&["d2.example.com", "d1.example.com"]));

    // Per-domain rollback order: worker deletion (priority 40) before
    // database deletion (priority 20), d2 before d1.
    let calls = stack.platform.calls();
    let find = |call: &str| {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("missing call {call}; got {calls:?}"))
    };
    let d2_worker = find("delete_worker d2-example-com-data-service production");
    let d2_db = find("delete_database d2-example-com-production-db");
    let d1_worker = find("delete_worker d1-example-com-data-service production");
    let d1_db = find("delete_database d1-example-com-production-db");
    assert!(d2_worker < d2_db, "worker must delete before database");
    assert!(d1_worker < d1_db, "worker must delete before database");
    assert!(d2_db < d1_worker, "d2 must fully roll back before d1 starts");

    let log = stack.state.audit_log().await;
    let events: Vec<AuditEvent> = log.iter().map(|e| e.event).collect();
    assert!(events.contains(&AuditEvent::CrossDomainRollbackStart));
    assert!(events.contains(&AuditEvent::PortfolioFailed));
    let completed = log
        .iter()
        .find(|e| e.event == AuditEvent::CrossDomainRollbackCompleted)
        .expect("rollback completion event");
    assert_eq!(completed.details["rolled_back_domains"], 2);
}

// S5 - health check flaps twice then recovers; exactly one
// HEALTH_CHECK_PASSED entry with attempt=3.
#[tokio::test(start_paused = true)]
async fn health_flap_recovers_on_third_attempt() {
    let platform = RecordingPlatform::new();
    platform.push_health_result(Err(PlatformError::Transport("connection refused".into())));
    platform.push_health_result(Err(PlatformError::Transport("connection refused".into())));

    let stack = build_stack(StackConfig {
        platform,
        ..Default::default()
    })
    .await;
    let report = stack
        .cross
        .coordinate_deployment(&domains(&["api.example.com"]), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.succeeded());

    let log = stack.state.audit_log().await;
    let passed: Vec<_> = log
        .iter()
        .filter(|e| e.event == AuditEvent::HealthCheckPassed)
        .collect();
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0].details["attempt"], 3);
}

// S6 - cyclic dependencies refuse to deploy before anything starts.
#[tokio::test]
async fn cycle_refuses_before_any_deployment() {
    let stack = build_stack(StackConfig {
        overrides: with_deps(&[
            ("a.example.com", &["b.example.com"]),
            ("b.example.com", &["a.example.com"]),
        ]),
        ..Default::default()
    })
    .await;

    let err = stack
        .cross
        .coordinate_deployment(
            &domains(&["a.example.com", "b.example.com"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CircularDependency { .. }));
    let message = err.to_string();
    assert!(message.contains("a.example.com"));
    assert!(message.contains("b.example.com"));

    // Nothing was attempted.
    let events: Vec<AuditEvent> = stack
        .state
        .audit_log()
        .await
        .iter()
        .map(|e| e.event)
        .collect();
    assert!(!events.contains(&AuditEvent::DeploymentStart));
    assert!(stack.platform.calls().is_empty());
}

// Property 11 - dry runs never touch the platform or the active config.
#[tokio::test(start_paused = true)]
async fn dry_run_produces_no_platform_writes() {
    let stack = build_stack(StackConfig {
        dry_run: true,
        platform: RecordingPlatform::read_only(),
        ..Default::default()
    })
    .await;
    let report = stack
        .cross
        .coordinate_deployment(
            &domains(&["a.example.com", "b.example.com"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(report.dry_run);
    assert!(stack.platform.calls().is_empty());
    assert!(!stack._working.path().join("wrangler.toml").exists());

    for domain in ["a.example.com", "b.example.com"] {
        let state = stack.state.get_domain(domain).await.unwrap();
        assert_eq!(state.status, DomainStatus::Completed);
        assert!(state.rollback_actions.is_empty());
    }
}

// Shared databases prepare exactly once and order consumers after owners.
#[tokio::test]
async fn shared_database_prepares_once_and_orders_domains() {
    let mut overrides = HashMap::new();
    overrides.insert(
        "auth.example.com".to_string(),
        DomainOverrides {
            shared_databases: vec![armada::resolver::SharedDatabase {
                name: "identity-db".to_string(),
                environment: Environment::Production,
                shared_with: vec!["api.example.com".to_string()],
            }],
            ..Default::default()
        },
    );
    let stack = build_stack(StackConfig {
        overrides,
        batch_pause: Duration::ZERO,
        ..Default::default()
    })
    .await;

    let report = stack
        .cross
        .coordinate_deployment(
            &domains(&["api.example.com", "auth.example.com"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(report.succeeded());

    assert_eq!(stack.platform.count_of("create_database identity-db"), 1);
    assert_eq!(
        stack.state.completion_order().await,
        domains(&["auth.example.com", "api.example.com"])
    );
}

// Verification demotes an unhealthy success to failure.
#[tokio::test]
async fn verification_failure_demotes_success() {
    let platform = RecordingPlatform::new();
    // Post-validation probe passes, the verification sweep then errors.
    platform.push_health_result(Ok(armada::platform::HealthProbe {
        status_code: 200,
        response_time_ms: 4,
    }));
    platform.push_health_result(Err(PlatformError::Transport("gone away".into())));

    let stack = build_stack(StackConfig {
        platform,
        verify_after_deploy: true,
        enable_auto_rollback: false,
        ..Default::default()
    })
    .await;
    let report = stack
        .cross
        .coordinate_deployment(&domains(&["api.example.com"]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert!(report.successful.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].phase, "verification");
}
