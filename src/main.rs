use anyhow::{Context, Result};
use armada::environment::Environment;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "armada")]
#[command(version, about = "Multi-domain deployment orchestrator for serverless workers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Working directory holding armada.toml and the active platform config
    #[arg(long, global = true)]
    pub working_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a portfolio of domains through the phased pipeline
    Deploy {
        /// Domains to deploy; empty means discover from configuration
        domains: Vec<String>,
        #[arg(long, value_enum)]
        env: Option<Environment>,
        /// Simulate every phase without touching the platform
        #[arg(long)]
        dry_run: bool,
        /// Skip post-validation health checks
        #[arg(long)]
        skip_tests: bool,
        /// Batch size (1-10)
        #[arg(short, long)]
        parallel: Option<usize>,
        /// Seconds to pause between batches
        #[arg(long)]
        batch_pause: Option<u64>,
        /// Disable automatic rollback on portfolio failure
        #[arg(long)]
        no_rollback: bool,
        /// Disable shared-resource preparation
        #[arg(long)]
        no_shared: bool,
        /// Also discover domains from the live platform
        #[arg(long)]
        discover: bool,
        /// Skip the pre-run configuration backup
        #[arg(long)]
        skip_backup: bool,
    },
    /// Roll back a persisted run
    Rollback {
        run_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show one run in detail (defaults to the most recent)
    Status { run_id: Option<String> },
    /// List persisted runs
    List,
    /// Health-check the portfolio
    Health {
        domains: Vec<String>,
        #[arg(long, value_enum)]
        env: Option<Environment>,
    },
    /// Back up configuration files and platform listings
    Backup {
        #[arg(long)]
        skip_platform: bool,
        #[arg(long)]
        skip_database: bool,
    },
    /// Inspect resolved configuration for a domain
    Resolve { domain: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default armada.toml file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(armada::errors::exit_code(&err));
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let working_dir = match cli.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = working_dir.join("deployments").join("logs");
    let log_dir = std::fs::create_dir_all(&log_dir).ok().map(|_| log_dir);
    let _log_guard = armada::logging::init(cli.verbose, log_dir.as_deref());

    match cli.command {
        Commands::Deploy {
            domains,
            env,
            dry_run,
            skip_tests,
            parallel,
            batch_pause,
            no_rollback,
            no_shared,
            discover,
            skip_backup,
        } => {
            cmd::deploy::run_deploy(
                &working_dir,
                cmd::deploy::DeployArgs {
                    domains,
                    environment: env,
                    dry_run,
                    skip_tests,
                    parallel,
                    batch_pause_secs: batch_pause,
                    no_rollback,
                    no_shared,
                    discover,
                    skip_backup,
                },
            )
            .await
        }
        Commands::Rollback {
            run_id,
            reason,
            dry_run,
        } => cmd::rollback::run_rollback(&working_dir, &run_id, reason.as_deref(), dry_run).await,
        Commands::Status { run_id } => cmd::status::run_status(&working_dir, run_id.as_deref()),
        Commands::List => cmd::status::run_list(&working_dir),
        Commands::Health { domains, env } => {
            cmd::health::run_health(&working_dir, domains, env).await
        }
        Commands::Backup {
            skip_platform,
            skip_database,
        } => cmd::backup::run_backup(&working_dir, !skip_platform, !skip_database).await,
        Commands::Resolve { domain } => cmd::resolve::run_resolve(&working_dir, &domain),
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => cmd::config::run_show(&working_dir),
            ConfigCommands::Validate => cmd::config::run_validate(&working_dir),
            ConfigCommands::Init => cmd::config::run_init(&working_dir),
        },
    }
}
