//! Local-shell implementation of the platform capability set.
//!
//! Wraps the platform CLI (`wrangler` by default, configurable) with the
//! shared timeout and retry discipline. The orchestrator never parses CLI
//! output outside this adapter.

use super::retry::{RetryPolicy, with_retry};
use super::{CommandOutput, HealthProbe, Platform, http_health_check};
use crate::environment::Environment;
use crate::errors::PlatformError;
use crate::secrets::SecretString;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub struct ShellPlatform {
    cli: String,
    working_dir: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl ShellPlatform {
    pub fn new(cli: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cli: cli.into(),
            working_dir: working_dir.into(),
            timeout,
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn cli(&self) -> &str {
        &self.cli
    }

    async fn run(&self, args: &[&str], dir: &Path) -> Result<CommandOutput, PlatformError> {
        self.run_with_stdin(args, dir, None).await
    }

    async fn run_with_stdin(
        &self,
        args: &[&str],
        dir: &Path,
        stdin: Option<&SecretString>,
    ) -> Result<CommandOutput, PlatformError> {
        let operation = format!("{} {}", self.cli, args.join(" "));
        with_retry(&operation, self.retry, |_| {
            let operation = operation.clone();
            async move {
                let mut command = tokio::process::Command::new(&self.cli);
                command
                    .args(args)
                    .current_dir(dir)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                command.stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                });

                let mut child = command
                    .spawn()
                    .map_err(|e| PlatformError::Transport(format!("spawn {operation}: {e}")))?;

                if let (Some(value), Some(mut pipe)) = (stdin, child.stdin.take()) {
                    pipe.write_all(value.expose().as_bytes()).await.map_err(|e| {
                        PlatformError::Transport(format!("write stdin for {operation}: {e}"))
                    })?;
                    drop(pipe);
                }

                let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
                let output = match waited {
                    Ok(result) => result.map_err(|e| {
                        PlatformError::Transport(format!("wait for {operation}: {e}"))
                    })?,
                    Err(_) => {
                        return Err(PlatformError::Timeout {
                            operation,
                            seconds: self.timeout.as_secs(),
                        });
                    }
                };

                let out = CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                };
                if out.exit_code == 0 {
                    Ok(out)
                } else {
                    Err(classify_failure(&operation, &out))
                }
            }
        })
        .await
    }

    async fn database_listing(&self) -> Result<Vec<Value>, PlatformError> {
        let out = self.run(&["d1", "list", "--json"], &self.working_dir).await?;
        serde_json::from_str::<Vec<Value>>(out.stdout.trim())
            .map_err(|e| PlatformError::Transport(format!("parse d1 list output: {e}")))
    }
}

/// Map a non-zero CLI exit onto the typed error set by inspecting stderr.
fn classify_failure(operation: &str, out: &CommandOutput) -> PlatformError {
    let stderr = out.stderr.to_lowercase();
    if stderr.contains("authentication") || stderr.contains("not logged in") {
        PlatformError::Auth(format!("{operation}: {}", out.stderr.trim()))
    } else if stderr.contains("permission") || stderr.contains("forbidden") {
        PlatformError::PermissionDenied(format!("{operation}: {}", out.stderr.trim()))
    } else if stderr.contains("rate limit") || stderr.contains("too many requests") {
        PlatformError::RateLimited(format!("{operation}: {}", out.stderr.trim()))
    } else if stderr.contains("not found") || stderr.contains("does not exist") {
        PlatformError::NotFound(format!("{operation}: {}", out.stderr.trim()))
    } else {
        PlatformError::Transport(format!(
            "{operation} exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        ))
    }
}

#[async_trait]
impl Platform for ShellPlatform {
    async fn database_exists(&self, name: &str) -> Result<bool, PlatformError> {
        let rows = self.database_listing().await?;
        Ok(rows
            .iter()
            .any(|row| row.get("name").and_then(Value::as_str) == Some(name)))
    }

    async fn create_database(&self, name: &str) -> Result<String, PlatformError> {
        self.run(&["d1", "create", name], &self.working_dir).await?;
        self.get_database_id(name).await
    }

    async fn get_database_id(&self, name: &str) -> Result<String, PlatformError> {
        let rows = self.database_listing().await?;
        rows.iter()
            .find(|row| row.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|row| row.get("uuid").and_then(Value::as_str))
            .map(String::from)
            .ok_or_else(|| PlatformError::NotFound(format!("database '{name}'")))
    }

    async fn apply_migrations(
        &self,
        database: &str,
        _binding: &str,
        environment: Environment,
        remote: bool,
    ) -> Result<(), PlatformError> {
        let mut args = vec!["d1", "migrations", "apply", database, "--env", environment.as_str()];
        if remote {
            args.push("--remote");
        }
        self.run(&args, &self.working_dir).await.map(|_| ())
    }

    async fn put_secret(
        &self,
        _scope: &str,
        key: &str,
        value: &SecretString,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.run_with_stdin(
            &["secret", "put", key, "--env", environment.as_str()],
            &self.working_dir,
            Some(value),
        )
        .await
        .map(|_| ())
    }

    async fn delete_secret(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.run(
            &["secret", "delete", key, "--env", environment.as_str(), "--force"],
            &self.working_dir,
        )
        .await
        .map(|_| ())
    }

    async fn deploy_worker(
        &self,
        environment: Environment,
        working_dir: &Path,
    ) -> Result<CommandOutput, PlatformError> {
        self.run(&["deploy", "--env", environment.as_str()], working_dir)
            .await
    }

    async fn delete_worker(
        &self,
        name: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.run(
            &["delete", "--name", name, "--env", environment.as_str(), "--force"],
            &self.working_dir,
        )
        .await
        .map(|_| ())
    }

    async fn delete_database(&self, name: &str) -> Result<(), PlatformError> {
        self.run(&["d1", "delete", name, "--skip-confirmation"], &self.working_dir)
            .await
            .map(|_| ())
    }

    async fn list_workers(&self) -> Result<String, PlatformError> {
        self.run(&["deployments", "list"], &self.working_dir)
            .await
            .map(|out| out.stdout)
    }

    async fn list_secrets(&self) -> Result<String, PlatformError> {
        self.run(&["secret", "list"], &self.working_dir)
            .await
            .map(|out| out.stdout)
    }

    async fn list_databases(&self) -> Result<String, PlatformError> {
        self.run(&["d1", "list"], &self.working_dir)
            .await
            .map(|out| out.stdout)
    }

    async fn health_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<HealthProbe, PlatformError> {
        http_health_check(&self.http, url, timeout).await
    }
}
