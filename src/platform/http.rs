//! Authenticated HTTP implementation of the platform capability set.
//!
//! Paths follow the managed platform's account-scoped REST shape; the exact
//! wire format stays behind this adapter. `PermissionDenied` responses get
//! one fallback re-attempt with the secondary OAuth token when configured,
//! with a warning that the effective identity changed.

use super::retry::{RetryPolicy, with_retry};
use super::{CommandOutput, HealthProbe, Platform, PlatformAuth, http_health_check};
use crate::environment::Environment;
use crate::errors::PlatformError;
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
    auth: PlatformAuth,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>, auth: PlatformAuth, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            timeout,
            retry: RetryPolicy::default(),
        }
    }

    fn account_id(&self) -> Result<&str, PlatformError> {
        self.auth
            .account_id
            .as_deref()
            .ok_or_else(|| PlatformError::Auth("no account id configured".into()))
    }

    fn token(&self) -> Result<&SecretString, PlatformError> {
        self.auth
            .api_token
            .as_ref()
            .ok_or_else(|| PlatformError::Auth("no API token configured".into()))
    }

    fn url(&self, path: &str) -> Result<String, PlatformError> {
        Ok(format!(
            "{}/accounts/{}/{}",
            self.base_url,
            self.account_id()?,
            path.trim_start_matches('/')
        ))
    }

    /// Send one request with retry; on `PermissionDenied`, re-attempt once
    /// with the fallback token if one is configured.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, PlatformError> {
        let url = self.url(path)?;
        let operation = format!("{method} {path}");

        let primary = self
            .send(method.clone(), &url, body.clone(), self.token()?, &operation)
            .await;

        match (primary, &self.auth.fallback_token) {
            (Err(PlatformError::PermissionDenied(reason)), Some(fallback)) => {
                warn!(
                    operation = %operation,
                    %reason,
                    "permission denied; retrying with OAuth fallback token - the effective account may differ from the configured identity"
                );
                self.send(method, &url, body, fallback, &operation).await
            }
            (result, _) => result,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        token: &SecretString,
        operation: &str,
    ) -> Result<Value, PlatformError> {
        with_retry(operation, self.retry, |_| {
            let method = method.clone();
            let body = body.clone();
            async move {
                let mut request = self
                    .client
                    .request(method, url)
                    .bearer_auth(token.expose())
                    .timeout(self.timeout);
                if let Some(json_body) = body {
                    request = request.json(&json_body);
                }
                let response = request.send().await.map_err(|e| {
                    if e.is_timeout() {
                        PlatformError::Timeout {
                            operation: operation.to_string(),
                            seconds: self.timeout.as_secs(),
                        }
                    } else {
                        PlatformError::Transport(e.to_string())
                    }
                })?;

                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                match status {
                    s if s.is_success() => {
                        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
                    }
                    StatusCode::UNAUTHORIZED => Err(PlatformError::Auth(truncate(&text))),
                    StatusCode::FORBIDDEN => {
                        Err(PlatformError::PermissionDenied(truncate(&text)))
                    }
                    StatusCode::NOT_FOUND => Err(PlatformError::NotFound(truncate(&text))),
                    StatusCode::TOO_MANY_REQUESTS => {
                        Err(PlatformError::RateLimited(truncate(&text)))
                    }
                    s => Err(PlatformError::Transport(format!(
                        "{operation} returned {s}: {}",
                        truncate(&text)
                    ))),
                }
            }
        })
        .await
    }
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.len() > LIMIT {
        format!("{}...", &text[..LIMIT])
    } else {
        text.to_string()
    }
}

fn result_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get("result").and_then(|r| r.get(field))
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn database_exists(&self, name: &str) -> Result<bool, PlatformError> {
        let listing = self
            .request(Method::GET, &format!("databases?name={name}"), None)
            .await?;
        let exists = listing
            .get("result")
            .and_then(|r| r.as_array())
            .map(|rows| rows.iter().any(|row| row.get("name").and_then(Value::as_str) == Some(name)))
            .unwrap_or(false);
        Ok(exists)
    }

    async fn create_database(&self, name: &str) -> Result<String, PlatformError> {
        let created = self
            .request(Method::POST, "databases", Some(json!({ "name": name })))
            .await?;
        result_field(&created, "uuid")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                PlatformError::Transport(format!("create database '{name}': no uuid in response"))
            })
    }

    async fn get_database_id(&self, name: &str) -> Result<String, PlatformError> {
        let listing = self
            .request(Method::GET, &format!("databases?name={name}"), None)
            .await?;
        listing
            .get("result")
            .and_then(|r| r.as_array())
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("name").and_then(Value::as_str) == Some(name))
            })
            .and_then(|row| row.get("uuid").and_then(Value::as_str))
            .map(String::from)
            .ok_or_else(|| PlatformError::NotFound(format!("database '{name}'")))
    }

    async fn apply_migrations(
        &self,
        database: &str,
        binding: &str,
        environment: Environment,
        remote: bool,
    ) -> Result<(), PlatformError> {
        self.request(
            Method::POST,
            &format!("databases/{database}/migrations"),
            Some(json!({
                "binding": binding,
                "environment": environment.as_str(),
                "remote": remote,
            })),
        )
        .await
        .map(|_| ())
    }

    async fn put_secret(
        &self,
        scope: &str,
        key: &str,
        value: &SecretString,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.request(
            Method::PUT,
            &format!("workers/scripts/{scope}/secrets"),
            Some(json!({
                "name": key,
                "text": value.expose(),
                "environment": environment.as_str(),
            })),
        )
        .await
        .map(|_| ())
    }

    async fn delete_secret(
        &self,
        key: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.request(
            Method::DELETE,
            &format!("workers/secrets/{key}?environment={environment}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn deploy_worker(
        &self,
        environment: Environment,
        working_dir: &Path,
    ) -> Result<CommandOutput, PlatformError> {
        // The artifact is already built; ship the bundle the working dir
        // points at.
        let bundle = working_dir.join("dist").join("worker.js");
        let script = tokio::fs::read_to_string(&bundle).await.map_err(|e| {
            PlatformError::NotFound(format!("worker bundle {}: {e}", bundle.display()))
        })?;

        let deployed = self
            .request(
                Method::POST,
                "workers/deployments",
                Some(json!({
                    "environment": environment.as_str(),
                    "script": script,
                })),
            )
            .await?;

        let url = result_field(&deployed, "url")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let logs = result_field(&deployed, "logs")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout: format!("{logs}\nDeployed {url}\n"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn delete_worker(
        &self,
        name: &str,
        environment: Environment,
    ) -> Result<(), PlatformError> {
        self.request(
            Method::DELETE,
            &format!("workers/scripts/{name}?environment={environment}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_database(&self, name: &str) -> Result<(), PlatformError> {
        self.request(Method::DELETE, &format!("databases/{name}"), None)
            .await
            .map(|_| ())
    }

    async fn list_workers(&self) -> Result<String, PlatformError> {
        let listing = self.request(Method::GET, "workers/scripts", None).await?;
        Ok(names_from_listing(&listing))
    }

    async fn list_secrets(&self) -> Result<String, PlatformError> {
        let listing = self.request(Method::GET, "workers/secrets", None).await?;
        Ok(names_from_listing(&listing))
    }

    async fn list_databases(&self) -> Result<String, PlatformError> {
        let listing = self.request(Method::GET, "databases", None).await?;
        Ok(names_from_listing(&listing))
    }

    async fn health_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<HealthProbe, PlatformError> {
        http_health_check(&self.client, url, timeout).await
    }
}

fn names_from_listing(listing: &Value) -> String {
    listing
        .get("result")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    row.get("name")
                        .and_then(Value::as_str)
                        .or_else(|| row.as_str())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_from_listing_handles_objects_and_strings() {
        let listing = json!({ "result": [ { "name": "api-worker" }, "auth-worker" ] });
        assert_eq!(names_from_listing(&listing), "api-worker\nauth-worker");
        assert_eq!(names_from_listing(&json!({})), "");
    }

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "x".repeat(500);
        assert!(truncate(&long).len() <= 203);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn url_requires_account_id() {
        let platform = HttpPlatform::new(
            "https://api.example.dev/v4",
            PlatformAuth::default(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            platform.url("databases"),
            Err(PlatformError::Auth(_))
        ));
    }

    #[test]
    fn url_is_account_scoped() {
        let auth = PlatformAuth {
            account_id: Some("acct123".into()),
            ..Default::default()
        };
        let platform = HttpPlatform::new("https://api.example.dev/v4/", auth, Duration::from_secs(5));
        assert_eq!(
            platform.url("databases").unwrap(),
            "https://api.example.dev/v4/accounts/acct123/databases"
        );
    }
}
