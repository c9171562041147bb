//! Wrangler-style platform configuration management.
//!
//! The active `wrangler.toml` is a working copy: per-customer configs are
//! generated under `config/customers/` and promoted to the active path by an
//! atomic replace. Every write backs the previous contents up first.

use crate::environment::Environment;
use crate::util::{atomic_write, timestamped_backup};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toml::Table;
use toml::Value;

/// A logical database binding attached to an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseBinding {
    pub binding: String,
    pub database_name: String,
    pub database_id: String,
}

/// Inputs for generating a per-customer config.
#[derive(Debug, Clone)]
pub struct CustomerConfigOptions {
    pub account_id: Option<String>,
    pub environment: Environment,
    pub worker_name: String,
}

/// Owns the active wrangler config plus the per-customer config directory.
pub struct WranglerManager {
    active_path: PathBuf,
    customers_dir: PathBuf,
}

impl WranglerManager {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            active_path: working_dir.join("wrangler.toml"),
            customers_dir: working_dir.join("config").join("customers"),
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    fn load(&self) -> Result<Table> {
        if !self.active_path.exists() {
            return Ok(Table::new());
        }
        let content = std::fs::read_to_string(&self.active_path)
            .with_context(|| format!("Failed to read {}", self.active_path.display()))?;
        content
            .parse::<Table>()
            .with_context(|| format!("Failed to parse {}", self.active_path.display()))
    }

    fn save(&self, doc: &Table) -> Result<()> {
        timestamped_backup(&self.active_path)?;
        let content = toml::to_string_pretty(doc).context("Failed to serialize wrangler config")?;
        atomic_write(&self.active_path, content.as_bytes())
    }

    pub fn set_account_id(&self, account_id: &str) -> Result<()> {
        let mut doc = self.load()?;
        doc.insert(
            "account_id".to_string(),
            Value::String(account_id.to_string()),
        );
        self.save(&doc)
    }

    /// Make sure an `[env.<name>]` table exists.
    pub fn ensure_environment(&self, environment: Environment) -> Result<()> {
        let mut doc = self.load()?;
        ensure_env_table(&mut doc, environment);
        self.save(&doc)
    }

    /// Attach (or replace) a database binding under the environment's
    /// binding array.
    pub fn add_database_binding(
        &self,
        environment: Environment,
        binding: &DatabaseBinding,
    ) -> Result<()> {
        let mut doc = self.load()?;
        let env_table = ensure_env_table(&mut doc, environment);

        let bindings = env_table
            .entry("d1_databases".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(rows) = bindings else {
            anyhow::bail!(
                "wrangler config: env.{environment}.d1_databases is not an array"
            );
        };

        let mut row = Table::new();
        row.insert("binding".into(), Value::String(binding.binding.clone()));
        row.insert(
            "database_name".into(),
            Value::String(binding.database_name.clone()),
        );
        row.insert(
            "database_id".into(),
            Value::String(binding.database_id.clone()),
        );

        // Replace an existing entry for the same logical binding.
        rows.retain(|existing| {
            existing
                .get("binding")
                .and_then(Value::as_str)
                .map(|b| b != binding.binding)
                .unwrap_or(true)
        });
        rows.push(Value::Table(row));

        self.save(&doc)
    }

    /// Generate a persistent per-customer config derived from the zone name
    /// and environment. Returns the path of the generated file.
    pub fn generate_customer_config(
        &self,
        zone_name: &str,
        options: &CustomerConfigOptions,
    ) -> Result<PathBuf> {
        let mut doc = Table::new();
        doc.insert("name".into(), Value::String(options.worker_name.clone()));
        if let Some(account_id) = &options.account_id {
            doc.insert("account_id".into(), Value::String(account_id.clone()));
        }
        doc.insert("zone_name".into(), Value::String(zone_name.to_string()));

        let mut env_table = Table::new();
        let mut named = Table::new();
        named.insert(
            "name".into(),
            Value::String(format!("{}-{}", options.worker_name, options.environment)),
        );
        env_table.insert(options.environment.to_string(), Value::Table(named));
        doc.insert("env".into(), Value::Table(env_table));

        let path = self.customers_dir.join(format!(
            "wrangler.{zone_name}.{}.toml",
            options.environment
        ));
        let content = toml::to_string_pretty(&doc).context("Failed to serialize customer config")?;
        atomic_write(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Promote a per-customer config to the active path. The previous active
    /// config is backed up first; the replace itself is atomic.
    pub fn copy_customer_config(&self, customer_path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(customer_path)
            .with_context(|| format!("Failed to read {}", customer_path.display()))?;
        timestamped_backup(&self.active_path)?;
        atomic_write(&self.active_path, content.as_bytes())
    }
}

fn ensure_env_table(doc: &mut Table, environment: Environment) -> &mut Table {
    let envs = doc
        .entry("env".to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    let Value::Table(envs) = envs else {
        unreachable!("env entry is always a table");
    };
    let entry = envs
        .entry(environment.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    match entry {
        Value::Table(table) => table,
        _ => unreachable!("env.<name> entry is always a table"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> WranglerManager {
        WranglerManager::new(dir)
    }

    fn binding() -> DatabaseBinding {
        DatabaseBinding {
            binding: "DB".to_string(),
            database_name: "api-example-com-production-db".to_string(),
            database_id: "uuid-1234".to_string(),
        }
    }

    #[test]
    fn set_account_id_creates_file() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_account_id("acct123").unwrap();
        let content = std::fs::read_to_string(manager.active_path()).unwrap();
        assert!(content.contains("account_id = \"acct123\""));
    }

    #[test]
    fn add_database_binding_under_environment() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.ensure_environment(Environment::Production).unwrap();
        manager
            .add_database_binding(Environment::Production, &binding())
            .unwrap();

        let doc: Table = std::fs::read_to_string(manager.active_path())
            .unwrap()
            .parse()
            .unwrap();
        let rows = doc["env"]["production"]["d1_databases"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["database_id"].as_str(), Some("uuid-1234"));
    }

    #[test]
    fn add_database_binding_replaces_same_binding() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .add_database_binding(Environment::Staging, &binding())
            .unwrap();
        let updated = DatabaseBinding {
            database_id: "uuid-5678".to_string(),
            ..binding()
        };
        manager
            .add_database_binding(Environment::Staging, &updated)
            .unwrap();

        let doc: Table = std::fs::read_to_string(manager.active_path())
            .unwrap()
            .parse()
            .unwrap();
        let rows = doc["env"]["staging"]["d1_databases"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["database_id"].as_str(), Some("uuid-5678"));
    }

    #[test]
    fn customer_config_generation_and_promotion() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        std::fs::write(manager.active_path(), "name = \"old\"").unwrap();

        let path = manager
            .generate_customer_config(
                "example.com",
                &CustomerConfigOptions {
                    account_id: Some("acct123".to_string()),
                    environment: Environment::Production,
                    worker_name: "api-example-com-data-service".to_string(),
                },
            )
            .unwrap();
        assert!(path.ends_with("wrangler.example.com.production.toml"));

        manager.copy_customer_config(&path).unwrap();
        let active = std::fs::read_to_string(manager.active_path()).unwrap();
        assert!(active.contains("zone_name = \"example.com\""));

        // The previous active config was backed up.
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
