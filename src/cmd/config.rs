//! Configuration inspection — `armada config (show|validate|init)`.

use anyhow::Result;
use armada::config::{ArmadaToml, CONFIG_FILE};
use console::style;
use std::path::Path;

pub fn run_show(working_dir: &Path) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn run_validate(working_dir: &Path) -> Result<()> {
    let config = ArmadaToml::load_or_default(working_dir)?;
    match config.validate() {
        Ok(warnings) if warnings.is_empty() => {
            println!("{} configuration is valid", style("ok").green());
        }
        Ok(warnings) => {
            println!(
                "{} configuration is valid with {} warning(s):",
                style("ok").green(),
                warnings.len()
            );
            for warning in warnings {
                println!("  warning: {warning}");
            }
        }
        Err(err) => {
            println!("{} {err}", style("invalid:").red().bold());
            anyhow::bail!(armada::errors::OrchestratorError::Config(err.to_string()));
        }
    }
    Ok(())
}

pub fn run_init(working_dir: &Path) -> Result<()> {
    let path = ArmadaToml::path_in(working_dir);
    if path.exists() {
        println!("{CONFIG_FILE} already exists at {}", path.display());
        return Ok(());
    }
    let written = ArmadaToml::default().save(working_dir)?;
    println!("Wrote default configuration to {}", written.display());
    Ok(())
}
