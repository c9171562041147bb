//! Domain resolution debugging — `armada resolve <domain>`.

use anyhow::Result;
use console::style;
use std::path::Path;

pub fn run_resolve(working_dir: &Path, domain: &str) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let resolver = super::build_resolver(&config);

    let resolved = resolver.resolve(domain)?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);

    let report = resolver.validate_prerequisites(domain);
    if !report.issues.is_empty() {
        println!("{}", style("issues:").red().bold());
        for issue in &report.issues {
            println!("  {issue}");
        }
    }
    if !report.warnings.is_empty() {
        println!("{}", style("warnings:").yellow().bold());
        for warning in &report.warnings {
            println!("  {warning}");
        }
    }
    println!("root domain: {}", resolver.root_domain(domain));
    Ok(())
}
