//! Manual state backup — `armada backup`.

use anyhow::Result;
use armada::config::ConfigStore;
use armada::ids;
use armada::rollback::{BackupManager, BackupOptions};
use std::path::Path;

pub async fn run_backup(
    working_dir: &Path,
    include_platform: bool,
    include_database: bool,
) -> Result<()> {
    let (config, _) = super::load_config(working_dir)?;
    let platform = super::build_platform(&config, working_dir);
    let backup_root = super::backup_root(&config, working_dir);
    let run_id = ids::orchestration_id();

    let manager = BackupManager::new(
        platform,
        ConfigStore::new(working_dir),
        backup_root.clone(),
        run_id.clone(),
    );
    let (manifest, actions) = manager
        .create_state_backup(BackupOptions {
            include_platform,
            include_database,
        })
        .await?;

    println!(
        "Backed up {} file(s) under {}",
        manifest.files.len(),
        backup_root.join("configs").join(&run_id).display()
    );
    for file in &manifest.files {
        println!("  {}", file.original_path.display());
    }
    println!(
        "Manifest: {}",
        backup_root
            .join("deployments")
            .join(&run_id)
            .join("backup-manifest.json")
            .display()
    );
    println!("{} restore action(s) recorded in the manifest", actions.len());
    Ok(())
}
