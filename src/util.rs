//! Shared utility functions for the armada crate.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Write a file atomically: write to a sibling temp file, then rename over
/// the destination. The rename is atomic on POSIX filesystems.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent directory: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Copy the destination aside with a timestamped suffix before it gets
/// overwritten. Returns the backup path, or `None` if the destination does
/// not exist yet.
pub fn timestamped_backup(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let backup = path.with_extension(format!(
        "{}.{}.bak",
        path.extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "cfg".to_string()),
        stamp
    ));
    std::fs::copy(path, &backup)
        .with_context(|| format!("Failed to back up {}", path.display()))?;
    Ok(Some(backup))
}

/// Encode a filesystem path into a flat file name suitable for a backup
/// directory. Separators become underscores; a leading separator is dropped.
pub fn encode_path(path: &Path) -> String {
    let flat: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect();
    flat.trim_start_matches('_').to_string()
}

/// Lowercase hex encoding of a byte slice.
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// Extract the first `https://` token from command output. Used to recover a
/// worker URL from deploy stdout.
pub fn extract_https_url(text: &str) -> Option<String> {
    let start = text.find("https://")?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == ',')
        .unwrap_or(rest.len());
    let url = rest[..end].trim_end_matches(['.', ')', ']']);
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/config.toml");
        atomic_write(&path, b"x = 1").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x = 1");
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_timestamped_backup_missing_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(timestamped_backup(&path).unwrap().is_none());
    }

    #[test]
    fn test_timestamped_backup_copies_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wrangler.toml");
        std::fs::write(&path, "name = \"w\"").unwrap();
        let backup = timestamped_backup(&path).unwrap().unwrap();
        assert!(backup.exists());
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "name = \"w\"");
    }

    #[test]
    fn test_encode_path_flattens_separators() {
        assert_eq!(
            encode_path(Path::new("/etc/app/wrangler.toml")),
            "etc_app_wrangler.toml"
        );
        assert_eq!(encode_path(Path::new("package.json")), "package.json");
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "00ff1a");
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn test_extract_https_url_first_token() {
        let out =
            "Uploading...\nPublished https://api-data-service.example.workers.dev (1.2 sec)\nDone";
        assert_eq!(
            extract_https_url(out).as_deref(),
            Some("https://api-data-service.example.workers.dev")
        );
    }

    #[test]
    fn test_extract_https_url_absent() {
        assert_eq!(extract_https_url("no urls here"), None);
    }

    #[test]
    fn test_extract_https_url_strips_trailing_punctuation() {
        assert_eq!(
            extract_https_url("see https://x.example.com."),
            Some("https://x.example.com".to_string())
        );
    }
}
