use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Write `bytes` to `path` so that readers observe either the old file or the new one.
///
/// The payload lands in a temp file inside the destination directory and is
/// renamed over the target only after it has been flushed to disk.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path {} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move temp file onto {}", path.display()))?;
    Ok(())
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Map an identifier onto a single safe path component.
///
/// Safe identifiers pass through unchanged. Anything that had to be rewritten
/// gets a short digest of the original appended, so `a.b` and `a_b` stay apart.
pub(crate) fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !cleaned.is_empty() && cleaned == raw {
        return cleaned;
    }
    let digest = sha256_hex(raw.as_bytes());
    match cleaned.trim_matches('_') {
        "" => digest[..8].to_string(),
        stem => format!("{stem}-{}", &digest[..8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("value.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let leftovers = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn path_component_strips_separators() {
        let escaped = path_component("../etc/passwd");
        assert!(escaped.starts_with("etc_passwd-"));
        assert!(!escaped.contains('/') && !escaped.contains('.'));
        assert_eq!(path_component("collector-1a2b"), "collector-1a2b");
        assert_eq!(path_component("  ").len(), 8);
    }

    #[test]
    fn rewritten_components_do_not_collide() {
        assert_eq!(path_component("a_b"), "a_b");
        assert_ne!(path_component("a.b"), path_component("a_b"));
        assert_ne!(path_component("a.b"), path_component("a b"));
        assert_eq!(path_component("a.b"), path_component("a.b"));
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"finsight"),
            sha256_hex(b"finsight"),
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
