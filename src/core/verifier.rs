//! Backup manifest: one BLAKE3 digest per artifact, written at the end of
//! a backup and optionally re-checked before a restore.

use crate::errors::{Result, StorageError};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use tracing::{debug, info};

pub const MANIFEST_NAME: &str = "manifest.blake3";

/// Digest every artifact in the (flat) backup directory and write the
/// manifest beside them. Lines are `<hex>  <name>`, sorted by name.
pub fn write_manifest(backup_dir: &Path) -> Result<()> {
    let mut names: Vec<String> = std::fs::read_dir(backup_dir)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != MANIFEST_NAME)
        .collect();
    names.sort();

    let mut manifest = String::new();
    for name in &names {
        let hash = hash_file(&backup_dir.join(name))
            .map_err(|e| StorageError::Checksum(format!("cannot digest {name}: {e}")))?;
        manifest.push_str(&format!("{}  {name}\n", hash.to_hex()));
    }

    let mut file = std::fs::File::create(backup_dir.join(MANIFEST_NAME))
        .map_err(|e| StorageError::Checksum(format!("cannot write manifest: {e}")))?;
    file.write_all(manifest.as_bytes())
        .map_err(|e| StorageError::Checksum(format!("cannot write manifest: {e}")))?;

    info!(files = names.len(), "manifest written");
    Ok(())
}

/// Re-digest every file named in the manifest. Any missing or altered
/// artifact fails the check; extra files are ignored.
pub fn check_manifest(backup_dir: &Path) -> Result<()> {
    let manifest = std::fs::File::open(backup_dir.join(MANIFEST_NAME))
        .map_err(|e| StorageError::Checksum(format!("cannot open manifest: {e}")))?;

    let mut checked = 0usize;
    for line in BufReader::new(manifest).lines() {
        let line = line.map_err(|e| StorageError::Checksum(e.to_string()))?;
        let Some((expected, name)) = line.split_once("  ") else {
            return Err(StorageError::Checksum(format!("malformed line: {line}")));
        };

        debug!(file = name, "verifying digest");
        let actual = hash_file(&backup_dir.join(name))
            .map_err(|_| StorageError::Checksum(format!("{name} is missing")))?;
        if actual.to_hex().as_str() != expected {
            return Err(StorageError::Checksum(format!("{name} does not match")));
        }
        checked += 1;
    }

    info!(files = checked, "manifest verified");
    Ok(())
}

/// Streamed BLAKE3 over one file; the buffer keeps large shards cheap.
fn hash_file(path: &Path) -> std::io::Result<blake3::Hash> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 128 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot.img"), b"kernel").unwrap();
        std::fs::write(dir.path().join("system.ext4.tar.a"), b"archive").unwrap();

        write_manifest(dir.path()).unwrap();
        check_manifest(dir.path()).unwrap();
    }

    #[test]
    fn altered_artifact_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot.img"), b"kernel").unwrap();
        write_manifest(dir.path()).unwrap();

        std::fs::write(dir.path().join("boot.img"), b"tampered").unwrap();
        let err = check_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Checksum(_)));
        assert!(err.to_string().contains("boot.img"));
    }

    #[test]
    fn missing_artifact_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cache.ext4.tar.a"), b"archive").unwrap();
        write_manifest(dir.path()).unwrap();

        std::fs::remove_file(dir.path().join("cache.ext4.tar.a")).unwrap();
        assert!(check_manifest(dir.path()).is_err());
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_manifest(dir.path()).is_err());
    }
}
