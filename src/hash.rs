//! File and content hashing for duplicate detection.
//!
//! File-level hashes let the pipeline warn when the exact same export is
//! imported twice; content hashes let two semantically identical entities
//! from different sources dedup to one record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::IngestionStore;

/// Read buffer for streaming file hashes (1 MiB).
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compute the hex SHA-256 of a file, streaming it in fixed-size chunks.
///
/// Never loads the whole file into memory, so it is safe on multi-gigabyte
/// archives.
pub fn compute_file_hash(path: &Path) -> Result<String, HashError> {
    if !path.exists() {
        return Err(HashError::NotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(HashError::NotAFile(path.to_path_buf()));
    }

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the hex SHA-256 of in-memory content (UTF-8 bytes for strings).
pub fn compute_content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Outcome of a file-level duplicate check.
///
/// Advisory only: the caller decides whether to proceed with the import.
#[derive(Debug, Clone)]
pub struct DuplicateInfo {
    pub is_duplicate: bool,
    pub file_hash: String,
    pub existing_import_run_id: Option<String>,
    pub existing_import_date: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Check whether a file was already imported by a completed run.
///
/// Computes the file hash and looks up the most recent completed
/// `ImportRun` with the same hash.
pub async fn check_duplicate(path: &Path, store: &dyn IngestionStore) -> Result<DuplicateInfo> {
    let file_hash = compute_file_hash(path)?;

    let existing = store.latest_completed_run_with_hash(&file_hash).await?;

    if let Some(run) = existing {
        let message = format!(
            "This file was previously imported on {}. Re-importing will create \
             duplicate entities unless they have matching content hashes.",
            run.started_at.format("%Y-%m-%d %H:%M")
        );
        return Ok(DuplicateInfo {
            is_duplicate: true,
            file_hash,
            existing_import_run_id: Some(run.id),
            existing_import_date: Some(run.started_at),
            message: Some(message),
        });
    }

    Ok(DuplicateInfo {
        is_duplicate: false,
        file_hash,
        existing_import_run_id: None,
        existing_import_date: None,
        message: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_hash_is_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello shoebox")
            .unwrap();

        let a = compute_file_hash(&path).unwrap();
        let b = compute_file_hash(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_bytes_different_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let one = dir.path().join("one.bin");
        let two = dir.path().join("two.bin");
        std::fs::write(&one, b"aaa").unwrap();
        std::fs::write(&two, b"aab").unwrap();
        assert_ne!(
            compute_file_hash(&one).unwrap(),
            compute_file_hash(&two).unwrap()
        );
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = compute_file_hash(Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, HashError::NotFound(_)));
    }

    #[test]
    fn directory_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = compute_file_hash(dir.path()).unwrap_err();
        assert!(matches!(err, HashError::NotAFile(_)));
    }

    #[test]
    fn content_hash_matches_across_sources() {
        assert_eq!(
            compute_content_hash("same text"),
            compute_content_hash("same text".as_bytes())
        );
        assert_ne!(compute_content_hash("one"), compute_content_hash("two"));
    }
}
