//! Auto-detection of data source types for ingestion.
//!
//! Discovery is the read-only probing phase: it answers "what entity
//! kinds, how many, via which ingester, does this path contain?" without
//! importing anything. Any archive extraction performed here is scoped to
//! the discovery call; the full import re-extracts, trading duplicated
//! work for never leaking temp-directory lifetimes across call boundaries.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::archive::{extracted, Extracted};
use crate::ingester::Ingester;
use crate::models::EntityKind;
use crate::registry::IngesterRegistry;

/// Result of discovering what can be ingested from a path.
pub struct DiscoveryResult {
    /// Matched ingester, or None for generic sources.
    pub ingester: Option<Arc<dyn Ingester>>,
    /// True if no specific ingester pattern matched.
    pub is_generic: bool,
    /// Entity kinds found, with counts.
    pub available_entities: BTreeMap<EntityKind, u64>,
    /// Original path provided.
    pub source_path: PathBuf,
    /// Where contents were inspected during discovery. For archives this
    /// directory is already removed by the time discovery returns; it is
    /// informational only.
    pub extract_path: Option<PathBuf>,
    /// Additional metadata from the ingester's detection pass.
    pub metadata: BTreeMap<String, String>,
}

impl DiscoveryResult {
    pub fn total_entities(&self) -> u64 {
        self.available_entities.values().sum()
    }

    pub fn has_content(&self) -> bool {
        !self.available_entities.is_empty()
    }
}

/// Auto-detect what kind of export a file or directory is.
///
/// 1. If the path is an archive, extract it to a scratch directory.
/// 2. Match the file name against all registered detection patterns.
/// 3. On a match, call the ingester's `detect_contents` on the contents.
/// 4. Otherwise fall back to generic extension scanning.
///
/// Fails if the path does not exist (`ArchiveError::NotFound`).
pub fn discover(registry: &IngesterRegistry, path: &Path) -> Result<DiscoveryResult> {
    info!(path = %path.display(), "discovering content");

    let ingester = registry.detect(path);

    let content = extracted(path)?;
    let extract_path = match &content {
        Extracted::Archive(archive) => Some(archive.extract_path.clone()),
        Extracted::Original(_) => None,
    };

    match ingester {
        Some(ingester) => {
            info!(source_type = %ingester.source_type(), "detected source type");
            let detection = ingester.detect_contents(content.path())?;
            Ok(DiscoveryResult {
                ingester: Some(ingester),
                is_generic: false,
                available_entities: detection.entity_counts,
                source_path: path.to_path_buf(),
                extract_path,
                metadata: detection.metadata,
            })
        }
        None => {
            info!("no source pattern matched, trying generic detection");
            let available_entities = registry.detect_generic(content.path());
            Ok(DiscoveryResult {
                ingester: None,
                is_generic: true,
                available_entities,
                source_path: path.to_path_buf(),
                extract_path,
                metadata: BTreeMap::new(),
            })
        }
    }
}

/// Catalogue entry for one registered data source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source_type: String,
    pub entity_kinds: Vec<String>,
    pub instructions: String,
}

/// List all registered data sources and their acquisition instructions.
pub fn list_sources(registry: &IngesterRegistry) -> Vec<SourceInfo> {
    registry
        .all()
        .iter()
        .map(|ingester| SourceInfo {
            source_type: ingester.source_type().to_string(),
            entity_kinds: ingester
                .supported_kinds()
                .iter()
                .map(|k| k.to_string())
                .collect(),
            instructions: ingester.instructions().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_over_plain_directory_is_generic() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.md"), b"# x").unwrap();

        let registry = IngesterRegistry::new();
        let result = discover(&registry, dir.path()).unwrap();
        assert!(result.is_generic);
        assert!(result.ingester.is_none());
        assert_eq!(result.total_entities(), 2);
        assert!(result.has_content());
        assert_eq!(result.extract_path, None);
    }

    #[test]
    fn discovery_of_missing_path_fails() {
        let registry = IngesterRegistry::new();
        assert!(discover(&registry, Path::new("/no/such/export")).is_err());
    }

    #[test]
    fn empty_directory_has_no_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = IngesterRegistry::new();
        let result = discover(&registry, dir.path()).unwrap();
        assert!(!result.has_content());
    }
}
