//! Ingester registry and generic content detection.
//!
//! The registry is an explicitly constructed service object owned by the
//! application's composition root (not a process-wide singleton): tests
//! build a fresh registry, the binary builds one at startup and shares it
//! behind an `Arc`. Registration happens before any run starts; reads are
//! lock-free afterwards.

use anyhow::Result;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::ingester::Ingester;
use crate::models::EntityKind;

/// Extension-based entity kind lookup for generic content detection.
pub fn kind_for_extension(ext: &str) -> Option<EntityKind> {
    match ext {
        // Images
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "bmp" | "tiff" | "tif"
        | "svg" => Some(EntityKind::Media),
        // Video
        "mp4" | "mov" | "avi" | "mkv" | "webm" => Some(EntityKind::Media),
        // Audio
        "mp3" | "wav" | "flac" | "m4a" | "ogg" => Some(EntityKind::Media),
        // Text / notes
        "txt" | "md" | "markdown" | "rst" => Some(EntityKind::KnowledgeNote),
        // Email
        "mbox" | "eml" => Some(EntityKind::Email),
        _ => None,
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Bucket a file or directory tree by extension into entity kind counts.
pub fn scan_extensions(path: &Path) -> BTreeMap<EntityKind, u64> {
    let mut counts = BTreeMap::new();

    if path.is_file() {
        if let Some(kind) = extension_of(path).and_then(|e| kind_for_extension(&e)) {
            counts.insert(kind, 1);
        }
    } else if path.is_dir() {
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(kind) = extension_of(entry.path()).and_then(|e| kind_for_extension(&e)) {
                *counts.entry(kind).or_insert(0) += 1;
            }
        }
    }

    counts
}

struct Registration {
    ingester: Arc<dyn Ingester>,
    matchers: Vec<GlobMatcher>,
}

/// Registry mapping source signatures (filename patterns) to ingesters.
pub struct IngesterRegistry {
    registrations: Vec<Registration>,
}

impl IngesterRegistry {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Register an ingester. Idempotent: a second registration for the
    /// same source type is ignored, preserving first-registration order.
    pub fn register(&mut self, ingester: Arc<dyn Ingester>) -> Result<()> {
        if self
            .registrations
            .iter()
            .any(|r| r.ingester.source_type() == ingester.source_type())
        {
            return Ok(());
        }

        let mut matchers = Vec::new();
        for pattern in ingester.detection_patterns() {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()?;
            matchers.push(glob.compile_matcher());
        }

        self.registrations.push(Registration { ingester, matchers });
        Ok(())
    }

    /// Remove the ingester registered for a source type.
    pub fn unregister(&mut self, source_type: crate::models::SourceType) {
        self.registrations
            .retain(|r| r.ingester.source_type() != source_type);
    }

    /// All registered ingesters, in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Ingester>> {
        self.registrations
            .iter()
            .map(|r| Arc::clone(&r.ingester))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Match the path's file name against every registered ingester's
    /// detection patterns, in registration order. First match wins.
    pub fn detect(&self, path: &Path) -> Option<Arc<dyn Ingester>> {
        let name = path.file_name()?.to_string_lossy().into_owned();

        for registration in &self.registrations {
            if registration.matchers.iter().any(|m| m.is_match(&name)) {
                return Some(Arc::clone(&registration.ingester));
            }
        }

        None
    }

    /// Extension-based detection for paths no plugin claims.
    pub fn detect_generic(&self, path: &Path) -> BTreeMap<EntityKind, u64> {
        scan_extensions(path)
    }
}

impl Default for IngesterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingester::DetectionResult;
    use crate::models::SourceType;

    struct Stub {
        source_type: SourceType,
        patterns: Vec<&'static str>,
    }

    impl Ingester for Stub {
        fn source_type(&self) -> SourceType {
            self.source_type
        }
        fn detection_patterns(&self) -> &[&str] {
            &self.patterns
        }
        fn supported_kinds(&self) -> &[EntityKind] {
            &[]
        }
        fn detect_contents(&self, _path: &Path) -> Result<DetectionResult> {
            Ok(DetectionResult::default())
        }
    }

    #[test]
    fn first_registered_wins_on_overlap() {
        let mut registry = IngesterRegistry::new();
        registry
            .register(Arc::new(Stub {
                source_type: SourceType::GoogleTakeout,
                patterns: vec!["takeout-*.zip"],
            }))
            .unwrap();
        registry
            .register(Arc::new(Stub {
                source_type: SourceType::Reddit,
                patterns: vec!["takeout-*.zip", "reddit-*.zip"],
            }))
            .unwrap();

        let matched = registry
            .detect(Path::new("/exports/Takeout-2024.zip"))
            .unwrap();
        assert_eq!(matched.source_type(), SourceType::GoogleTakeout);
    }

    #[test]
    fn detection_is_case_insensitive() {
        let mut registry = IngesterRegistry::new();
        registry
            .register(Arc::new(Stub {
                source_type: SourceType::Whatsapp,
                patterns: vec!["whatsapp*.txt"],
            }))
            .unwrap();

        assert!(registry.detect(Path::new("WhatsApp Chat.txt")).is_some());
        assert!(registry.detect(Path::new("telegram.txt")).is_none());
    }

    #[test]
    fn re_registration_is_idempotent() {
        let mut registry = IngesterRegistry::new();
        for _ in 0..3 {
            registry
                .register(Arc::new(Stub {
                    source_type: SourceType::Reddit,
                    patterns: vec!["reddit-*.zip"],
                }))
                .unwrap();
        }
        assert_eq!(registry.len(), 1);

        registry.unregister(SourceType::Reddit);
        assert!(registry.is_empty());
    }

    #[test]
    fn generic_detection_buckets_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["a.jpg", "b.JPG", "c.jpg", "notes.md", "mail.eml", "data.bin"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let registry = IngesterRegistry::new();
        let counts = registry.detect_generic(dir.path());
        assert_eq!(counts.get(&EntityKind::Media), Some(&3));
        assert_eq!(counts.get(&EntityKind::KnowledgeNote), Some(&1));
        assert_eq!(counts.get(&EntityKind::Email), Some(&1));
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn single_file_detection() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, b"x").unwrap();

        let counts = scan_extensions(&path);
        assert_eq!(counts.get(&EntityKind::Media), Some(&1));
    }
}
