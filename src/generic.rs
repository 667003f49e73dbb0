//! Generic fallback ingester.
//!
//! Handles loose files that no source-specific plugin claims: images and
//! other media by file reference, markdown/text notes by content, and
//! mbox/eml mailboxes through the mail parsers. Used by the coordinator
//! whenever discovery reports a generic source.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::hash::{compute_content_hash, compute_file_hash};
use crate::ingester::{
    DetectionResult, EntityIter, IngestError, Ingester, IngestionFilter,
};
use crate::models::{Entity, EntityKind, SourceType};
use crate::parsers::{parse_eml, parse_mbox, MailMessage};
use crate::registry::{kind_for_extension, scan_extensions};

pub struct GenericIngester;

const GENERIC_KINDS: [EntityKind; 3] = [
    EntityKind::Media,
    EntityKind::KnowledgeNote,
    EntityKind::Email,
];

const INSTRUCTIONS: &str = "\
Point shoebox at any folder or archive of loose files. Images, video, and \
audio become media entities; text and markdown files become knowledge \
notes; mbox and eml files become emails.";

/// Files under `path` (or `path` itself) whose extension maps to `kind`,
/// in sorted order.
fn collect_files(path: &Path, kind: EntityKind) -> Vec<PathBuf> {
    let matches_kind = |p: &Path| {
        p.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .and_then(|e| kind_for_extension(&e))
            == Some(kind)
    };

    let mut files = Vec::new();
    if path.is_file() {
        if matches_kind(path) {
            files.push(path.to_path_buf());
        }
    } else {
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && matches_kind(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
    }
    files
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn relative_id(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn media_entity(path: &Path, base: &Path) -> Result<Entity> {
    let hash = compute_file_hash(path)
        .with_context(|| format!("hashing media file {}", path.display()))?;

    let mut entity = Entity::new(EntityKind::Media, SourceType::Generic);
    entity.source_id = Some(relative_id(path, base));
    entity.content_hash = Some(hash);
    entity.occurred_at = modified_at(path);
    entity.title = Some(file_name(path));
    entity.media_path = Some(path.to_string_lossy().into_owned());
    Ok(entity)
}

fn note_entity(path: &Path, base: &Path) -> Result<Entity> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading note file {}", path.display()))?;
    let body = String::from_utf8_lossy(&bytes).into_owned();

    let mut entity = Entity::new(EntityKind::KnowledgeNote, SourceType::Generic);
    entity.source_id = Some(relative_id(path, base));
    entity.content_hash = Some(compute_content_hash(&body));
    entity.occurred_at = modified_at(path);
    entity.title = Some(file_name(path));
    entity.body = Some(body);
    Ok(entity)
}

fn email_entity(msg: MailMessage, source_file: &str) -> Entity {
    // Message-id is the stable dedup key; fall back to subject + body for
    // messages without one.
    let dedup_key = match &msg.message_id {
        Some(id) => id.clone(),
        None => format!(
            "{}\n{}",
            msg.subject.as_deref().unwrap_or(""),
            msg.body_plain.as_deref().unwrap_or("")
        ),
    };

    let metadata = serde_json::json!({
        "source_file": source_file,
        "from": msg.from_address,
        "from_name": msg.from_name,
        "to": msg.to_addresses,
        "cc": msg.cc_addresses,
        "in_reply_to": msg.in_reply_to,
        "references": msg.references,
        "attachments": msg.attachments.iter().map(|a| {
            serde_json::json!({
                "filename": a.filename,
                "content_type": a.content_type,
                "size": a.size,
            })
        }).collect::<Vec<_>>(),
    });

    let mut entity = Entity::new(EntityKind::Email, SourceType::Generic);
    entity.source_id = msg.message_id.clone();
    entity.content_hash = Some(compute_content_hash(&dedup_key));
    entity.occurred_at = msg.date;
    entity.title = msg.subject.clone();
    entity.body = msg.body_plain.or(msg.body_html);
    entity.metadata_json = metadata.to_string();
    entity
}

impl GenericIngester {
    fn ingest_media(&self, path: &Path, filter: IngestionFilter) -> EntityIter {
        let base = path.to_path_buf();
        let files = collect_files(path, EntityKind::Media);
        Box::new(files.into_iter().filter_map(move |file| {
            match media_entity(&file, &base) {
                Ok(entity) if filter.matches(entity.occurred_at) => Some(Ok(entity)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }

    fn ingest_notes(&self, path: &Path, filter: IngestionFilter) -> EntityIter {
        let base = path.to_path_buf();
        let files = collect_files(path, EntityKind::KnowledgeNote);
        Box::new(files.into_iter().filter_map(move |file| {
            match note_entity(&file, &base) {
                Ok(entity) if filter.matches(entity.occurred_at) => Some(Ok(entity)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }

    fn ingest_emails(&self, path: &Path, filter: IngestionFilter) -> EntityIter {
        let files = collect_files(path, EntityKind::Email);
        Box::new(files.into_iter().flat_map(move |file| -> EntityIter {
            let name = file_name(&file);
            let is_mbox = file
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase() == "mbox")
                .unwrap_or(false);

            if is_mbox {
                match parse_mbox(&file) {
                    Ok(messages) => Box::new(messages.filter_map(move |msg| match msg {
                        Ok(msg) => {
                            let entity = email_entity(msg, &name);
                            if filter.matches(entity.occurred_at) {
                                Some(Ok(entity))
                            } else {
                                None
                            }
                        }
                        Err(e) => Some(Err(e.into())),
                    })),
                    Err(e) => Box::new(std::iter::once(Err(e.into()))),
                }
            } else {
                match parse_eml(&file) {
                    Ok(msg) => {
                        let entity = email_entity(msg, &name);
                        if filter.matches(entity.occurred_at) {
                            Box::new(std::iter::once(Ok(entity)))
                        } else {
                            Box::new(std::iter::empty())
                        }
                    }
                    Err(e) => Box::new(std::iter::once(Err(e.into()))),
                }
            }
        }))
    }
}

impl Ingester for GenericIngester {
    fn source_type(&self) -> SourceType {
        SourceType::Generic
    }

    fn detection_patterns(&self) -> &[&str] {
        // Never pattern-matched; the coordinator falls back to this
        // ingester when discovery is generic.
        &[]
    }

    fn supported_kinds(&self) -> &[EntityKind] {
        &GENERIC_KINDS
    }

    fn instructions(&self) -> &str {
        INSTRUCTIONS
    }

    fn detect_contents(&self, path: &Path) -> Result<DetectionResult> {
        Ok(DetectionResult {
            entity_counts: scan_extensions(path),
            metadata: Default::default(),
        })
    }

    fn ingest(
        &self,
        kind: EntityKind,
        path: &Path,
        filter: Option<&IngestionFilter>,
    ) -> Result<EntityIter, IngestError> {
        let filter = filter.copied().unwrap_or_default();
        match kind {
            EntityKind::Media => Ok(self.ingest_media(path, filter)),
            EntityKind::KnowledgeNote => Ok(self.ingest_notes(path, filter)),
            EntityKind::Email => Ok(self.ingest_emails(path, filter)),
            other => Err(IngestError::Unsupported {
                source_type: self.source_type(),
                kind: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn media_files_become_entities_with_file_hashes() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"pixels-a").unwrap();
        std::fs::write(dir.path().join("b.png"), b"pixels-b").unwrap();
        std::fs::write(dir.path().join("skip.bin"), b"other").unwrap();

        let entities: Vec<Entity> = GenericIngester
            .ingest(EntityKind::Media, dir.path(), None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.content_hash.is_some()));
        assert!(entities.iter().all(|e| e.media_path.is_some()));
        assert_eq!(entities[0].title.as_deref(), Some("a.jpg"));
    }

    #[test]
    fn identical_media_content_hashes_match() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.jpg"), b"same-bytes").unwrap();
        std::fs::write(dir.path().join("two.jpg"), b"same-bytes").unwrap();

        let entities: Vec<Entity> = GenericIngester
            .ingest(EntityKind::Media, dir.path(), None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].content_hash, entities[1].content_hash);
    }

    #[test]
    fn notes_carry_their_body() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("today.md"), b"# plans\nwrite tests").unwrap();

        let entities: Vec<Entity> = GenericIngester
            .ingest(EntityKind::KnowledgeNote, dir.path(), None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].body.as_deref(), Some("# plans\nwrite tests"));
        assert_eq!(
            entities[0].content_hash.as_deref(),
            Some(compute_content_hash("# plans\nwrite tests").as_str())
        );
    }

    #[test]
    fn mbox_becomes_email_entities() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("mail.mbox"),
            "From a@example.com\nFrom: a@example.com\nSubject: hi\nMessage-ID: <m1@x>\nDate: Thu, 04 Jan 2024 09:00:00 +0000\n\nbody one\n",
        )
        .unwrap();

        let entities: Vec<Entity> = GenericIngester
            .ingest(EntityKind::Email, dir.path(), None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].title.as_deref(), Some("hi"));
        assert_eq!(entities[0].source_id.as_deref(), Some("m1@x"));
        assert!(entities[0].occurred_at.is_some());
    }

    #[test]
    fn date_filter_is_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"pixels").unwrap();

        // File mtimes are "now"; a since bound in the future excludes them.
        let filter = IngestionFilter {
            since: Some(Utc::now() + Duration::days(1)),
            until: None,
        };
        let entities: Vec<Entity> = GenericIngester
            .ingest(EntityKind::Media, dir.path(), Some(&filter))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(entities.is_empty());
    }

    #[test]
    fn unsupported_kind_is_a_lookup_miss() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = GenericIngester
            .ingest(EntityKind::Transaction, dir.path(), None)
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Unsupported { .. }));
    }
}
