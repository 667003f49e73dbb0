//! Core data models for the ingestion pipeline.
//!
//! These types represent the import provenance records (sources and runs)
//! and the generic entity shape that flows from ingesters into SQLite.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Kinds of entities that can be ingested and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Media,
    ChatMessage,
    Email,
    SocialPost,
    SocialComment,
    KnowledgeNote,
    CalendarEvent,
    Transaction,
    LocationVisit,
    BrowsingHistory,
    Bookmark,
    Person,
}

impl EntityKind {
    /// All known entity kinds, in stable order.
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Media,
        EntityKind::ChatMessage,
        EntityKind::Email,
        EntityKind::SocialPost,
        EntityKind::SocialComment,
        EntityKind::KnowledgeNote,
        EntityKind::CalendarEvent,
        EntityKind::Transaction,
        EntityKind::LocationVisit,
        EntityKind::BrowsingHistory,
        EntityKind::Bookmark,
        EntityKind::Person,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Media => "media",
            EntityKind::ChatMessage => "chat_message",
            EntityKind::Email => "email",
            EntityKind::SocialPost => "social_post",
            EntityKind::SocialComment => "social_comment",
            EntityKind::KnowledgeNote => "knowledge_note",
            EntityKind::CalendarEvent => "calendar_event",
            EntityKind::Transaction => "transaction",
            EntityKind::LocationVisit => "location_visit",
            EntityKind::BrowsingHistory => "browsing_history",
            EntityKind::Bookmark => "bookmark",
            EntityKind::Person => "person",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown string code into an enum.
#[derive(Debug, Error)]
#[error("unknown {what}: '{value}'")]
pub struct UnknownCode {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for EntityKind {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownCode {
                what: "entity kind",
                value: s.to_string(),
            })
    }
}

/// Supported data source families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceType {
    GoogleTakeout,
    Reddit,
    Whatsapp,
    Ynab,
    /// Bulk import of loose files (images, markdown, mbox).
    Generic,
    /// User-created content, not tied to an export.
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::GoogleTakeout => "google_takeout",
            SourceType::Reddit => "reddit",
            SourceType::Whatsapp => "whatsapp",
            SourceType::Ynab => "ynab",
            SourceType::Generic => "generic",
            SourceType::Manual => "manual",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_takeout" => Ok(SourceType::GoogleTakeout),
            "reddit" => Ok(SourceType::Reddit),
            "whatsapp" => Ok(SourceType::Whatsapp),
            "ynab" => Ok(SourceType::Ynab),
            "generic" => Ok(SourceType::Generic),
            "manual" => Ok(SourceType::Manual),
            other => Err(UnknownCode {
                what: "source type",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of an import run. Only moves forward:
/// `Pending -> Running -> {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Running => "running",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }

    /// True once the run has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ImportStatus::Completed | ImportStatus::Failed | ImportStatus::Cancelled
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImportStatus::Pending),
            "running" => Ok(ImportStatus::Running),
            "completed" => Ok(ImportStatus::Completed),
            "failed" => Ok(ImportStatus::Failed),
            "cancelled" => Ok(ImportStatus::Cancelled),
            other => Err(UnknownCode {
                what: "import status",
                value: other.to_string(),
            }),
        }
    }
}

/// Registered data source for imports.
///
/// One record per distinct data origin (e.g. a Takeout archive path or a
/// Reddit account). Long-lived; runs reference it via `source_id`.
#[derive(Debug, Clone)]
pub struct ImportSource {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub name: String,
    pub description: Option<String>,
    /// JSON-encoded source configuration.
    pub config: Option<String>,
    pub is_active: bool,
}

impl ImportSource {
    pub fn new(source_type: SourceType, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_type,
            name: name.into(),
            description: None,
            config: None,
            is_active: true,
        }
    }
}

/// One execution of the pipeline against a path.
///
/// Created at run start, mutated by the progress tracker, finalized on
/// completion, failure, or cancellation. Owned by a single coordinator
/// invocation; never mutated by two runs concurrently.
#[derive(Debug, Clone)]
pub struct ImportRun {
    pub id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ImportStatus,
    pub error_message: Option<String>,
    pub entities_found: u64,
    pub entities_created: u64,
    pub entities_updated: u64,
    pub entities_skipped: u64,
    pub entities_failed: u64,
    pub progress_current: u64,
    pub progress_total: Option<u64>,
    pub current_file: Option<String>,
    /// SHA-256 of the source file, when the input was a regular file.
    pub file_hash: Option<String>,
}

impl ImportRun {
    pub fn new(source_id: impl Into<String>, file_hash: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ImportStatus::Pending,
            error_message: None,
            entities_found: 0,
            entities_created: 0,
            entities_updated: 0,
            entities_skipped: 0,
            entities_failed: 0,
            progress_current: 0,
            progress_total: None,
            current_file: None,
            file_hash,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Progress percentage, if the total is known and non-zero.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.progress_total {
            Some(total) if total > 0 => {
                Some((self.progress_current as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

/// Generic persisted entity produced by an ingester.
///
/// Concrete entity schemas live behind the persistence layer; the pipeline
/// only depends on this shape. `content_hash` drives per-entity dedup
/// within a kind; entities without a hash are never considered duplicates.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub source_type: SourceType,
    pub source_id: Option<String>,
    pub content_hash: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub body: Option<String>,
    /// Filesystem reference for media entities.
    pub media_path: Option<String>,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(kind: EntityKind, source_type: SourceType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source_type,
            source_id: None,
            content_hash: None,
            occurred_at: None,
            title: None,
            body: None,
            media_path: None,
            metadata_json: "{}".to_string(),
            created_at: Utc::now(),
        }
    }
}
