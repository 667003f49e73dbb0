//! The ingester plugin contract.
//!
//! Each data-source adapter implements [`Ingester`]: content detection plus
//! typed entity iterators. Adapters register with the
//! [`IngesterRegistry`](crate::registry::IngesterRegistry) at startup; the
//! coordinator only ever talks to the trait.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::models::{Entity, EntityKind, SourceType};

/// Date-range filter applied by ingesters while producing entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionFilter {
    /// Only entities occurring on or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only entities occurring before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl IngestionFilter {
    /// Whether an entity occurring at `at` passes the filter. Entities
    /// without a timestamp always pass.
    pub fn matches(&self, at: Option<DateTime<Utc>>) -> bool {
        let Some(at) = at else { return true };
        if let Some(since) = self.since {
            if at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if at >= until {
                return false;
            }
        }
        true
    }
}

/// Result of scanning a source for available entity types.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    /// Entity kinds found, with approximate counts.
    pub entity_counts: BTreeMap<EntityKind, u64>,
    /// Free-form metadata about the detected content.
    pub metadata: BTreeMap<String, String>,
}

impl DetectionResult {
    pub fn total_entities(&self) -> u64 {
        self.entity_counts.values().sum()
    }
}

/// Lazy, finite sequence of entities from one ingest call.
///
/// Restartable by calling [`Ingester::ingest`] again. Per-item parse
/// failures surface as `Err` items; the coordinator counts them as failed
/// and keeps consuming.
pub type EntityIter = Box<dyn Iterator<Item = Result<Entity>> + Send>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The ingester does not produce this entity kind. A lookup miss, not
    /// a crash: the coordinator skips the kind with a debug note.
    #[error("{source_type} ingester does not support {kind} entities")]
    Unsupported {
        source_type: SourceType,
        kind: EntityKind,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A data-source adapter.
///
/// Implementations provide fixed metadata (source tag, filename detection
/// patterns, supported kinds, acquisition instructions), a mandatory
/// [`detect_contents`](Ingester::detect_contents), and an
/// [`ingest`](Ingester::ingest) dispatcher covering whichever entity kinds
/// the source can produce. The default `ingest` reports every kind as
/// unsupported.
pub trait Ingester: Send + Sync {
    /// Source tag recorded on everything this ingester produces.
    fn source_type(&self) -> SourceType;

    /// Glob patterns matched (case-insensitively) against a path's file
    /// name to detect this source, e.g. `"takeout-*.zip"`.
    fn detection_patterns(&self) -> &[&str];

    /// Entity kinds this ingester can produce.
    fn supported_kinds(&self) -> &[EntityKind];

    /// Human-readable instructions for obtaining this export.
    fn instructions(&self) -> &str {
        ""
    }

    /// Scan the (already extracted) source and report available entity
    /// kinds with approximate counts.
    fn detect_contents(&self, path: &Path) -> Result<DetectionResult>;

    /// Produce the entity iterator for one kind.
    ///
    /// The ingester applies the date filter itself while yielding.
    fn ingest(
        &self,
        kind: EntityKind,
        path: &Path,
        filter: Option<&IngestionFilter>,
    ) -> Result<EntityIter, IngestError> {
        let _ = (path, filter);
        Err(IngestError::Unsupported {
            source_type: self.source_type(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Inert;

    impl Ingester for Inert {
        fn source_type(&self) -> SourceType {
            SourceType::Manual
        }
        fn detection_patterns(&self) -> &[&str] {
            &[]
        }
        fn supported_kinds(&self) -> &[EntityKind] {
            &[]
        }
        fn detect_contents(&self, _path: &Path) -> Result<DetectionResult> {
            Ok(DetectionResult::default())
        }
    }

    #[test]
    fn default_ingest_is_a_lookup_miss() {
        let err = Inert
            .ingest(EntityKind::Media, Path::new("."), None)
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Unsupported { kind: EntityKind::Media, .. }));
    }

    #[test]
    fn filter_bounds_are_half_open() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let filter = IngestionFilter {
            since: Some(since),
            until: Some(until),
        };

        assert!(filter.matches(Some(since)));
        assert!(!filter.matches(Some(until)));
        assert!(!filter.matches(Some(since - chrono::Duration::seconds(1))));
        assert!(filter.matches(None));
    }
}
