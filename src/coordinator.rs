//! Ingestion coordination engine.
//!
//! Ties discovery, extraction, per-entity-kind iteration, dedup, batching,
//! persistence, progress, and hooks together into one run. The run record
//! is a forward-only state machine:
//! `Pending -> Running -> {Completed | Failed | Cancelled}`.
//!
//! Failures before the ingestion loop (missing path, run-record creation)
//! propagate to the caller for retry classification; failures inside the
//! loop are captured on the run, which is returned with FAILED status and
//! its partial counters intact.

use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::discover::{discover, DiscoveryResult};
use crate::generic::GenericIngester;
use crate::hash::compute_file_hash;
use crate::hooks::HookRegistry;
use crate::ingester::{IngestError, Ingester, IngestionFilter};
use crate::models::{Entity, EntityKind, ImportRun, ImportSource, ImportStatus, SourceType};
use crate::progress::{
    IngestionStats, NoOpProgress, ProgressCallback, ProgressTracker, DEFAULT_FLUSH_INTERVAL,
};
use crate::registry::IngesterRegistry;
use crate::store::IngestionStore;

/// Entities accumulated before a persistence flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Result of one ingestion run.
pub struct IngestionResult {
    pub import_run: ImportRun,
    pub stats: IngestionStats,
}

impl IngestionResult {
    pub fn success(&self) -> bool {
        self.import_run.status == ImportStatus::Completed
    }
}

/// Orchestrates the ingestion pipeline from detection through persistence.
pub struct IngestionCoordinator {
    store: Arc<dyn IngestionStore>,
    ingesters: Arc<IngesterRegistry>,
    hooks: Arc<HookRegistry>,
    batch_size: usize,
    flush_interval: u32,
    callback: Arc<dyn ProgressCallback>,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn IngestionStore>,
        ingesters: Arc<IngesterRegistry>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            store,
            ingesters,
            hooks,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            callback: Arc::new(NoOpProgress),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: u32) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Run the ingestion pipeline for a path.
    ///
    /// `entity_kinds` restricts the import to a subset of the discovered
    /// kinds (None imports everything found). An existing `import_source`
    /// may be supplied; otherwise one is created from the discovery.
    pub async fn run(
        &self,
        path: &Path,
        entity_kinds: Option<&BTreeSet<EntityKind>>,
        filter: Option<&IngestionFilter>,
        import_source: Option<ImportSource>,
    ) -> Result<IngestionResult> {
        info!(path = %path.display(), "starting ingestion");

        // File hash is best-effort metadata for future duplicate lookups.
        let file_hash = if path.is_file() {
            match compute_file_hash(path) {
                Ok(hash) => {
                    debug!(hash = %hash, "source file hash");
                    Some(hash)
                }
                Err(e) => {
                    warn!(error = %e, "could not hash source file");
                    None
                }
            }
        } else {
            None
        };

        let discovery = discover(&self.ingesters, path)?;
        if !discovery.has_content() {
            warn!(path = %path.display(), "no ingestable content found");
            return self.create_empty_result(path, file_hash).await;
        }

        let import_source = match import_source {
            Some(source) => source,
            None => self.create_import_source(&discovery).await?,
        };

        let run = ImportRun::new(&import_source.id, file_hash);
        self.store.insert_run(&run).await?;

        let mut tracker = ProgressTracker::new(
            self.store.as_ref(),
            run,
            self.callback.as_ref(),
            self.flush_interval,
        );

        let discovered: BTreeSet<EntityKind> =
            discovery.available_entities.keys().copied().collect();
        let selected: BTreeSet<EntityKind> = match entity_kinds {
            Some(requested) => requested.intersection(&discovered).copied().collect(),
            None => discovered,
        };

        if selected.is_empty() {
            warn!("no matching entity types to ingest");
            tracker.run_mut().status = ImportStatus::Completed;
            tracker.run_mut().completed_at = Some(Utc::now());
            tracker.flush().await?;
            return Ok(IngestionResult {
                stats: tracker.stats(),
                import_run: tracker.into_run(),
            });
        }

        let total: u64 = selected
            .iter()
            .map(|kind| discovery.available_entities.get(kind).copied().unwrap_or(0))
            .sum();
        tracker.set_total(total).await?;

        tracker.run_mut().status = ImportStatus::Running;
        tracker.run_mut().entities_found = total;
        tracker.flush().await?;

        let outcome = self
            .ingest_entities(&discovery, path, &selected, filter, &mut tracker)
            .await;

        match outcome {
            Ok(()) => {
                tracker.run_mut().status = ImportStatus::Completed;
                tracker.run_mut().completed_at = Some(Utc::now());
                self.hooks.notify_import_complete(tracker.run());
            }
            Err(e) => {
                error!(error = %e, "ingestion failed");
                tracker.run_mut().status = ImportStatus::Failed;
                tracker.run_mut().error_message = Some(format!("{:#}", e));
                tracker.run_mut().completed_at = Some(Utc::now());
            }
        }

        // Final flush: the persisted run reflects the last-known counters
        // even after a failure.
        tracker.flush().await?;

        Ok(IngestionResult {
            stats: tracker.stats(),
            import_run: tracker.into_run(),
        })
    }

    async fn create_import_source(
        &self,
        discovery: &DiscoveryResult,
    ) -> Result<ImportSource> {
        let source_type = discovery
            .ingester
            .as_ref()
            .map(|i| i.source_type())
            .unwrap_or(SourceType::Generic);

        let name = discovery
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| discovery.source_path.display().to_string());

        let mut source = ImportSource::new(source_type, name);
        source.description = Some(format!("Import from {}", discovery.source_path.display()));
        self.store.insert_source(&source).await?;
        Ok(source)
    }

    async fn create_empty_result(
        &self,
        path: &Path,
        file_hash: Option<String>,
    ) -> Result<IngestionResult> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut source = ImportSource::new(SourceType::Generic, name);
        source.description = Some(format!("Empty import from {}", path.display()));
        self.store.insert_source(&source).await?;

        let mut run = ImportRun::new(&source.id, file_hash);
        run.status = ImportStatus::Completed;
        run.completed_at = Some(Utc::now());
        self.store.insert_run(&run).await?;

        Ok(IngestionResult {
            import_run: run,
            stats: IngestionStats::default(),
        })
    }

    async fn ingest_entities(
        &self,
        discovery: &DiscoveryResult,
        path: &Path,
        kinds: &BTreeSet<EntityKind>,
        filter: Option<&IngestionFilter>,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        // Discovery's extraction was scoped to discovery; re-extract here.
        let content = archive::extracted(path)?;

        let ingester: Arc<dyn Ingester> = match &discovery.ingester {
            Some(ingester) => Arc::clone(ingester),
            None => Arc::new(GenericIngester),
        };

        let mut batch: BTreeMap<EntityKind, Vec<Entity>> = BTreeMap::new();
        let mut batch_count = 0usize;
        // Hashes accepted into the current run but possibly not yet
        // flushed; keeps duplicates within one batch from slipping past
        // the store existence check.
        let mut seen_hashes: HashSet<(EntityKind, String)> = HashSet::new();

        for kind in kinds {
            let entities = match ingester.ingest(*kind, content.path(), filter) {
                Ok(iter) => iter,
                Err(IngestError::Unsupported { .. }) => {
                    debug!(kind = %kind, "ingester does not support entity kind");
                    continue;
                }
                Err(IngestError::Other(e)) => return Err(e),
            };

            tracker
                .set_current_file(&format!("{} entities", kind))
                .await?;

            for item in entities {
                let entity = match item {
                    Ok(entity) => entity,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "failed to parse entity, skipping");
                        tracker.update_stats(IngestionStats::failed(1)).await?;
                        tracker.increment(1).await?;
                        continue;
                    }
                };

                if self.is_duplicate(&entity, &seen_hashes).await? {
                    tracker.update_stats(IngestionStats::skipped(1)).await?;
                    tracker.increment(1).await?;
                    continue;
                }

                if let Some(hash) = &entity.content_hash {
                    seen_hashes.insert((entity.kind, hash.clone()));
                }
                batch.entry(*kind).or_default().push(entity);
                batch_count += 1;

                if batch_count >= self.batch_size {
                    self.flush_batch(&mut batch, tracker).await?;
                    batch_count = 0;
                }

                tracker.increment(1).await?;
            }
        }

        if !batch.is_empty() {
            self.flush_batch(&mut batch, tracker).await?;
        }

        Ok(())
    }

    /// Per-entity dedup: an entity with no content hash always passes.
    async fn is_duplicate(
        &self,
        entity: &Entity,
        seen_hashes: &HashSet<(EntityKind, String)>,
    ) -> Result<bool> {
        let Some(hash) = &entity.content_hash else {
            return Ok(false);
        };
        if seen_hashes.contains(&(entity.kind, hash.clone())) {
            return Ok(true);
        }
        Ok(self.store.entity_exists(entity.kind, hash).await?)
    }

    async fn flush_batch(
        &self,
        batch: &mut BTreeMap<EntityKind, Vec<Entity>>,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let flat: Vec<Entity> = batch.values().flatten().cloned().collect();
        if flat.is_empty() {
            return Ok(());
        }

        self.store.insert_entities(&flat).await?;

        for (kind, entities) in batch.iter() {
            for entity in entities {
                self.hooks.notify_entity_created(*kind, entity);
            }
        }

        tracker
            .update_stats(IngestionStats::created(flat.len() as u64))
            .await?;
        self.hooks.notify_batch_complete(batch);

        batch.clear();
        Ok(())
    }
}
