//! Progress tracking for ingestion runs.
//!
//! The tracker owns the run's live counters, mirrors every mutation onto
//! the `ImportRun` record, notifies an external callback, and amortizes
//! database writes by flushing every N updates plus once at run end.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::models::ImportRun;
use crate::store::IngestionStore;

/// Progress updates between durable ImportRun writes.
pub const DEFAULT_FLUSH_INTERVAL: u32 = 100;

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl IngestionStats {
    pub fn total_processed(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }

    pub fn skipped(count: u64) -> Self {
        Self {
            skipped: count,
            ..Self::default()
        }
    }

    pub fn created(count: u64) -> Self {
        Self {
            created: count,
            ..Self::default()
        }
    }

    pub fn failed(count: u64) -> Self {
        Self {
            failed: count,
            ..Self::default()
        }
    }
}

/// Observer for real-time progress notifications.
///
/// Implementations can forward updates to job state, websockets, or a
/// terminal. Percent is `current / total * 100`, or 0 when the total is
/// unknown.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, _current: u64, _total: u64, _percent: f64) {}

    fn on_file_change(&self, _filename: &str) {}

    fn on_stats_update(&self, _stats: &IngestionStats) {}
}

/// No-op callback used when nothing is listening.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {}

/// Callback that logs progress at a fixed interval.
pub struct LoggingProgress {
    log_interval: u64,
    updates: AtomicU64,
}

impl LoggingProgress {
    pub fn new(log_interval: u64) -> Self {
        Self {
            log_interval: log_interval.max(1),
            updates: AtomicU64::new(0),
        }
    }
}

impl Default for LoggingProgress {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressCallback for LoggingProgress {
    fn on_progress(&self, current: u64, total: u64, percent: f64) {
        let n = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.log_interval == 0 {
            if total > 0 {
                info!(current, total, percent, "progress");
            } else {
                info!(current, "progress");
            }
        }
    }

    fn on_file_change(&self, filename: &str) {
        info!(file = filename, "processing");
    }
}

/// Tracks and persists ingestion progress for one run.
pub struct ProgressTracker<'a> {
    store: &'a dyn IngestionStore,
    callback: &'a dyn ProgressCallback,
    run: ImportRun,
    flush_interval: u32,
    current: u64,
    total: u64,
    stats: IngestionStats,
    updates_since_flush: u32,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(
        store: &'a dyn IngestionStore,
        run: ImportRun,
        callback: &'a dyn ProgressCallback,
        flush_interval: u32,
    ) -> Self {
        Self {
            store,
            callback,
            run,
            flush_interval: flush_interval.max(1),
            current: 0,
            total: 0,
            stats: IngestionStats::default(),
            updates_since_flush: 0,
        }
    }

    /// Set the expected total entity count.
    pub async fn set_total(&mut self, total: u64) -> Result<()> {
        self.total = total;
        self.run.progress_total = Some(total);
        self.notify_progress();
        self.maybe_flush().await
    }

    /// Advance the progress counter.
    pub async fn increment(&mut self, count: u64) -> Result<()> {
        self.current += count;
        self.run.progress_current = self.current;
        self.updates_since_flush += 1;
        self.notify_progress();
        self.maybe_flush().await
    }

    /// Record the file or section currently being processed.
    pub async fn set_current_file(&mut self, filename: &str) -> Result<()> {
        self.run.current_file = Some(filename.to_string());
        self.callback.on_file_change(filename);
        self.maybe_flush().await
    }

    /// Add to the run's statistics counters.
    pub async fn update_stats(&mut self, delta: IngestionStats) -> Result<()> {
        self.stats.created += delta.created;
        self.stats.updated += delta.updated;
        self.stats.skipped += delta.skipped;
        self.stats.failed += delta.failed;

        self.run.entities_created = self.stats.created;
        self.run.entities_updated = self.stats.updated;
        self.run.entities_skipped = self.stats.skipped;
        self.run.entities_failed = self.stats.failed;

        self.updates_since_flush += 1;
        self.callback.on_stats_update(&self.stats);
        self.maybe_flush().await
    }

    pub fn stats(&self) -> IngestionStats {
        self.stats
    }

    pub fn run(&self) -> &ImportRun {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut ImportRun {
        &mut self.run
    }

    pub fn into_run(self) -> ImportRun {
        self.run
    }

    /// Write the run's current state to the store.
    pub async fn flush(&mut self) -> Result<()> {
        self.store.update_run(&self.run).await?;
        self.updates_since_flush = 0;
        debug!(
            current = self.current,
            total = self.total,
            created = self.stats.created,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            "progress flush"
        );
        Ok(())
    }

    fn notify_progress(&self) {
        let percent = if self.total > 0 {
            (self.current as f64 / self.total as f64) * 100.0
        } else {
            0.0
        };
        self.callback.on_progress(self.current, self.total, percent);
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        if self.updates_since_flush >= self.flush_interval {
            self.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityKind, ImportSource};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingStore {
        run_updates: AtomicU32,
    }

    #[async_trait]
    impl IngestionStore for CountingStore {
        async fn insert_source(&self, _source: &ImportSource) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert_run(&self, _run: &ImportRun) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_run(&self, _run: &ImportRun) -> Result<(), StoreError> {
            self.run_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get_run(&self, _id: &str) -> Result<Option<ImportRun>, StoreError> {
            Ok(None)
        }
        async fn latest_completed_run_with_hash(
            &self,
            _file_hash: &str,
        ) -> Result<Option<ImportRun>, StoreError> {
            Ok(None)
        }
        async fn list_runs(&self, _limit: i64) -> Result<Vec<ImportRun>, StoreError> {
            Ok(Vec::new())
        }
        async fn entity_exists(
            &self,
            _kind: EntityKind,
            _content_hash: &str,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn insert_entities(&self, _entities: &[Entity]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn count_entities(&self, _kind: EntityKind) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        progress: Mutex<Vec<(u64, u64, f64)>>,
        files: Mutex<Vec<String>>,
    }

    impl ProgressCallback for RecordingCallback {
        fn on_progress(&self, current: u64, total: u64, percent: f64) {
            self.progress.lock().unwrap().push((current, total, percent));
        }
        fn on_file_change(&self, filename: &str) {
            self.files.lock().unwrap().push(filename.to_string());
        }
    }

    #[tokio::test]
    async fn callback_receives_percent() {
        let store = CountingStore::default();
        let callback = RecordingCallback::default();
        let run = ImportRun::new("src", None);

        let mut tracker = ProgressTracker::new(&store, run, &callback, 100);
        tracker.set_total(4).await.unwrap();
        tracker.increment(1).await.unwrap();
        tracker.increment(1).await.unwrap();

        let events = callback.progress.lock().unwrap();
        assert_eq!(events.last().copied(), Some((2, 4, 50.0)));
    }

    #[tokio::test]
    async fn percent_is_zero_without_total() {
        let store = CountingStore::default();
        let callback = RecordingCallback::default();
        let run = ImportRun::new("src", None);

        let mut tracker = ProgressTracker::new(&store, run, &callback, 100);
        tracker.increment(5).await.unwrap();

        let events = callback.progress.lock().unwrap();
        assert_eq!(events.last().copied(), Some((5, 0, 0.0)));
    }

    #[tokio::test]
    async fn flush_interval_amortizes_writes() {
        let store = CountingStore::default();
        let callback = NoOpProgress;
        let run = ImportRun::new("src", None);

        let mut tracker = ProgressTracker::new(&store, run, &callback, 3);
        for _ in 0..7 {
            tracker.increment(1).await.unwrap();
        }
        // 7 updates with interval 3: flushes after the 3rd and 6th.
        assert_eq!(store.run_updates.load(Ordering::SeqCst), 2);

        tracker.flush().await.unwrap();
        assert_eq!(store.run_updates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stats_mirror_onto_run() {
        let store = CountingStore::default();
        let callback = NoOpProgress;
        let run = ImportRun::new("src", None);

        let mut tracker = ProgressTracker::new(&store, run, &callback, 100);
        tracker.update_stats(IngestionStats::created(3)).await.unwrap();
        tracker.update_stats(IngestionStats::skipped(2)).await.unwrap();
        tracker.update_stats(IngestionStats::failed(1)).await.unwrap();

        let run = tracker.into_run();
        assert_eq!(run.entities_created, 3);
        assert_eq!(run.entities_skipped, 2);
        assert_eq!(run.entities_failed, 1);
    }

    #[tokio::test]
    async fn current_file_recorded() {
        let store = CountingStore::default();
        let callback = RecordingCallback::default();
        let run = ImportRun::new("src", None);

        let mut tracker = ProgressTracker::new(&store, run, &callback, 100);
        tracker.set_current_file("email entities").await.unwrap();

        assert_eq!(tracker.run().current_file.as_deref(), Some("email entities"));
        assert_eq!(
            callback.files.lock().unwrap().as_slice(),
            &["email entities".to_string()]
        );
    }
}
