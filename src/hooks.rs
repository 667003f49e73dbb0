//! Ingestion lifecycle hooks.
//!
//! Hooks let optional collaborators (entity linkers, indexers, notifiers)
//! observe ingestion without being able to break it: every dispatch
//! isolates failures, logging them with the hook's identity and carrying
//! on with the remaining hooks.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{Entity, EntityKind, ImportRun};

/// Observer of ingestion lifecycle events.
///
/// Implementations should be lightweight; heavy work belongs in a
/// background job triggered from the hook.
pub trait IngestionHook: Send + Sync {
    /// Identity used in logs when this hook fails.
    fn name(&self) -> &str;

    /// Called after an entity has been persisted.
    fn on_entity_created(&self, _kind: EntityKind, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    /// Called after a batch of entities has been persisted.
    fn on_batch_complete(&self, _batch: &BTreeMap<EntityKind, Vec<Entity>>) -> Result<()> {
        Ok(())
    }

    /// Called when an import run finishes successfully.
    fn on_import_complete(&self, _run: &ImportRun) -> Result<()> {
        Ok(())
    }
}

/// Registration-order-preserving hook dispatcher.
///
/// Explicitly constructed by the composition root and shared behind an
/// `Arc`; registration happens before runs start.
pub struct HookRegistry {
    hooks: Vec<Arc<dyn IngestionHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Register a hook. Idempotent by hook name.
    pub fn register(&mut self, hook: Arc<dyn IngestionHook>) {
        if self.hooks.iter().any(|h| h.name() == hook.name()) {
            return;
        }
        debug!(hook = hook.name(), "registered ingestion hook");
        self.hooks.push(hook);
    }

    pub fn unregister(&mut self, name: &str) {
        self.hooks.retain(|h| h.name() != name);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn notify_entity_created(&self, kind: EntityKind, entity: &Entity) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_entity_created(kind, entity) {
                warn!(hook = hook.name(), error = %e, "on_entity_created hook failed");
            }
        }
    }

    pub fn notify_batch_complete(&self, batch: &BTreeMap<EntityKind, Vec<Entity>>) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_batch_complete(batch) {
                warn!(hook = hook.name(), error = %e, "on_batch_complete hook failed");
            }
        }
    }

    pub fn notify_import_complete(&self, run: &ImportRun) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_import_complete(run) {
                warn!(hook = hook.name(), error = %e, "on_import_complete hook failed");
            }
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook that logs ingestion events. Useful during development.
pub struct LoggingHook;

impl IngestionHook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_entity_created(&self, kind: EntityKind, entity: &Entity) -> Result<()> {
        debug!(kind = %kind, id = %entity.id, "entity created");
        Ok(())
    }

    fn on_batch_complete(&self, batch: &BTreeMap<EntityKind, Vec<Entity>>) -> Result<()> {
        let counts: Vec<String> = batch
            .iter()
            .map(|(kind, entities)| format!("{}={}", kind, entities.len()))
            .collect();
        info!(batch = %counts.join(", "), "batch complete");
        Ok(())
    }

    fn on_import_complete(&self, run: &ImportRun) -> Result<()> {
        info!(
            run_id = %run.id,
            created = run.entities_created,
            updated = run.entities_updated,
            skipped = run.entities_skipped,
            failed = run.entities_failed,
            "import complete"
        );
        Ok(())
    }
}
