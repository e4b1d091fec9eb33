//! Workspace engine: the public API over the storage backend.
//!
//! One [`Workspace`] owns the connection. Mutations run through
//! [`Workspace::mutate`], which batches audit events, dirty marks, and
//! blocked-cache invalidation into a single immediate transaction: a
//! mutation either commits with the cache consistent with the graph, or
//! rolls back leaving both unchanged.

pub mod blocked;
pub mod deps;
pub mod elements;
pub mod priority;

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Transaction, TransactionBehavior};

use crate::error::Result;
use crate::id::{IdService, IdServiceConfig};
use crate::model::EventType;
use crate::storage::backend::{self, SqliteBackend};
use crate::storage::events::{NewEvent, append_event};

/// Cache work queued by a mutation, replayed in order before commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTouch {
    /// Recompute one element's blocking state, cascading to dependents when
    /// the state flips.
    Element(String),
    /// Recompute everything waiting on this element.
    Dependents(String),
    /// The element was deleted: drop its row, then recompute dependents.
    Deleted(String),
}

/// Context for a mutation operation, tracking side effects.
pub struct MutationContext {
    pub op_name: String,
    pub actor: String,
    pub events: Vec<NewEvent>,
    pub dirty_ids: HashSet<String>,
    pub touches: Vec<CacheTouch>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
            dirty_ids: HashSet::new(),
            touches: Vec::new(),
        }
    }

    pub fn record_event(
        &mut self,
        event_type: EventType,
        element_id: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) {
        self.events.push(
            NewEvent::new(element_id, event_type, &self.actor).with_values(old_value, new_value),
        );
    }

    pub fn mark_dirty(&mut self, element_id: &str) {
        self.dirty_ids.insert(element_id.to_string());
    }

    pub fn touch(&mut self, touch: CacheTouch) {
        self.touches.push(touch);
    }
}

/// The workspace engine.
#[derive(Debug)]
pub struct Workspace {
    backend: SqliteBackend,
    ids: IdService,
}

impl Workspace {
    /// Open (or create) a workspace database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            backend: SqliteBackend::open(path)?,
            ids: IdService::default(),
        })
    }

    /// Open an in-memory workspace for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            backend: SqliteBackend::open_memory()?,
            ids: IdService::default(),
        })
    }

    /// Open with a custom identifier-service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub fn open_memory_with_ids(config: IdServiceConfig) -> Result<Self> {
        Ok(Self {
            backend: SqliteBackend::open_memory()?,
            ids: IdService::new(config),
        })
    }

    #[must_use]
    pub const fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut SqliteBackend {
        &mut self.backend
    }

    /// Current adaptive hash length, refreshing the cached element count
    /// when stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh query fails.
    pub fn hash_length(&mut self) -> Result<usize> {
        let fresh = if self.ids.needs_refresh() {
            Some(self.backend.count_elements()?)
        } else {
            None
        };
        Ok(self.ids.hash_length(fresh))
    }

    /// Identifier-service observability.
    #[must_use]
    pub fn id_stats(&self) -> crate::id::IdStats {
        self.ids.stats()
    }

    /// Force a reread of the element count.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn refresh_id_cache(&mut self) -> Result<()> {
        let count = self.backend.count_elements()?;
        self.ids.apply_refresh(count);
        Ok(())
    }

    pub(crate) fn note_element_created(&mut self) -> Result<()> {
        if self.ids.notify_create() {
            let count = self.backend.count_elements()?;
            self.ids.apply_refresh(count);
        }
        Ok(())
    }

    /// Audit events for one element, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn events_for(&self, element_id: &str, limit: usize) -> Result<Vec<crate::model::Event>> {
        crate::storage::events::events_for(self.backend.conn()?, element_id, limit)
    }

    /// Query the audit stream by element, actor, type, or time window.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn query_events(
        &self,
        filter: &crate::storage::events::EventFilter,
    ) -> Result<Vec<crate::model::Event>> {
        crate::storage::events::query_events(self.backend.conn()?, filter)
    }

    /// Execute a mutation with the transaction protocol: run the closure,
    /// append its events, write dirty marks, replay cache touches, commit.
    ///
    /// # Errors
    ///
    /// Returns the closure's error (rolling back) or a storage error.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self.backend.transaction(TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            append_event(&tx, event)?;
        }

        let dirty: Vec<String> = ctx.dirty_ids.into_iter().collect();
        backend::mark_dirty(&tx, &dirty)?;

        for touch in &ctx.touches {
            match touch {
                CacheTouch::Element(id) => {
                    blocked::invalidate_element_cascading(&tx, id)?;
                }
                CacheTouch::Dependents(id) => {
                    blocked::invalidate_dependents(&tx, id, chrono::Utc::now())?;
                }
                CacheTouch::Deleted(id) => {
                    blocked::on_element_deleted(&tx, id)?;
                }
            }
        }

        tx.commit()?;
        tracing::trace!(op = %ctx.op_name, actor = %ctx.actor, "mutation committed");
        Ok(result)
    }
}
