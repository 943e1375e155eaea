//! Persistence contexts, transactions and the entity manager for EntityView.
//!
//! `entityview-session` is the **unit-of-work layer**. It owns the identity
//! map, tracks which instances are new, dirty or removed, and drives the
//! storage engine through one transaction per persistence context.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per entity identity and context.
//! - **Change tracking**: pending inserts and deletes plus per-instance dirty sets.
//! - **Transaction scope**: commit and rollback detach every live instance.
//!
//! # Example
//!
//! ```ignore
//! let persistence = Persistence::new(storage, schema);
//!
//! let mut tx = persistence.create_transaction()?;
//! let view = View::new("User").add_property("login");
//! let user = tx.entity_manager().find("User", 1, Some(&view))?;
//! tx.commit()?;
//!
//! // `user` is now detached; `login` is readable, `name` is not.
//! ```

pub mod context;
pub mod entity_manager;
pub mod flush;
pub mod unit_of_work;

pub use context::PersistenceContext;
pub use entity_manager::EntityManager;
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp, RowWrite};
pub use unit_of_work::{PendingCounts, UnitOfWork};

use std::sync::Arc;

use entityview_core::{Result, Schema, SerializationBridge, Storage};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for persistence contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Whether managed instances fetch missing attributes on first access.
    /// When off they fail like frozen instances.
    pub lazy_loading: bool,
    /// Whether merging an instance whose row no longer exists schedules an
    /// insert (otherwise the merge fails).
    pub merge_missing_as_new: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            lazy_loading: true,
            merge_missing_as_new: true,
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lazy_loading(mut self, value: bool) -> Self {
        self.lazy_loading = value;
        self
    }

    #[must_use]
    pub fn merge_missing_as_new(mut self, value: bool) -> Self {
        self.merge_missing_as_new = value;
        self
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Entry point: a storage engine and the schema it stores.
#[derive(Clone)]
pub struct Persistence {
    storage: Arc<dyn Storage>,
    schema: Arc<Schema>,
    config: PersistenceConfig,
}

impl Persistence {
    pub fn new(storage: Arc<dyn Storage>, schema: Arc<Schema>) -> Self {
        Self::with_config(storage, schema, PersistenceConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn Storage>,
        schema: Arc<Schema>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            storage,
            schema,
            config,
        }
    }

    /// Begin a storage transaction with a fresh persistence context.
    pub fn create_transaction(&self) -> Result<Transaction> {
        let context = PersistenceContext::begin(
            Arc::clone(&self.storage),
            Arc::clone(&self.schema),
            self.config,
        )?;
        Ok(Transaction { context })
    }

    /// Bridge for carrying entities of this schema across process boundaries.
    pub fn bridge(&self) -> SerializationBridge {
        SerializationBridge::new(Arc::clone(&self.schema))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("entities", &self.schema.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// One storage transaction and its persistence context.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
#[derive(Debug)]
pub struct Transaction {
    context: PersistenceContext,
}

impl Transaction {
    pub fn entity_manager(&mut self) -> EntityManager<'_> {
        EntityManager::new(&mut self.context)
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn is_active(&self) -> bool {
        self.context.is_active()
    }

    /// Flush, commit and detach every live instance.
    pub fn commit(mut self) -> Result<()> {
        self.context.commit()
    }

    /// Roll back; instances persisted here become new again, the rest detach.
    pub fn rollback(mut self) -> Result<()> {
        self.context.rollback()
    }

    /// Commit and continue with the same identity map in a new transaction.
    pub fn commit_retaining(&mut self) -> Result<()> {
        self.context.commit_retaining()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.context.is_active() {
            return;
        }
        tracing::debug!(context = self.context.id(), "Rolling back unfinished transaction");
        if let Err(e) = self.context.rollback() {
            tracing::warn!(
                context = self.context.id(),
                error = %e,
                "Rollback of unfinished transaction failed"
            );
        }
    }
}

// ============================================================================
// Debug Info
// ============================================================================

/// Snapshot of a persistence context, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDebugInfo {
    /// Instances in the identity map.
    pub managed: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    /// Managed instances with unflushed writes.
    pub pending_dirty: usize,
    /// Whether the storage transaction is still open.
    pub active: bool,
}

impl ContextDebugInfo {
    pub fn of(context: &PersistenceContext) -> Self {
        let pending = context.pending_counts();
        Self {
            managed: context.managed_count(),
            pending_new: pending.new,
            pending_delete: pending.deleted,
            pending_dirty: context.dirty_count(),
            active: context.is_active(),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
