//! Flush ordering and execution.
//!
//! Pending changes are written in three phases:
//! - INSERT parent-first (an instance is inserted after every pending
//!   instance it references)
//! - UPDATE of dirty attributes only
//! - DELETE child-first (an instance is deleted before every pending
//!   deletion it references)
//!
//! Updates run between the two so that a reference moved away from a row
//! scheduled for deletion no longer blocks that deletion.

use std::collections::HashSet;
use std::sync::Arc;

use entityview_core::{
    EntityKey, EntityMeta, Error, NodeId, Result, Storage, StorageErrorKind, TransactionErrorKind,
    TransactionId, Value,
};

/// One row-level write.
#[derive(Debug, Clone)]
pub struct RowWrite {
    /// Arena node the write came from.
    pub node: NodeId,
    pub meta: Arc<EntityMeta>,
    pub key: EntityKey,
    /// Attribute values to write; empty for deletes.
    pub values: Vec<(String, Value)>,
    /// Other nodes this row references through to-one attributes.
    pub depends_on: Vec<NodeId>,
}

/// A pending storage operation.
#[derive(Debug, Clone)]
pub enum PendingOp {
    Insert(RowWrite),
    Update(RowWrite),
    Delete(RowWrite),
}

impl PendingOp {
    pub fn write(&self) -> &RowWrite {
        match self {
            PendingOp::Insert(w) | PendingOp::Update(w) | PendingOp::Delete(w) => w,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.write().key
    }

    pub fn node(&self) -> NodeId {
        self.write().node
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert(_))
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete(_))
    }
}

/// Orders pending operations by their reference dependencies.
#[derive(Debug, Default)]
pub struct FlushOrderer;

impl FlushOrderer {
    pub fn new() -> Self {
        Self
    }

    /// Split `ops` into a [`FlushPlan`].
    ///
    /// Ordering is stable: independent operations keep their submission
    /// order. Fails when pending inserts reference each other in a cycle.
    pub fn order(&self, ops: Vec<PendingOp>) -> Result<FlushPlan> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for op in ops {
            match op {
                PendingOp::Insert(_) => inserts.push(op),
                PendingOp::Update(_) => updates.push(op),
                PendingOp::Delete(_) => deletes.push(op),
            }
        }

        let inserts = topological(inserts).map_err(|stuck| {
            Error::transaction(
                TransactionErrorKind::DependencyCycle,
                format!(
                    "pending inserts reference each other in a cycle: {}",
                    stuck.join(", ")
                ),
            )
        })?;

        // Deletes run against the reversed dependency order; a cycle among
        // deletions is left to the storage engine to accept or reject.
        let deletes = match topological(deletes.clone()) {
            Ok(mut ordered) => {
                ordered.reverse();
                ordered
            }
            Err(_) => deletes,
        };

        Ok(FlushPlan {
            inserts,
            updates,
            deletes,
        })
    }
}

/// Stable Kahn ordering: every op comes after the ops it depends on.
/// On a cycle, returns the keys of the ops that could not be placed.
fn topological(ops: Vec<PendingOp>) -> std::result::Result<Vec<PendingOp>, Vec<String>> {
    let members: HashSet<NodeId> = ops.iter().map(PendingOp::node).collect();
    let mut placed: HashSet<NodeId> = HashSet::new();
    let mut remaining = ops;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|op| {
            op.write()
                .depends_on
                .iter()
                .all(|d| *d == op.node() || !members.contains(d) || placed.contains(d))
        });
        match ready {
            Some(i) => {
                let op = remaining.remove(i);
                placed.insert(op.node());
                ordered.push(op);
            }
            None => return Err(remaining.iter().map(|op| op.key().to_string()).collect()),
        }
    }
    Ok(ordered)
}

/// Ordered operations ready for execution.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (arena order).
    pub updates: Vec<PendingOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Execute the plan inside storage transaction `tx`.
    #[tracing::instrument(level = "debug", skip(self, storage))]
    pub fn execute(&self, storage: &dyn Storage, tx: TransactionId) -> Result<FlushResult> {
        tracing::debug!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in &self.inserts {
            let w = op.write();
            tracing::trace!(key = %w.key, "INSERT");
            storage.insert(tx, &w.meta, &w.key.id, &w.values)?;
            result.inserted += 1;
        }

        for op in &self.updates {
            let w = op.write();
            tracing::trace!(key = %w.key, attributes = w.values.len(), "UPDATE");
            let affected = storage.update(tx, &w.meta, &w.key.id, &w.values)?;
            if affected == 0 {
                return Err(Error::storage(
                    StorageErrorKind::NotFound,
                    format!("{} no longer exists in storage", w.key),
                ));
            }
            result.updated += 1;
        }

        for op in &self.deletes {
            let w = op.write();
            tracing::trace!(key = %w.key, "DELETE");
            let affected = storage.delete(tx, &w.meta, &w.key.id)?;
            if affected == 0 {
                tracing::warn!(key = %w.key, "DELETE affected no rows");
                continue;
            }
            result.deleted += 1;
        }

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }
}

/// Row counts written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
