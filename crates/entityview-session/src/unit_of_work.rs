//! Pending work of one persistence context.
//!
//! The unit of work records which instances were persisted (and still need
//! an INSERT) and which were removed (and need a DELETE). Updates are not
//! recorded here: every managed instance carries its own dirty set, which
//! the flush collects directly from the arena.

use std::collections::HashSet;

use entityview_core::NodeId;

/// Counts of pending operations, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
pub struct UnitOfWork {
    /// Instances awaiting INSERT, in persist order.
    pending_new: Vec<NodeId>,
    /// Instances awaiting DELETE, in remove order.
    pending_delete: Vec<NodeId>,
    /// Every instance made managed by `persist` since the transaction began.
    persisted_here: HashSet<NodeId>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_new(&mut self, node: NodeId) {
        if !self.pending_new.contains(&node) {
            self.pending_new.push(node);
        }
        self.persisted_here.insert(node);
    }

    /// Cancel a pending insert. Returns false when none was pending.
    pub fn cancel_new(&mut self, node: NodeId) -> bool {
        let before = self.pending_new.len();
        self.pending_new.retain(|n| *n != node);
        before != self.pending_new.len()
    }

    pub fn track_deleted(&mut self, node: NodeId) {
        if !self.pending_delete.contains(&node) {
            self.pending_delete.push(node);
        }
    }

    pub fn pending_new(&self) -> &[NodeId] {
        &self.pending_new
    }

    pub fn pending_delete(&self) -> &[NodeId] {
        &self.pending_delete
    }

    pub fn is_pending_new(&self, node: NodeId) -> bool {
        self.pending_new.contains(&node)
    }

    pub fn was_persisted_here(&self, node: NodeId) -> bool {
        self.persisted_here.contains(&node)
    }

    /// Forget pending operations after they reached storage.
    pub fn flushed(&mut self) {
        self.pending_new.clear();
        self.pending_delete.clear();
    }

    /// Forget everything; the storage transaction has ended.
    pub fn reset(&mut self) {
        self.flushed();
        self.persisted_here.clear();
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.pending_new.len(),
            deleted: self.pending_delete.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending_new.is_empty() && self.pending_delete.is_empty()
    }
}
