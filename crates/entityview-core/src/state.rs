//! Entity lifecycle states.
//!
//! ```text
//!            persist                 commit / rollback
//!   New ───────────────► Managed ─────────────────────► Detached
//!    ▲                    │  ▲                             │
//!    │ rollback           │  │ merge (new instance)        │
//!    │ (persisted here)   │  └─────────────────────────────┘
//!    │                    │ remove
//!    │                    ▼
//!    └──────────────── Removed ──── commit / rollback ───► Detached
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// Lifecycle state of one entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Constructed by application code, not registered with a persistence context.
    New,
    /// Registered with a live persistence context.
    Managed,
    /// Its persistence context ended, or it crossed a serialization boundary.
    Detached,
    /// Marked for deletion inside a live persistence context.
    Removed,
}

/// Events that drive [`EntityState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Persist,
    Remove,
    /// Reconcile a detached instance; yields the state of the produced instance.
    Merge,
    /// Transaction committed.
    Commit,
    /// Transaction rolled back. `persisted_here` is true for instances that
    /// were made managed by `persist` inside the ending context.
    Rollback { persisted_here: bool },
    /// Instance restored on the far side of a serialization boundary.
    Deserialize,
}

impl LifecycleEvent {
    pub const fn name(self) -> &'static str {
        match self {
            LifecycleEvent::Persist => "persist",
            LifecycleEvent::Remove => "remove",
            LifecycleEvent::Merge => "merge",
            LifecycleEvent::Commit => "commit",
            LifecycleEvent::Rollback { .. } => "roll back",
            LifecycleEvent::Deserialize => "deserialize",
        }
    }
}

impl EntityState {
    pub const fn is_new(self) -> bool {
        matches!(self, EntityState::New)
    }

    pub const fn is_managed(self) -> bool {
        matches!(self, EntityState::Managed)
    }

    pub const fn is_detached(self) -> bool {
        matches!(self, EntityState::Detached)
    }

    pub const fn is_removed(self) -> bool {
        matches!(self, EntityState::Removed)
    }

    /// Registered with a live persistence context (Managed or Removed).
    pub const fn is_live(self) -> bool {
        matches!(self, EntityState::Managed | EntityState::Removed)
    }

    /// Apply `event`, returning the resulting state or an invalid-transition error.
    ///
    /// `entity` is only used to build the error message.
    pub fn apply(self, event: LifecycleEvent, entity: &str) -> Result<EntityState> {
        use EntityState::{Detached, Managed, New, Removed};
        use LifecycleEvent as E;

        let next = match (self, event) {
            (New, E::Persist) | (Managed, E::Persist) => Some(Managed),
            (Managed, E::Remove) | (Removed, E::Remove) => Some(Removed),
            (Detached, E::Merge) => Some(Managed),

            (New, E::Commit) => Some(New),
            (Managed | Removed | Detached, E::Commit) => Some(Detached),
            (New, E::Rollback { .. }) => Some(New),
            (Managed, E::Rollback { persisted_here: true }) => Some(New),
            (Managed | Removed | Detached, E::Rollback { .. }) => Some(Detached),

            (New, E::Deserialize) => Some(New),
            (Managed | Removed | Detached, E::Deserialize) => Some(Detached),

            _ => None,
        };

        next.ok_or_else(|| {
            let message = match (self, event) {
                (Detached, E::Persist) => "detached instances must be merged, not persisted",
                (Removed, E::Persist) => "instance is scheduled for removal",
                (New, E::Remove) => "instance was never persisted",
                (Detached, E::Remove) => "detached instances must be merged before removal",
                (New, E::Merge) => "new instances must be persisted, not merged",
                (Managed, E::Merge) => "instance is already managed",
                (Removed, E::Merge) => "instance is scheduled for removal",
                _ => "transition not permitted",
            };
            Error::invalid_state(event.name(), self, entity, message)
        })
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::New => "New",
            EntityState::Managed => "Managed",
            EntityState::Detached => "Detached",
            EntityState::Removed => "Removed",
        };
        f.write_str(name)
    }
}
