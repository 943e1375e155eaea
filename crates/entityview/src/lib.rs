//! EntityView: partial object-graph loading and entity lifecycle tracking.
//!
//! Application code declares a [`View`] naming the attributes it needs,
//! finds entities through it, and gets back instances that remember what
//! was loaded. Reading anything else either fetches it on demand (while the
//! instance is managed) or fails deterministically (once it is detached).
//! That knowledge survives commit, rollback and serialization.
//!
//! # Quick Start
//!
//! ```ignore
//! use entityview::prelude::*;
//!
//! let persistence = Persistence::new(storage, schema);
//!
//! let view = View::new("User")
//!     .add_property("login")
//!     .add_reference("group", View::new("Group"));
//!
//! let mut tx = persistence.create_transaction()?;
//! let user = tx.entity_manager().find("User", 1, Some(&view))?.unwrap();
//! tx.commit()?;
//!
//! assert!(user.is_detached());
//! user.get("login")?;                       // loaded
//! assert!(user.get("name").is_err());       // never fetched
//! let group = reference_id(&user, "group")?; // foreign key, no load
//! ```
//!
//! # Crates
//!
//! - `entityview-core`: views, fetch groups, states, the entity arena,
//!   reference ids and the serialization bridge
//! - `entityview-session`: persistence contexts, transactions, flush
//! - `entityview-memory`: a transactional in-memory storage engine

pub use entityview_core::{
    AttributeInfo, AttributeKind, ENVELOPE_FORMAT, Entity, EntityEnvelope, EntityKey, EntityMeta,
    EntityModel, EntityState, Error, FetchGroup, FetchMode, Identity, LifecycleEvent, NodeRecord,
    Projection, ReferenceId, ReferenceIdErrorKind, Result, Row, Schema, SchemaBuilder,
    SchemaErrorKind, SerializationBridge, SlotRecord, Storage, StorageErrorKind,
    TransactionErrorKind, TransactionId, UnfetchedReason, Value, View, ViewProperty,
    entity_model, reference_id,
};

pub use entityview_session::{
    ContextDebugInfo, EntityManager, FlushResult, PendingCounts, Persistence, PersistenceConfig,
    PersistenceContext, Transaction,
};

pub use entityview_memory::{MemoryStorage, StorageStats};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entityview::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Core types
        Entity,
        EntityManager,
        EntityModel,
        EntityState,
        Error,
        FetchGroup,
        Identity,
        // Storage
        MemoryStorage,
        // Lifecycle
        Persistence,
        PersistenceConfig,
        ReferenceId,
        Result,
        Schema,
        SerializationBridge,
        Storage,
        Transaction,
        Value,
        // Views
        View,
        entity_model,
        reference_id,
    };
}
