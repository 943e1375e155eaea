//! Core types for EntityView.
//!
//! This crate holds everything that does not depend on a particular storage
//! engine or transaction driver:
//!
//! - `View` and `FetchGroup` for partial object-graph loading
//! - `EntityState` and its lifecycle transitions
//! - `Entity` handles over the entity arena, with attribute-access gating
//! - `reference_id` for reading foreign keys without loading the target
//! - `SerializationBridge` for carrying entities across process boundaries
//! - the `Storage` trait that storage engines implement

pub mod bridge;
pub mod entity;
pub mod error;
pub mod fetch_group;
pub mod graph;
pub mod identity;
pub mod loader;
pub mod model;
pub mod reference;
pub mod row;
pub mod schema;
pub mod state;
pub mod storage;
pub mod value;
pub mod view;

pub use bridge::{ENVELOPE_FORMAT, EntityEnvelope, NodeRecord, SerializationBridge, SlotRecord};
pub use entity::Entity;
pub use error::{
    Error, ReferenceIdError, ReferenceIdErrorKind, Result, SchemaError, SchemaErrorKind,
    StateError, StorageError, StorageErrorKind, TransactionError, TransactionErrorKind,
    TypeError, UnfetchedAttributeError, UnfetchedReason,
};
pub use fetch_group::{FetchGroup, required_attributes};
pub use graph::{ContextLink, Graph, GraphRef, Node, NodeId, Slot};
pub use identity::{EntityKey, Identity};
pub use loader::Loader;
pub use model::EntityModel;
pub use reference::{ReferenceId, reference_id};
pub use row::{ColumnInfo, Row};
pub use schema::{AttributeInfo, AttributeKind, EntityMeta, Schema, SchemaBuilder};
pub use state::{EntityState, LifecycleEvent};
pub use storage::{ProjectedAttribute, Projection, Storage, TransactionId};
pub use value::Value;
pub use view::{FetchMode, View, ViewProperty};
