//! Storage engine abstraction.
//!
//! The persistence layer never talks to a database directly. Everything it
//! needs from one is expressed by the [`Storage`] trait:
//!
//! - projected single-entity reads restricted to the attributes a view needs
//! - inverse lookups that back to-many collections
//! - inserts, partial updates and deletes
//! - transaction begin / commit / rollback
//!
//! Calls are synchronous and may block the calling thread. Errors are
//! returned as [`Error::Storage`](crate::Error::Storage) and surfaced to the
//! caller unmodified.

use std::fmt;

use crate::Result;
use crate::identity::Identity;
use crate::row::Row;
use crate::schema::{AttributeInfo, EntityMeta};
use crate::value::Value;
use crate::view::FetchMode;

/// Handle of a storage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// One attribute requested by a projected read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedAttribute {
    pub name: String,
    pub fetch_mode: FetchMode,
    pub cacheable: bool,
}

/// Attribute restriction for a projected read.
///
/// Only scalar and to-one attributes appear in a projection; to-one
/// attributes are returned as raw foreign key values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    attributes: Vec<ProjectedAttribute>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, fetch_mode: FetchMode, cacheable: bool) {
        self.attributes.push(ProjectedAttribute {
            name: name.into(),
            fetch_mode,
            cacheable,
        });
    }

    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.push(name, FetchMode::Auto, false);
        self
    }

    pub fn attributes(&self) -> &[ProjectedAttribute] {
        &self.attributes
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// A transactional storage engine.
pub trait Storage: Send + Sync {
    /// Start a new transaction.
    fn begin(&self) -> Result<TransactionId>;

    /// Read the projected attributes of one row. `Ok(None)` when no row matches.
    fn select(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        projection: &Projection,
    ) -> Result<Option<Row>>;

    /// Identities of the rows that make up a to-many collection of `owner`.
    fn select_related(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        attribute: &AttributeInfo,
        owner: &Identity,
    ) -> Result<Vec<Identity>>;

    /// Insert a new row. `values` excludes the identity.
    fn insert(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        values: &[(String, Value)],
    ) -> Result<()>;

    /// Update the given attributes of one row. Returns the number of rows affected.
    fn update(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        values: &[(String, Value)],
    ) -> Result<u64>;

    /// Delete one row. Returns the number of rows affected.
    fn delete(&self, tx: TransactionId, entity: &EntityMeta, id: &Identity) -> Result<u64>;

    fn commit(&self, tx: TransactionId) -> Result<()>;

    fn rollback(&self, tx: TransactionId) -> Result<()>;
}
