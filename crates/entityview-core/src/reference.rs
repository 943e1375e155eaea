//! Reading the identity of a referenced entity without loading it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::entity::Entity;
use crate::error::{Error, ReferenceIdError, ReferenceIdErrorKind, SchemaErrorKind};
use crate::graph::Slot;
use crate::identity::Identity;
use crate::loader::Loader;

/// Identity of the target of a to-one reference, as seen by its owner.
///
/// `is_loaded` tells whether the reference attribute is part of the owner's
/// fetch group. Only a loaded reference id has a meaningful value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceId {
    entity: String,
    attribute: String,
    loaded: bool,
    value: Option<Identity>,
}

impl ReferenceId {
    fn loaded(entity: &Entity, attribute: &str, value: Option<Identity>) -> Self {
        Self {
            entity: entity.entity_name().to_string(),
            attribute: attribute.to_string(),
            loaded: true,
            value,
        }
    }

    fn not_loaded(entity: &Entity, attribute: &str) -> Self {
        Self {
            entity: entity.entity_name().to_string(),
            attribute: attribute.to_string(),
            loaded: false,
            value: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The referenced identity; `Ok(None)` for a loaded null reference.
    pub fn value(&self) -> Result<Option<&Identity>> {
        if !self.loaded {
            return Err(Error::ReferenceId(ReferenceIdError {
                kind: ReferenceIdErrorKind::NotLoaded,
                entity: self.entity.clone(),
                attribute: self.attribute.clone(),
            }));
        }
        Ok(self.value.as_ref())
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.loaded, &self.value) {
            (false, _) => write!(f, "{}.{} (not loaded)", self.entity, self.attribute),
            (true, None) => write!(f, "{}.{} -> null", self.entity, self.attribute),
            (true, Some(id)) => write!(f, "{}.{} -> {}", self.entity, self.attribute, id),
        }
    }
}

/// Identity of the entity referenced by `attribute` of `entity`.
///
/// For tracked instances (those with a fetch group) the answer never touches
/// storage: a reference outside the fetch group yields a not-loaded result.
/// Untracked instances must be managed; their foreign key is read from
/// storage when the reference has not been fetched yet.
pub fn reference_id(entity: &Entity, attribute: &str) -> Result<ReferenceId> {
    let info = entity.meta().require(attribute)?;
    if !info.is_to_one() {
        return Err(Error::schema(
            SchemaErrorKind::KindMismatch,
            format!(
                "{}.{} is not a to-one reference",
                entity.entity_name(),
                attribute
            ),
        ));
    }

    entity.with_graph(|graph, node_id| {
        let node = graph.node(node_id)?;
        let target = match node.slot(attribute) {
            Some(Slot::ToOne(Some(t))) => Some(graph.node(*t)?.id().clone()),
            _ => None,
        };

        if let Some(group) = node.fetch_group() {
            return Ok(if group.contains(attribute) {
                ReferenceId::loaded(entity, attribute, target)
            } else {
                ReferenceId::not_loaded(entity, attribute)
            });
        }

        if !node.state().is_live() || graph.link().is_none() {
            return Err(Error::ReferenceId(ReferenceIdError {
                kind: ReferenceIdErrorKind::Untracked,
                entity: entity.entity_name().to_string(),
                attribute: attribute.to_string(),
            }));
        }
        if node.is_available(attribute) {
            return Ok(ReferenceId::loaded(entity, attribute, target));
        }
        let fk = Loader::new(graph)?.foreign_key(node_id, info)?;
        Ok(ReferenceId::loaded(entity, attribute, fk))
    })
}
