//! Handles to entity instances.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, SchemaErrorKind, TypeError, UnfetchedReason};
use crate::fetch_group::FetchGroup;
use crate::graph::{Graph, GraphRef, Node, NodeId, Slot};
use crate::identity::{EntityKey, Identity};
use crate::loader::Loader;
use crate::schema::{AttributeInfo, EntityMeta};
use crate::state::EntityState;
use crate::value::Value;

/// A handle to one entity instance.
///
/// Cloning the handle does not copy the instance: every clone observes the
/// same state, fetch group and attribute values. Two handles refer to the
/// same instance when [`Entity::same_instance`] says so.
///
/// # Reads
///
/// An attribute can be read when the instance is new, when it is in the
/// fetch group, or (for untracked instances loaded without a view) when it
/// was populated by the load. Otherwise a managed instance fetches it on
/// first access; a detached one fails with
/// [`Error::UnfetchedAttribute`](crate::Error::UnfetchedAttribute).
#[derive(Clone)]
pub struct Entity {
    graph: GraphRef,
    node: NodeId,
    meta: Arc<EntityMeta>,
    key: EntityKey,
}

impl Entity {
    /// Construct a new, unmanaged instance in its own arena.
    pub fn new(meta: &Arc<EntityMeta>, id: impl Into<Identity>) -> Self {
        let id = id.into();
        let graph = GraphRef::new();
        let node = graph.with_mut(|g| {
            g.insert(Node::new(Arc::clone(meta), id.clone(), EntityState::New, None))
        });
        Self {
            graph,
            node,
            meta: Arc::clone(meta),
            key: EntityKey::new(meta.name(), id),
        }
    }

    /// Handle to an existing node of `graph`.
    pub fn attach(graph: &GraphRef, node: NodeId) -> Result<Self> {
        graph.with(|g| {
            let n = g.node(node)?;
            Ok(Self {
                graph: graph.clone(),
                node,
                meta: Arc::clone(n.meta()),
                key: n.key(),
            })
        })
    }

    pub fn graph(&self) -> &GraphRef {
        &self.graph
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn meta(&self) -> &Arc<EntityMeta> {
        &self.meta
    }

    pub fn entity_name(&self) -> &str {
        self.meta.name()
    }

    pub fn id(&self) -> &Identity {
        &self.key.id
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    fn inspect<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.graph.with(|g| g.node(self.node).ok().map(f))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        // A node missing from its arena cannot be reached by any context.
        self.inspect(Node::state).unwrap_or(EntityState::Detached)
    }

    pub fn is_new(&self) -> bool {
        self.state().is_new()
    }

    pub fn is_managed(&self) -> bool {
        self.state().is_managed()
    }

    pub fn is_detached(&self) -> bool {
        self.state().is_detached()
    }

    pub fn is_removed(&self) -> bool {
        self.state().is_removed()
    }

    /// Snapshot of the fetch group; `None` for untracked instances.
    pub fn fetch_group(&self) -> Option<FetchGroup> {
        self.inspect(|n| n.fetch_group().cloned()).flatten()
    }

    /// Whether `attribute` can be read without touching storage.
    pub fn is_loaded(&self, attribute: &str) -> bool {
        self.inspect(|n| n.is_available(attribute)).unwrap_or(false)
    }

    /// Attributes written since the instance was loaded or last flushed.
    pub fn dirty_attributes(&self) -> Vec<String> {
        self.inspect(|n| n.dirty().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn same_instance(&self, other: &Entity) -> bool {
        self.node == other.node
    }

    /// Read a scalar attribute.
    pub fn get(&self, attribute: &str) -> Result<Value> {
        if self.meta.is_identity(attribute) {
            return Ok(self.key.id.to_value());
        }
        match self.read_slot(attribute)? {
            Slot::Scalar(value) => Ok(value),
            Slot::ToOne(_) | Slot::ToMany(_) => Err(self.kind_mismatch(attribute, "scalar")),
        }
    }

    /// Read a scalar attribute converted to `T`.
    pub fn get_as<T>(&self, attribute: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(attribute)?).map_err(|e| match e {
            Error::Type(te) => Error::Type(TypeError {
                attribute: Some(format!("{}.{}", self.meta.name(), attribute)),
                ..te
            }),
            other => other,
        })
    }

    /// Read a to-one reference.
    pub fn reference(&self, attribute: &str) -> Result<Option<Entity>> {
        match self.read_slot(attribute)? {
            Slot::ToOne(Some(target)) => Entity::attach(&self.graph, target).map(Some),
            Slot::ToOne(None) => Ok(None),
            Slot::Scalar(_) | Slot::ToMany(_) => {
                Err(self.kind_mismatch(attribute, "to-one reference"))
            }
        }
    }

    /// Read a to-many collection.
    pub fn collection(&self, attribute: &str) -> Result<Vec<Entity>> {
        match self.read_slot(attribute)? {
            Slot::ToMany(targets) => targets
                .into_iter()
                .map(|t| Entity::attach(&self.graph, t))
                .collect(),
            Slot::Scalar(_) | Slot::ToOne(_) => {
                Err(self.kind_mismatch(attribute, "to-many collection"))
            }
        }
    }

    /// Write a scalar attribute.
    ///
    /// Writes are accepted in every state. On a managed instance the
    /// attribute is scheduled for the next flush.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let info = self.meta.require(attribute)?;
        if self.meta.is_identity(attribute) {
            return Err(Error::schema(
                SchemaErrorKind::ImmutableIdentity,
                format!("{} of {} cannot be changed", attribute, self.key),
            ));
        }
        if !info.is_scalar() {
            return Err(self.kind_mismatch(attribute, "scalar"));
        }
        let slot = Slot::Scalar(value.into());
        self.graph.with_mut(|g| {
            let changed = g.node_mut(self.node)?.store_written(attribute, slot);
            if changed {
                tracing::trace!(key = %self.key, attribute, "Attribute written");
            }
            Ok(())
        })
    }

    /// Write a to-one reference.
    ///
    /// When the target lives in another arena the two arenas are linked; a
    /// target belonging to a different live persistence context is rejected.
    pub fn set_reference(&self, attribute: &str, target: Option<&Entity>) -> Result<()> {
        let info = self.meta.require(attribute)?;
        let Some(expected) = info.target().filter(|_| info.is_to_one()) else {
            return Err(self.kind_mismatch(attribute, "to-one reference"));
        };
        if let Some(target) = target {
            if target.entity_name() != expected {
                return Err(Error::schema(
                    SchemaErrorKind::KindMismatch,
                    format!(
                        "{}.{} references {}, not {}",
                        self.meta.name(),
                        attribute,
                        expected,
                        target.entity_name()
                    ),
                ));
            }
            if !self.graph.same_arena(&target.graph) {
                if target.graph.is_live() && !self.graph.is_live() {
                    target.graph.absorb(&self.graph)?;
                } else {
                    self.graph.absorb(&target.graph)?;
                }
            }
        }
        let slot = Slot::ToOne(target.map(|t| t.node));
        self.graph.with_mut(|g| {
            g.node_mut(self.node)?.store_written(attribute, slot);
            Ok(())
        })
    }

    fn read_slot(&self, attribute: &str) -> Result<Slot> {
        let info = self.meta.require(attribute)?;
        self.graph.with_mut(|graph| {
            let node = graph.node(self.node)?;
            if node.is_available(attribute) {
                return Ok(current_slot(node, info));
            }

            let state = node.state();
            let frozen = node.fetch_group().is_some_and(FetchGroup::is_frozen);
            let reason = match graph.link() {
                None => Some(UnfetchedReason::NotManaged),
                Some(_) if !state.is_live() => Some(UnfetchedReason::NotManaged),
                Some(_) if frozen => Some(UnfetchedReason::Frozen),
                Some(link) if !link.lazy_loading() => Some(UnfetchedReason::LazyLoadingDisabled),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                tracing::debug!(key = %self.key, attribute, ?reason, "Unfetched attribute access");
                return Err(Error::unfetched(self.meta.name(), attribute, state, reason));
            }

            Loader::new(graph)?.load_attribute(self.node, info)?;
            Ok(current_slot(graph.node(self.node)?, info))
        })
    }

    fn kind_mismatch(&self, attribute: &str, expected: &str) -> Error {
        let actual = self
            .meta
            .attribute(attribute)
            .map_or("unknown", AttributeInfo::kind_name);
        Error::schema(
            SchemaErrorKind::KindMismatch,
            format!(
                "{}.{} is a {}, not a {}",
                self.meta.name(),
                attribute,
                actual,
                expected
            ),
        )
    }

    /// Run `f` with exclusive access to the arena holding this instance.
    pub fn with_graph<R>(&self, f: impl FnOnce(&mut Graph, NodeId) -> R) -> R {
        self.graph.with_mut(|g| f(g, self.node))
    }
}

fn current_slot(node: &Node, info: &AttributeInfo) -> Slot {
    node.slot(&info.name)
        .cloned()
        .unwrap_or_else(|| Slot::empty_for(info))
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.state())
    }
}
