//! Entity arena.
//!
//! Every entity instance lives as a [`Node`] inside an arena (a [`Graph`]).
//! References between instances are stored as [`NodeId`]s of the same arena
//! rather than owning pointers, so cyclic object graphs never form ownership
//! cycles. A persistence context owns one arena and indexes its live nodes by
//! [`EntityKey`]; that index is the identity map.
//!
//! Arenas are shared through [`GraphRef`]. When two arenas have to be linked
//! (an instance of one starts referencing an instance of the other, or a new
//! instance is persisted into a context) the smaller party is absorbed: its
//! nodes move to the surviving arena and it becomes a forwarding pointer, so
//! handles into it keep working.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::Result;
use crate::error::{Error, TransactionErrorKind};
use crate::fetch_group::FetchGroup;
use crate::identity::{EntityKey, Identity};
use crate::schema::{AttributeInfo, AttributeKind, EntityMeta, Schema};
use crate::state::EntityState;
use crate::storage::{Storage, TransactionId};
use crate::value::Value;

static NEXT_NODE: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id of one entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stored content of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Scalar(Value),
    ToOne(Option<NodeId>),
    ToMany(Vec<NodeId>),
}

impl Slot {
    /// What an attribute that was never assigned reads as on a new instance.
    pub fn empty_for(info: &AttributeInfo) -> Self {
        match info.kind {
            AttributeKind::Scalar => Slot::Scalar(Value::Null),
            AttributeKind::ToOne { .. } => Slot::ToOne(None),
            AttributeKind::ToMany { .. } => Slot::ToMany(Vec::new()),
        }
    }
}

/// One entity instance.
#[derive(Debug, Clone)]
pub struct Node {
    meta: Arc<EntityMeta>,
    id: Identity,
    state: EntityState,
    fetch_group: Option<FetchGroup>,
    values: BTreeMap<String, Slot>,
    dirty: BTreeSet<String>,
}

impl Node {
    pub fn new(
        meta: Arc<EntityMeta>,
        id: Identity,
        state: EntityState,
        fetch_group: Option<FetchGroup>,
    ) -> Self {
        Self {
            meta,
            id,
            state,
            fetch_group,
            values: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn meta(&self) -> &Arc<EntityMeta> {
        &self.meta
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.meta.name(), self.id.clone())
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub fn fetch_group(&self) -> Option<&FetchGroup> {
        self.fetch_group.as_ref()
    }

    pub fn fetch_group_mut(&mut self) -> Option<&mut FetchGroup> {
        self.fetch_group.as_mut()
    }

    pub fn set_fetch_group(&mut self, fetch_group: Option<FetchGroup>) {
        self.fetch_group = fetch_group;
    }

    pub fn slot(&self, attribute: &str) -> Option<&Slot> {
        self.values.get(attribute)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Whether `attribute` can be read without fetching anything.
    pub fn is_available(&self, attribute: &str) -> bool {
        if self.meta.is_identity(attribute) {
            return true;
        }
        match &self.fetch_group {
            Some(group) => group.contains(attribute),
            None if self.state.is_new() => true,
            None => self.values.contains_key(attribute),
        }
    }

    /// Store a value produced by a load.
    pub fn store_loaded(&mut self, attribute: &str, slot: Slot) {
        self.values.insert(attribute.to_string(), slot);
        if let Some(group) = &mut self.fetch_group {
            group.add_loaded(attribute);
        }
    }

    /// Store a value supplied by application code.
    ///
    /// Returns false when the value was already available and equal.
    pub fn store_written(&mut self, attribute: &str, slot: Slot) -> bool {
        if self.is_available(attribute) && self.values.get(attribute) == Some(&slot) {
            return false;
        }
        self.values.insert(attribute.to_string(), slot);
        if let Some(group) = &mut self.fetch_group {
            group.add_written(attribute);
        }
        if !self.state.is_new() {
            self.dirty.insert(attribute.to_string());
        }
        true
    }

    /// Store a slot without touching the fetch group or the dirty set.
    pub fn put_slot(&mut self, attribute: &str, slot: Slot) {
        self.values.insert(attribute.to_string(), slot);
    }

    pub fn mark_dirty(&mut self, attribute: &str) {
        self.dirty.insert(attribute.to_string());
    }

    /// Move to a non-live state and freeze the fetch group.
    pub fn detach(&mut self, state: EntityState) {
        self.state = state;
        if let Some(group) = &mut self.fetch_group {
            group.freeze();
        }
    }
}

/// Connection between an arena and the live persistence context that owns it.
#[derive(Clone)]
pub struct ContextLink {
    context: u64,
    storage: Arc<dyn Storage>,
    schema: Arc<Schema>,
    transaction: TransactionId,
    lazy_loading: bool,
}

impl ContextLink {
    pub fn new(
        context: u64,
        storage: Arc<dyn Storage>,
        schema: Arc<Schema>,
        transaction: TransactionId,
        lazy_loading: bool,
    ) -> Self {
        Self {
            context,
            storage,
            schema,
            transaction,
            lazy_loading,
        }
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn lazy_loading(&self) -> bool {
        self.lazy_loading
    }

    /// Same link, continuing in a new storage transaction.
    pub fn with_transaction(&self, transaction: TransactionId) -> Self {
        Self {
            transaction,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ContextLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLink")
            .field("context", &self.context)
            .field("transaction", &self.transaction)
            .field("lazy_loading", &self.lazy_loading)
            .finish_non_exhaustive()
    }
}

/// The node store of one arena.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    index: HashMap<EntityKey, NodeId>,
    link: Option<ContextLink>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or_else(|| missing_node(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or_else(|| missing_node(id))
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId::next();
        self.nodes.insert(id, node);
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in allocation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Identity-map lookup.
    pub fn lookup(&self, key: &EntityKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn register(&mut self, key: EntityKey, id: NodeId) {
        self.index.insert(key, id);
    }

    pub fn unregister(&mut self, key: &EntityKey) -> Option<NodeId> {
        self.index.remove(key)
    }

    pub fn indexed(&self) -> impl Iterator<Item = (&EntityKey, NodeId)> {
        self.index.iter().map(|(k, v)| (k, *v))
    }

    pub fn clear_index(&mut self) {
        self.index.clear();
    }

    pub fn link(&self) -> Option<&ContextLink> {
        self.link.as_ref()
    }

    pub fn set_link(&mut self, link: Option<ContextLink>) {
        self.link = link;
    }

    /// Nodes reachable from `root` through stored references, root first.
    pub fn reachable_from(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.node(id)?;
            order.push(id);
            for (_, slot) in node.slots() {
                match slot {
                    Slot::ToOne(Some(target)) => queue.push_back(*target),
                    Slot::ToMany(targets) => queue.extend(targets.iter().copied()),
                    Slot::Scalar(_) | Slot::ToOne(None) => {}
                }
            }
        }
        Ok(order)
    }
}

fn missing_node(id: NodeId) -> Error {
    Error::Custom(format!("entity node {} is not part of this arena", id))
}

enum GraphSlot {
    Live(Graph),
    Forwarded(GraphRef),
}

/// Shared handle to an arena.
#[derive(Clone)]
pub struct GraphRef(Arc<RwLock<GraphSlot>>);

impl Default for GraphRef {
    fn default() -> Self {
        Self::new()
    }
}

fn read(lock: &RwLock<GraphSlot>) -> RwLockReadGuard<'_, GraphSlot> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<GraphSlot>) -> RwLockWriteGuard<'_, GraphSlot> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl GraphRef {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(GraphSlot::Live(Graph::default()))))
    }

    /// Run `f` against the arena, following forwarding pointers.
    ///
    /// Must not be re-entered for the same arena from inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        let mut current = Arc::clone(&self.0);
        loop {
            let next = {
                let guard = read(&current);
                match &*guard {
                    GraphSlot::Live(graph) => return f(graph),
                    GraphSlot::Forwarded(next) => Arc::clone(&next.0),
                }
            };
            current = next;
        }
    }

    /// Mutable counterpart of [`GraphRef::with`].
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        let mut current = Arc::clone(&self.0);
        loop {
            let next = {
                let mut guard = write(&current);
                match &mut *guard {
                    GraphSlot::Live(graph) => return f(graph),
                    GraphSlot::Forwarded(next) => Arc::clone(&next.0),
                }
            };
            current = next;
        }
    }

    fn resolve(&self) -> GraphRef {
        let mut current = self.clone();
        loop {
            let next = match &*read(&current.0) {
                GraphSlot::Live(_) => None,
                GraphSlot::Forwarded(next) => Some(next.clone()),
            };
            match next {
                None => return current,
                Some(next) => current = next,
            }
        }
    }

    /// Whether both handles lead to the same arena.
    pub fn same_arena(&self, other: &GraphRef) -> bool {
        Arc::ptr_eq(&self.resolve().0, &other.resolve().0)
    }

    /// Whether the arena is attached to a live persistence context.
    pub fn is_live(&self) -> bool {
        self.with(|g| g.link.is_some())
    }

    /// Move every node of `other` into this arena and forward `other` here.
    ///
    /// Fails when both arenas belong to different live persistence contexts.
    pub fn absorb(&self, other: &GraphRef) -> Result<()> {
        loop {
            let dst = self.resolve();
            let src = other.resolve();
            if Arc::ptr_eq(&dst.0, &src.0) {
                return Ok(());
            }

            let dst_first = Arc::as_ptr(&dst.0) < Arc::as_ptr(&src.0);
            let (mut dst_guard, mut src_guard) = if dst_first {
                let d = write(&dst.0);
                let s = write(&src.0);
                (d, s)
            } else {
                let s = write(&src.0);
                let d = write(&dst.0);
                (d, s)
            };

            let (GraphSlot::Live(dst_graph), GraphSlot::Live(src_graph)) =
                (&mut *dst_guard, &mut *src_guard)
            else {
                // Raced with another absorb; resolve again.
                continue;
            };

            match (&dst_graph.link, &src_graph.link) {
                (Some(a), Some(b)) if a.context != b.context => {
                    return Err(Error::transaction(
                        TransactionErrorKind::ForeignContext,
                        format!(
                            "entities of persistence contexts {} and {} cannot be linked",
                            a.context, b.context
                        ),
                    ));
                }
                (None, Some(_)) => dst_graph.link = src_graph.link.take(),
                _ => {}
            }

            let nodes = std::mem::take(&mut src_graph.nodes);
            let index = std::mem::take(&mut src_graph.index);
            tracing::trace!(moved = nodes.len(), "Absorbing entity arena");
            dst_graph.nodes.extend(nodes);
            for (key, id) in index {
                dst_graph.index.entry(key).or_insert(id);
            }
            *src_guard = GraphSlot::Forwarded(dst.clone());
            return Ok(());
        }
    }
}

impl fmt::Debug for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|g| {
            f.debug_struct("GraphRef")
                .field("nodes", &g.nodes.len())
                .field("indexed", &g.index.len())
                .field("link", &g.link)
                .finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeInfo;

    fn meta() -> Arc<EntityMeta> {
        Arc::new(
            EntityMeta::new("User")
                .add_attribute(AttributeInfo::scalar("login"))
                .add_attribute(AttributeInfo::to_one("manager", "User")),
        )
    }

    fn new_node(graph: &GraphRef, id: i64) -> NodeId {
        graph.with_mut(|g| g.insert(Node::new(meta(), Identity::Int(id), EntityState::New, None)))
    }

    #[test]
    fn test_new_instances_answer_everything() {
        let node = Node::new(meta(), Identity::Int(1), EntityState::New, None);
        assert!(node.is_available("login"));
        assert!(node.is_available("manager"));
    }

    #[test]
    fn test_untracked_managed_availability() {
        let mut node = Node::new(meta(), Identity::Int(1), EntityState::Managed, None);
        assert!(node.is_available("id"));
        assert!(!node.is_available("login"));
        node.store_loaded("login", Slot::Scalar(Value::from("admin")));
        assert!(node.is_available("login"));
    }

    #[test]
    fn test_write_marks_dirty_only_when_changed() {
        let mut node = Node::new(
            meta(),
            Identity::Int(1),
            EntityState::Managed,
            Some(FetchGroup::new(["id"])),
        );
        node.store_loaded("login", Slot::Scalar(Value::from("admin")));
        assert!(!node.store_written("login", Slot::Scalar(Value::from("admin"))));
        assert!(node.dirty().is_empty());
        assert!(node.store_written("login", Slot::Scalar(Value::from("root"))));
        assert!(node.dirty().contains("login"));
    }

    #[test]
    fn test_detach_freezes_group() {
        let mut node = Node::new(
            meta(),
            Identity::Int(1),
            EntityState::Managed,
            Some(FetchGroup::new(["id"])),
        );
        node.detach(EntityState::Detached);
        assert!(node.fetch_group().unwrap().is_frozen());
        node.store_loaded("login", Slot::Scalar(Value::Null));
        assert!(!node.is_available("login"));
    }

    #[test]
    fn test_absorb_forwards_handles() {
        let a = GraphRef::new();
        let b = GraphRef::new();
        let na = new_node(&a, 1);
        let nb = new_node(&b, 2);
        assert!(!a.same_arena(&b));

        a.absorb(&b).unwrap();
        assert!(a.same_arena(&b));
        assert!(b.with(|g| g.contains(na) && g.contains(nb)));
        assert_eq!(a.with(Graph::len), 2);

        // Idempotent once merged.
        b.absorb(&a).unwrap();
        assert_eq!(b.with(Graph::len), 2);
    }

    #[test]
    fn test_reachable_follows_references_once() {
        let graph = GraphRef::new();
        let a = new_node(&graph, 1);
        let b = new_node(&graph, 2);
        graph.with_mut(|g| {
            g.node_mut(a).unwrap().store_written("manager", Slot::ToOne(Some(b)));
            g.node_mut(b).unwrap().store_written("manager", Slot::ToOne(Some(a)));
        });
        let order = graph.with(|g| g.reachable_from(a)).unwrap();
        assert_eq!(order, vec![a, b]);
    }
}
