//! The persistence context: identity map, change tracking and transaction scope.
//!
//! A context owns one entity arena and one storage transaction. Every
//! instance it hands out lives in that arena and is indexed by
//! [`EntityKey`], so two finds of the same identity return the same
//! instance. When the transaction ends the arena is unlinked from storage
//! and every live instance becomes detached with its fetch group frozen.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use entityview_core::{
    ContextLink, Entity, EntityKey, EntityMeta, EntityState, Error, Graph, GraphRef, Identity,
    LifecycleEvent, Loader, Node, NodeId, Result, Schema, SchemaErrorKind, Slot, Storage,
    StorageErrorKind, TransactionErrorKind, TransactionId, Value, View,
};

use crate::PersistenceConfig;
use crate::flush::{FlushOrderer, FlushResult, PendingOp, RowWrite};
use crate::unit_of_work::{PendingCounts, UnitOfWork};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Value of one attribute carried into a merge.
enum MergeValue {
    Scalar(Value),
    ToOne(Option<(Arc<EntityMeta>, Identity)>),
}

pub struct PersistenceContext {
    id: u64,
    graph: GraphRef,
    storage: Arc<dyn Storage>,
    schema: Arc<Schema>,
    config: PersistenceConfig,
    transaction: Option<TransactionId>,
    uow: UnitOfWork,
}

impl PersistenceContext {
    /// Begin a storage transaction and open a context over it.
    pub fn begin(
        storage: Arc<dyn Storage>,
        schema: Arc<Schema>,
        config: PersistenceConfig,
    ) -> Result<Self> {
        let tx = storage.begin()?;
        let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        let graph = GraphRef::new();
        graph.with_mut(|g| {
            g.set_link(Some(ContextLink::new(
                id,
                Arc::clone(&storage),
                Arc::clone(&schema),
                tx,
                config.lazy_loading,
            )));
        });
        tracing::debug!(context = id, transaction = %tx, "Persistence context opened");
        Ok(Self {
            id,
            graph,
            storage,
            schema,
            config,
            transaction: Some(tx),
            uow: UnitOfWork::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn graph(&self) -> &GraphRef {
        &self.graph
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Current storage transaction; `None` once the context has ended.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn is_active(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.counts()
    }

    /// Number of instances in the identity map.
    pub fn managed_count(&self) -> usize {
        self.graph.with(|g| g.indexed().count())
    }

    /// Managed instances with unflushed attribute writes.
    pub fn dirty_count(&self) -> usize {
        self.graph.with(|g| {
            g.indexed()
                .filter_map(|(_, id)| g.node(id).ok())
                .filter(|n| n.state().is_managed() && !n.dirty().is_empty())
                .count()
        })
    }

    fn active_tx(&self) -> Result<TransactionId> {
        self.transaction.ok_or_else(|| {
            Error::transaction(
                TransactionErrorKind::Closed,
                format!("persistence context {} has ended", self.id),
            )
        })
    }

    /// Whether `entity` is the instance this context indexes under its key.
    fn owns(&self, entity: &Entity) -> bool {
        entity.graph().same_arena(&self.graph)
            && self.graph.with(|g| g.lookup(entity.key()) == Some(entity.node_id()))
    }

    /// Whether `entity` is managed by this context.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.is_active() && self.owns(entity) && entity.is_managed()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Find `entity[id]`, loading the attributes `view` asks for.
    ///
    /// Without a view every scalar and to-one attribute is loaded and no
    /// fetch group is attached. An instance already in the identity map is
    /// returned as is, extended with whatever the view adds. Instances
    /// scheduled for removal are not found.
    #[tracing::instrument(level = "debug", skip(self, id, view), fields(context = self.id))]
    pub fn find(
        &mut self,
        entity: &str,
        id: impl Into<Identity>,
        view: Option<&View>,
    ) -> Result<Option<Entity>> {
        self.active_tx()?;
        let meta = Arc::clone(self.schema.require(entity)?);
        if let Some(view) = view {
            if view.entity() != entity {
                return Err(Error::schema(
                    SchemaErrorKind::KindMismatch,
                    format!("view for {} used to find {}", view.entity(), entity),
                ));
            }
            view.validate(&self.schema)?;
        }

        let id = id.into();
        let key = EntityKey::new(entity, id.clone());
        let pending = self.uow.pending_new().to_vec();
        let found = self.graph.with_mut(|g| -> Result<Option<NodeId>> {
            if let Some(existing) = g.lookup(&key) {
                if g.node(existing)?.state().is_removed() {
                    return Ok(None);
                }
            }
            Loader::new(g)?
                .with_pending_inserts(pending)
                .load(&meta, &id, view)
        })?;

        match found {
            Some(node) => Entity::attach(&self.graph, node).map(Some),
            None => {
                tracing::debug!(key = %key, "Not found");
                Ok(None)
            }
        }
    }

    /// Managed instance of `entity[id]` without touching storage.
    ///
    /// A fresh instance only knows its identity; other attributes are
    /// fetched on first access.
    pub fn get_reference(&mut self, entity: &str, id: impl Into<Identity>) -> Result<Entity> {
        self.active_tx()?;
        let meta = Arc::clone(self.schema.require(entity)?);
        let id = id.into();
        let node = self
            .graph
            .with_mut(|g| -> Result<NodeId> { Ok(Loader::new(g)?.ensure_stub(&meta, &id)) })?;
        Entity::attach(&self.graph, node)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Make a new instance managed. It is inserted on the next flush.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(context = self.id, key = %entity.key()))]
    pub fn persist(&mut self, entity: &Entity) -> Result<()> {
        self.active_tx()?;
        let state = entity.state();
        if state.is_managed() {
            if self.owns(entity) {
                return Ok(());
            }
            return Err(foreign(entity));
        }
        state.apply(LifecycleEvent::Persist, &entity.key().to_string())?;

        self.graph.absorb(entity.graph())?;
        let node = entity.node_id();
        let key = entity.key().clone();
        let meta = Arc::clone(entity.meta());
        self.graph.with_mut(|g| -> Result<()> {
            if let Some(other) = g.lookup(&key) {
                if other != node {
                    return Err(Error::invalid_state(
                        "persist",
                        state,
                        key.to_string(),
                        "another instance with this identity is already managed",
                    ));
                }
            }
            let n = g.node_mut(node)?;
            for attr in meta.attributes() {
                if meta.is_identity(&attr.name) || attr.is_to_many() {
                    continue;
                }
                if n.slot(&attr.name).is_none() {
                    n.put_slot(&attr.name, Slot::empty_for(attr));
                }
            }
            n.set_state(EntityState::Managed);
            n.clear_dirty();
            g.register(key, node);
            Ok(())
        })?;
        self.uow.track_new(node);
        tracing::debug!("New -> Managed");
        Ok(())
    }

    /// Reconcile a detached instance into this context.
    ///
    /// Only attributes the detached instance actually carries are copied:
    /// its fetch group for tracked instances, its populated values for
    /// untracked ones. Everything else stays as loaded from storage. Returns
    /// the managed instance, never the input handle.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(context = self.id, key = %entity.key()))]
    pub fn merge(&mut self, entity: &Entity) -> Result<Entity> {
        self.active_tx()?;
        entity
            .state()
            .apply(LifecycleEvent::Merge, &entity.key().to_string())?;

        let candidates = merge_candidates(entity)?;
        let meta = Arc::clone(self.schema.require(entity.entity_name())?);
        let key = entity.key().clone();
        let missing_as_new = self.config.merge_missing_as_new;

        let (node, created) = self.graph.with_mut(|g| -> Result<(NodeId, bool)> {
            let existing = match g.lookup(&key) {
                Some(n) => {
                    let state = g.node(n)?.state();
                    if state.is_removed() {
                        return Err(Error::invalid_state(
                            "merge",
                            state,
                            key.to_string(),
                            "the managed instance is scheduled for removal",
                        ));
                    }
                    Some(n)
                }
                None => Loader::new(g)?.load(&meta, &key.id, None)?,
            };

            let (node, created) = match existing {
                Some(n) => (n, false),
                None if missing_as_new => {
                    tracing::debug!("No stored row, scheduling insert");
                    let mut n = Node::new(
                        Arc::clone(&meta),
                        key.id.clone(),
                        EntityState::Managed,
                        None,
                    );
                    for attr in meta.attributes() {
                        if !meta.is_identity(&attr.name) && !attr.is_to_many() {
                            n.put_slot(&attr.name, Slot::empty_for(attr));
                        }
                    }
                    let id = g.insert(n);
                    g.register(key.clone(), id);
                    (id, true)
                }
                None => {
                    return Err(Error::storage(
                        StorageErrorKind::NotFound,
                        format!("{} no longer exists in storage", key),
                    ));
                }
            };

            let mut slots = Vec::with_capacity(candidates.len());
            {
                let mut loader = Loader::new(g)?;
                for (name, value) in candidates {
                    let slot = match value {
                        MergeValue::Scalar(v) => Slot::Scalar(v),
                        MergeValue::ToOne(None) => Slot::ToOne(None),
                        MergeValue::ToOne(Some((target, id))) => {
                            Slot::ToOne(Some(loader.ensure_stub(&target, &id)))
                        }
                    };
                    slots.push((name, slot));
                }
            }
            let n = g.node_mut(node)?;
            for (name, slot) in slots {
                n.store_written(&name, slot);
            }
            Ok((node, created))
        })?;

        if created {
            self.uow.track_new(node);
        }
        tracing::debug!(created, "Detached -> Managed");
        Entity::attach(&self.graph, node)
    }

    /// Schedule a managed instance for deletion.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(context = self.id, key = %entity.key()))]
    pub fn remove(&mut self, entity: &Entity) -> Result<()> {
        self.active_tx()?;
        let state = entity.state();
        state.apply(LifecycleEvent::Remove, &entity.key().to_string())?;
        if !self.owns(entity) {
            return Err(foreign(entity));
        }
        if state.is_removed() {
            return Ok(());
        }

        let node = entity.node_id();
        self.graph
            .with_mut(|g| -> Result<()> {
                g.node_mut(node)?.set_state(EntityState::Removed);
                Ok(())
            })?;
        if !self.uow.cancel_new(node) {
            self.uow.track_deleted(node);
        }
        tracing::debug!("Managed -> Removed");
        Ok(())
    }

    // ========================================================================
    // Flush and transaction end
    // ========================================================================

    /// Write pending inserts, dirty attributes and deletions to storage.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        let tx = self.active_tx()?;
        let ops = self.graph.with(|g| collect_ops(g, &self.uow))?;
        if ops.is_empty() {
            return Ok(FlushResult::new());
        }
        let flushed: Vec<NodeId> = ops.iter().map(PendingOp::node).collect();
        let plan = FlushOrderer::new().order(ops)?;
        let result = plan.execute(self.storage.as_ref(), tx)?;

        self.graph.with_mut(|g| {
            for node in &flushed {
                if let Ok(n) = g.node_mut(*node) {
                    n.clear_dirty();
                }
            }
        });
        self.uow.flushed();
        Ok(result)
    }

    /// Flush and commit. Every live instance becomes detached.
    ///
    /// When the flush or the storage commit fails the transaction is rolled
    /// back instead and the error is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    pub fn commit(&mut self) -> Result<()> {
        let tx = self.active_tx()?;
        if let Err(e) = self.flush().and_then(|_| self.storage.commit(tx)) {
            self.abort(tx);
            return Err(e);
        }
        self.end(true)?;
        tracing::debug!(transaction = %tx, "Committed");
        Ok(())
    }

    /// Discard pending work and end the transaction.
    ///
    /// Instances persisted in this context become new again; every other
    /// live instance becomes detached.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.active_tx()?;
        let result = self.storage.rollback(tx);
        self.end(false)?;
        tracing::debug!(transaction = %tx, "Rolled back");
        result
    }

    /// Flush and commit, then continue in a new storage transaction.
    ///
    /// The identity map survives: managed instances stay managed, removed
    /// ones become detached and leave the map.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.id))]
    pub fn commit_retaining(&mut self) -> Result<()> {
        let tx = self.active_tx()?;
        if let Err(e) = self.flush().and_then(|_| self.storage.commit(tx)) {
            self.abort(tx);
            return Err(e);
        }
        let next = match self.storage.begin() {
            Ok(next) => next,
            Err(e) => {
                self.end(true)?;
                return Err(e);
            }
        };

        self.graph.with_mut(|g| -> Result<()> {
            for node in g.node_ids() {
                let n = g.node_mut(node)?;
                if n.state().is_removed() {
                    let key = n.key();
                    n.detach(EntityState::Detached);
                    g.unregister(&key);
                }
            }
            let link = g.link().map(|l| l.with_transaction(next));
            g.set_link(link);
            Ok(())
        })?;
        self.transaction = Some(next);
        self.uow.reset();
        tracing::debug!(committed = %tx, transaction = %next, "Committed, retaining context");
        Ok(())
    }

    /// Roll back after a failed commit, logging secondary failures.
    fn abort(&mut self, tx: TransactionId) {
        if let Err(e) = self.storage.rollback(tx) {
            tracing::warn!(transaction = %tx, error = %e, "Rollback after failed commit also failed");
        }
        if let Err(e) = self.end(false) {
            tracing::warn!(error = %e, "Failed to detach instances after rollback");
        }
    }

    fn end(&mut self, committed: bool) -> Result<()> {
        let uow = &self.uow;
        let (detached, reverted) = self.graph.with_mut(|g| -> Result<(usize, usize)> {
            let mut detached = 0;
            let mut reverted = 0;
            for node in g.node_ids() {
                let n = g.node_mut(node)?;
                let state = n.state();
                if !state.is_live() {
                    continue;
                }
                let event = if committed {
                    LifecycleEvent::Commit
                } else {
                    LifecycleEvent::Rollback {
                        persisted_here: uow.was_persisted_here(node),
                    }
                };
                let next = state.apply(event, &n.key().to_string())?;
                if next.is_new() {
                    n.set_state(EntityState::New);
                    n.clear_dirty();
                    reverted += 1;
                } else {
                    n.detach(next);
                    detached += 1;
                }
            }
            g.clear_index();
            g.set_link(None);
            Ok((detached, reverted))
        })?;
        self.uow.reset();
        self.transaction = None;
        tracing::debug!(detached, reverted, "Persistence context ended");
        Ok(())
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("id", &self.id)
            .field("transaction", &self.transaction)
            .field("config", &self.config)
            .field("pending", &self.uow.counts())
            .finish_non_exhaustive()
    }
}

fn foreign(entity: &Entity) -> Error {
    Error::transaction(
        TransactionErrorKind::ForeignContext,
        format!("{} is managed by another persistence context", entity.key()),
    )
}

/// Attributes a detached instance carries, with reference targets as identities.
fn merge_candidates(entity: &Entity) -> Result<Vec<(String, MergeValue)>> {
    entity.with_graph(|g, node| {
        let n = g.node(node)?;
        let meta = n.meta();
        let mut out = Vec::new();
        for attr in meta.attributes() {
            if meta.is_identity(&attr.name) || attr.is_to_many() {
                continue;
            }
            let carried = match n.fetch_group() {
                Some(group) => group.contains(&attr.name),
                None => n.slot(&attr.name).is_some(),
            };
            if !carried {
                continue;
            }
            let value = match n.slot(&attr.name) {
                Some(Slot::Scalar(v)) => MergeValue::Scalar(v.clone()),
                Some(Slot::ToOne(Some(target))) => {
                    let t = g.node(*target)?;
                    MergeValue::ToOne(Some((Arc::clone(t.meta()), t.id().clone())))
                }
                Some(Slot::ToOne(None)) => MergeValue::ToOne(None),
                None if attr.is_to_one() => MergeValue::ToOne(None),
                None => MergeValue::Scalar(Value::Null),
                Some(Slot::ToMany(_)) => continue,
            };
            out.push((attr.name.clone(), value));
        }
        Ok(out)
    })
}

/// Value of a non-collection slot as written to storage.
fn storage_value(g: &Graph, slot: Option<&Slot>) -> Result<Value> {
    Ok(match slot {
        Some(Slot::Scalar(v)) => v.clone(),
        Some(Slot::ToOne(Some(target))) => g.node(*target)?.id().to_value(),
        Some(Slot::ToOne(None) | Slot::ToMany(_)) | None => Value::Null,
    })
}

fn references(n: &Node) -> Vec<NodeId> {
    n.slots()
        .filter_map(|(_, slot)| match slot {
            Slot::ToOne(Some(target)) => Some(*target),
            _ => None,
        })
        .collect()
}

fn row_write(g: &Graph, node: NodeId, attributes: &[&str]) -> Result<RowWrite> {
    let n = g.node(node)?;
    let mut values = Vec::with_capacity(attributes.len());
    for name in attributes {
        values.push((name.to_string(), storage_value(g, n.slot(name))?));
    }
    Ok(RowWrite {
        node,
        meta: Arc::clone(n.meta()),
        key: n.key(),
        values,
        depends_on: references(n),
    })
}

fn collect_ops(g: &Graph, uow: &UnitOfWork) -> Result<Vec<PendingOp>> {
    let mut ops = Vec::new();

    for node in uow.pending_new() {
        let n = g.node(*node)?;
        let meta = n.meta();
        let columns: Vec<&str> = meta
            .attributes()
            .iter()
            .filter(|a| !meta.is_identity(&a.name) && !a.is_to_many())
            .map(|a| a.name.as_str())
            .collect();
        ops.push(PendingOp::Insert(row_write(g, *node, &columns)?));
    }

    for node in g.node_ids() {
        let n = g.node(node)?;
        if !n.state().is_managed() || n.dirty().is_empty() || uow.is_pending_new(node) {
            continue;
        }
        if g.lookup(&n.key()) != Some(node) {
            continue;
        }
        let meta = n.meta();
        let columns: Vec<&str> = n
            .dirty()
            .iter()
            .map(String::as_str)
            .filter(|name| {
                !meta.is_identity(name) && meta.attribute(name).is_some_and(|a| !a.is_to_many())
            })
            .collect();
        if columns.is_empty() {
            continue;
        }
        let mut write = row_write(g, node, &columns)?;
        write.depends_on.clear();
        ops.push(PendingOp::Update(write));
    }

    for node in uow.pending_delete() {
        let n = g.node(*node)?;
        if !n.state().is_removed() {
            continue;
        }
        ops.push(PendingOp::Delete(row_write(g, *node, &[])?));
    }

    Ok(ops)
}
