//! Materializes stored rows into arena nodes.
//!
//! The loader runs with exclusive access to a context-linked [`Graph`] and
//! drives the storage engine through the arena's [`ContextLink`]. It is used
//! both for view-driven finds and for lazy single-attribute fetches.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, StorageErrorKind, TransactionErrorKind};
use crate::fetch_group::{FetchGroup, required_attributes};
use crate::graph::{ContextLink, Graph, Node, NodeId, Slot};
use crate::identity::{EntityKey, Identity};
use crate::row::Row;
use crate::schema::{AttributeInfo, AttributeKind, EntityMeta};
use crate::state::EntityState;
use crate::storage::Projection;
use crate::value::Value;
use crate::view::{FetchMode, View};

pub struct Loader<'g> {
    graph: &'g mut Graph,
    link: ContextLink,
    /// Managed nodes whose rows are not in storage until the next flush.
    pending_inserts: HashSet<NodeId>,
}

impl<'g> Loader<'g> {
    /// Fails when the arena is not attached to a live persistence context.
    pub fn new(graph: &'g mut Graph) -> Result<Self> {
        let link = graph.link().cloned().ok_or_else(|| {
            Error::transaction(
                TransactionErrorKind::Closed,
                "entity arena is not attached to a live persistence context",
            )
        })?;
        Ok(Self {
            graph,
            link,
            pending_inserts: HashSet::new(),
        })
    }

    /// Mark nodes awaiting insertion; their columns are never selected.
    #[must_use]
    pub fn with_pending_inserts(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.pending_inserts.extend(nodes);
        self
    }

    /// Load `meta[id]` through `view`, or untracked when `view` is `None`.
    ///
    /// An instance already present in the identity map is always returned,
    /// after fetching whatever the view requires that it does not have yet.
    /// Returns `Ok(None)` when the identity is unknown and no row matches.
    pub fn load(
        &mut self,
        meta: &Arc<EntityMeta>,
        id: &Identity,
        view: Option<&View>,
    ) -> Result<Option<NodeId>> {
        let partial = view.is_some_and(View::is_load_partial_entities);
        self.load_node(meta, id, view, partial)
    }

    fn load_node(
        &mut self,
        meta: &Arc<EntityMeta>,
        id: &Identity,
        view: Option<&View>,
        partial: bool,
    ) -> Result<Option<NodeId>> {
        let key = EntityKey::new(meta.name(), id.clone());
        let required = required_attributes(meta, view, partial);

        let node_id = match self.graph.lookup(&key) {
            Some(existing) => {
                self.extend(existing, meta, id, &required, view)?;
                existing
            }
            None => {
                let Some(row) = self.select(meta, id, &required, view)? else {
                    tracing::debug!(key = %key, "No stored row");
                    return Ok(None);
                };
                let fetch_group = view.map(|v| FetchGroup::for_view(meta, v, partial));
                let node_id = self.graph.insert(Node::new(
                    Arc::clone(meta),
                    id.clone(),
                    EntityState::Managed,
                    fetch_group,
                ));
                self.graph.register(key, node_id);
                self.apply_row(node_id, meta, &required, &row)?;
                node_id
            }
        };

        if let Some(view) = view {
            self.load_nested(node_id, meta, view, partial)?;
        }
        Ok(Some(node_id))
    }

    /// Fetch the attributes of `required` that the existing node lacks and
    /// record all of them in its fetch group.
    fn extend(
        &mut self,
        node_id: NodeId,
        meta: &EntityMeta,
        id: &Identity,
        required: &[&AttributeInfo],
        view: Option<&View>,
    ) -> Result<()> {
        let (collections, columns): (Vec<&AttributeInfo>, Vec<&AttributeInfo>) = {
            let node = self.graph.node(node_id)?;
            required
                .iter()
                .copied()
                .filter(|a| !node.is_available(&a.name))
                .partition(|a| a.is_to_many())
        };

        if !columns.is_empty() {
            if self.pending_inserts.contains(&node_id) {
                tracing::trace!(
                    entity = %meta.name(),
                    id = %id,
                    "Pending insert, keeping in-memory values"
                );
            } else {
                tracing::debug!(
                    entity = %meta.name(),
                    id = %id,
                    missing = columns.len(),
                    "Extending managed instance"
                );
                let row = self
                    .select(meta, id, &columns, view)?
                    .ok_or_else(|| vanished(meta, id))?;
                self.apply_row(node_id, meta, &columns, &row)?;
            }
        }
        for attr in collections {
            let slot = self.collection_slot(meta, attr, id)?;
            self.graph.node_mut(node_id)?.store_loaded(&attr.name, slot);
        }

        if let Some(group) = self.graph.node_mut(node_id)?.fetch_group_mut() {
            for attr in required {
                group.add_loaded(&attr.name);
            }
        }
        Ok(())
    }

    fn load_nested(
        &mut self,
        node_id: NodeId,
        meta: &EntityMeta,
        view: &View,
        partial: bool,
    ) -> Result<()> {
        for property in view.properties() {
            let attr = meta.require(property.name())?;
            let Some(target) = attr.target() else {
                continue;
            };
            let target_meta = Arc::clone(self.link.schema().require(target)?);
            let empty;
            let nested = match property.view() {
                Some(nested) => nested,
                None => {
                    empty = View::new(target);
                    &empty
                }
            };

            let targets: Vec<NodeId> = match self.graph.node(node_id)?.slot(&attr.name) {
                Some(Slot::ToOne(Some(t))) => vec![*t],
                Some(Slot::ToMany(ts)) => ts.clone(),
                _ => Vec::new(),
            };
            for target_node in targets {
                let node = self.graph.node(target_node)?;
                // Hand-built or detached targets are never fetched into.
                if !node.state().is_live() {
                    continue;
                }
                let target_id = node.id().clone();
                if self
                    .load_node(&target_meta, &target_id, Some(nested), partial)?
                    .is_none()
                {
                    tracing::warn!(
                        entity = %target_meta.name(),
                        id = %target_id,
                        "Referenced row vanished during nested load"
                    );
                }
            }
        }
        Ok(())
    }

    /// Fetch a single attribute of a managed instance on access.
    pub fn load_attribute(&mut self, node_id: NodeId, attr: &AttributeInfo) -> Result<()> {
        let (meta, id) = {
            let node = self.graph.node(node_id)?;
            (Arc::clone(node.meta()), node.id().clone())
        };
        tracing::debug!(
            entity = %meta.name(),
            id = %id,
            attribute = %attr.name,
            "Lazy-loading attribute"
        );

        let slot = match &attr.kind {
            AttributeKind::Scalar => {
                let row = self.select_required(&meta, &id, attr)?;
                Slot::Scalar(row.get_by_name(&attr.name).cloned().unwrap_or(Value::Null))
            }
            AttributeKind::ToOne { target } => {
                let row = self.select_required(&meta, &id, attr)?;
                let fk = Identity::from_value(row.get_by_name(&attr.name).unwrap_or(&Value::Null))?;
                let target_meta = Arc::clone(self.link.schema().require(target)?);
                match fk {
                    None => Slot::ToOne(None),
                    Some(fk) => Slot::ToOne(self.materialize(&target_meta, &fk)?),
                }
            }
            AttributeKind::ToMany { target, .. } => {
                let target_meta = Arc::clone(self.link.schema().require(target)?);
                let ids = self.related(&meta, attr, &id)?;
                let mut nodes = Vec::with_capacity(ids.len());
                for child in ids {
                    if let Some(node) = self.materialize(&target_meta, &child)? {
                        nodes.push(node);
                    }
                }
                Slot::ToMany(nodes)
            }
        };
        self.graph.node_mut(node_id)?.store_loaded(&attr.name, slot);
        Ok(())
    }

    /// Raw foreign key of a to-one attribute, read without materializing the target.
    pub fn foreign_key(
        &mut self,
        node_id: NodeId,
        attr: &AttributeInfo,
    ) -> Result<Option<Identity>> {
        let (meta, id) = {
            let node = self.graph.node(node_id)?;
            (Arc::clone(node.meta()), node.id().clone())
        };
        let row = self.select_required(&meta, &id, attr)?;
        Identity::from_value(row.get_by_name(&attr.name).unwrap_or(&Value::Null))
    }

    /// Node of `meta[id]` for a reference: existing instance, or a managed
    /// stub whose fetch group holds only the identity.
    pub fn ensure_stub(&mut self, meta: &Arc<EntityMeta>, id: &Identity) -> NodeId {
        let key = EntityKey::new(meta.name(), id.clone());
        if let Some(existing) = self.graph.lookup(&key) {
            return existing;
        }
        let node = self.graph.insert(Node::new(
            Arc::clone(meta),
            id.clone(),
            EntityState::Managed,
            Some(FetchGroup::identity_only(meta)),
        ));
        self.graph.register(key, node);
        node
    }

    /// Existing instance, or an untracked load of the row.
    ///
    /// The new node is registered before its references are resolved, so
    /// reference cycles end at the identity map.
    fn materialize(&mut self, meta: &Arc<EntityMeta>, id: &Identity) -> Result<Option<NodeId>> {
        let key = EntityKey::new(meta.name(), id.clone());
        if let Some(existing) = self.graph.lookup(&key) {
            return Ok(Some(existing));
        }
        let loaded = self.load_node(meta, id, None, false)?;
        if loaded.is_none() {
            tracing::warn!(key = %key, "Dangling reference, treating as absent");
        }
        Ok(loaded)
    }

    fn apply_row(
        &mut self,
        node_id: NodeId,
        meta: &EntityMeta,
        attrs: &[&AttributeInfo],
        row: &Row,
    ) -> Result<()> {
        let (owner, tracked) = {
            let node = self.graph.node(node_id)?;
            (node.id().clone(), node.fetch_group().is_some())
        };
        for attr in attrs {
            let slot = match &attr.kind {
                AttributeKind::Scalar => {
                    Slot::Scalar(row.get_by_name(&attr.name).cloned().unwrap_or(Value::Null))
                }
                AttributeKind::ToOne { target } => {
                    let fk = row.get_by_name(&attr.name).unwrap_or(&Value::Null);
                    match Identity::from_value(fk)? {
                        None => Slot::ToOne(None),
                        Some(fk) => {
                            let target_meta = Arc::clone(self.link.schema().require(target)?);
                            if tracked {
                                Slot::ToOne(Some(self.ensure_stub(&target_meta, &fk)))
                            } else {
                                Slot::ToOne(self.materialize(&target_meta, &fk)?)
                            }
                        }
                    }
                }
                AttributeKind::ToMany { .. } => self.collection_slot(meta, attr, &owner)?,
            };
            self.graph.node_mut(node_id)?.store_loaded(&attr.name, slot);
        }
        Ok(())
    }

    /// Members of a to-many attribute as stubs, read through the inverse
    /// foreign key only.
    fn collection_slot(
        &mut self,
        meta: &EntityMeta,
        attr: &AttributeInfo,
        owner: &Identity,
    ) -> Result<Slot> {
        let Some(target) = attr.target() else {
            return Ok(Slot::ToMany(Vec::new()));
        };
        let target_meta = Arc::clone(self.link.schema().require(target)?);
        let children = self.related(meta, attr, owner)?;
        Ok(Slot::ToMany(
            children
                .iter()
                .map(|child| self.ensure_stub(&target_meta, child))
                .collect(),
        ))
    }

    fn select(
        &self,
        meta: &EntityMeta,
        id: &Identity,
        attrs: &[&AttributeInfo],
        view: Option<&View>,
    ) -> Result<Option<Row>> {
        let mut projection = Projection::new();
        let mut seen = BTreeSet::new();
        for attr in attrs.iter().filter(|a| !a.is_to_many()) {
            if !seen.insert(attr.name.as_str()) {
                continue;
            }
            let property = view.and_then(|v| v.property(&attr.name));
            projection.push(
                attr.name.clone(),
                property.map_or(FetchMode::Auto, |p| p.fetch_mode()),
                property.is_some_and(|p| p.is_cacheable()),
            );
        }
        tracing::trace!(
            entity = %meta.name(),
            id = %id,
            attributes = projection.len(),
            "Projected select"
        );
        self.link
            .storage()
            .select(self.link.transaction(), meta, id, &projection)
    }

    fn select_required(
        &self,
        meta: &EntityMeta,
        id: &Identity,
        attr: &AttributeInfo,
    ) -> Result<Row> {
        self.select(meta, id, &[attr], None)?
            .ok_or_else(|| vanished(meta, id))
    }

    fn related(
        &self,
        meta: &EntityMeta,
        attr: &AttributeInfo,
        owner: &Identity,
    ) -> Result<Vec<Identity>> {
        self.link
            .storage()
            .select_related(self.link.transaction(), meta, attr, owner)
    }
}

fn vanished(meta: &EntityMeta, id: &Identity) -> Error {
    Error::storage(
        StorageErrorKind::NotFound,
        format!("{}[{}] no longer exists in storage", meta.name(), id),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::schema::Schema;
    use crate::storage::{Storage, TransactionId};

    /// Rows keyed by entity and identity; counts reads.
    #[derive(Default)]
    struct Rows {
        rows: Mutex<HashMap<EntityKey, Vec<(String, Value)>>>,
        selects: AtomicUsize,
        related: AtomicUsize,
    }

    impl Rows {
        fn put(&self, entity: &str, id: i64, values: &[(&str, Value)]) {
            let values = values
                .iter()
                .map(|(n, v)| ((*n).to_string(), v.clone()))
                .collect();
            let mut rows = self.rows.lock().unwrap();
            rows.insert(EntityKey::new(entity, id), values);
        }

        fn drop_row(&self, entity: &str, id: i64) {
            self.rows.lock().unwrap().remove(&EntityKey::new(entity, id));
        }

        fn selects(&self) -> usize {
            self.selects.load(Ordering::SeqCst)
        }

        fn related(&self) -> usize {
            self.related.load(Ordering::SeqCst)
        }
    }

    impl Storage for Rows {
        fn begin(&self) -> Result<TransactionId> {
            Ok(TransactionId::new(1))
        }

        fn select(
            &self,
            _tx: TransactionId,
            entity: &EntityMeta,
            id: &Identity,
            projection: &Projection,
        ) -> Result<Option<Row>> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            let rows = self.rows.lock().unwrap();
            let Some(stored) = rows.get(&EntityKey::new(entity.name(), id.clone())) else {
                return Ok(None);
            };
            let names: Vec<String> = projection.names().map(str::to_string).collect();
            let values = names
                .iter()
                .map(|n| {
                    stored
                        .iter()
                        .find(|(k, _)| k == n)
                        .map_or(Value::Null, |(_, v)| v.clone())
                })
                .collect();
            Ok(Some(Row::new(names, values)))
        }

        fn select_related(
            &self,
            _tx: TransactionId,
            _entity: &EntityMeta,
            attribute: &AttributeInfo,
            owner: &Identity,
        ) -> Result<Vec<Identity>> {
            self.related.fetch_add(1, Ordering::SeqCst);
            let AttributeKind::ToMany { target, mapped_by } = &attribute.kind else {
                return Ok(Vec::new());
            };
            let fk = owner.to_value();
            let rows = self.rows.lock().unwrap();
            let mut ids: Vec<Identity> = rows
                .iter()
                .filter(|(key, values)| {
                    key.entity == *target && values.iter().any(|(n, v)| n == mapped_by && *v == fk)
                })
                .map(|(key, _)| key.id.clone())
                .collect();
            ids.sort_by_key(ToString::to_string);
            Ok(ids)
        }

        fn insert(
            &self,
            _tx: TransactionId,
            _entity: &EntityMeta,
            _id: &Identity,
            _values: &[(String, Value)],
        ) -> Result<()> {
            Ok(())
        }

        fn update(
            &self,
            _tx: TransactionId,
            _entity: &EntityMeta,
            _id: &Identity,
            _values: &[(String, Value)],
        ) -> Result<u64> {
            Ok(0)
        }

        fn delete(&self, _tx: TransactionId, _entity: &EntityMeta, _id: &Identity) -> Result<u64> {
            Ok(0)
        }

        fn commit(&self, _tx: TransactionId) -> Result<()> {
            Ok(())
        }

        fn rollback(&self, _tx: TransactionId) -> Result<()> {
            Ok(())
        }
    }

    /// People pointing at each other plus the notes they own.
    fn schema() -> Arc<Schema> {
        let schema = Schema::builder()
            .entity(
                EntityMeta::new("Person")
                    .add_attribute(AttributeInfo::scalar("name"))
                    .add_attribute(AttributeInfo::scalar("email"))
                    .add_attribute(AttributeInfo::to_one("partner", "Person"))
                    .add_attribute(AttributeInfo::to_many("notes", "Note", "author")),
            )
            .entity(
                EntityMeta::new("Note")
                    .add_attribute(AttributeInfo::scalar("text"))
                    .add_attribute(AttributeInfo::to_one("author", "Person")),
            )
            .build()
            .unwrap();
        Arc::new(schema)
    }

    fn seeded() -> (Arc<Rows>, Graph, Arc<Schema>) {
        let rows = Arc::new(Rows::default());
        rows.put(
            "Person",
            1,
            &[
                ("name", Value::from("Ann")),
                ("email", Value::from("ann@example.org")),
                ("partner", Value::BigInt(2)),
            ],
        );
        rows.put(
            "Person",
            2,
            &[("name", Value::from("Bo")), ("partner", Value::BigInt(1))],
        );
        rows.put(
            "Note",
            10,
            &[("text", Value::from("hello")), ("author", Value::BigInt(1))],
        );

        let schema = schema();
        let mut graph = Graph::default();
        graph.set_link(Some(ContextLink::new(
            1,
            Arc::clone(&rows) as Arc<dyn Storage>,
            Arc::clone(&schema),
            TransactionId::new(1),
            true,
        )));
        (rows, graph, schema)
    }

    fn person(schema: &Schema) -> Arc<EntityMeta> {
        Arc::clone(schema.require("Person").unwrap())
    }

    fn name_view() -> View {
        View::new("Person")
            .add_property("name")
            .load_partial_entities(true)
    }

    #[test]
    fn test_unlinked_graph_is_rejected() {
        let mut graph = Graph::default();
        assert!(matches!(Loader::new(&mut graph), Err(Error::Transaction(_))));
    }

    #[test]
    fn test_view_load_projects_and_stubs_references() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let view = name_view().add_reference("partner", View::new("Person"));
        let ann = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &Identity::from(1), Some(&view))
            .unwrap()
            .unwrap();

        let node = graph.node(ann).unwrap();
        assert!(node.is_available("name"));
        assert!(!node.is_available("email"));
        let Some(Slot::ToOne(Some(partner))) = node.slot("partner") else {
            panic!("partner not loaded");
        };
        let partner = graph.node(*partner).unwrap();
        assert_eq!(partner.id(), &Identity::from(2));
        assert!(!partner.is_available("name"));
        assert_eq!(rows.selects(), 1);
    }

    #[test]
    fn test_existing_tracked_node_is_extended() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let id = Identity::from(1);
        let first = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &id, Some(&name_view()))
            .unwrap()
            .unwrap();
        graph
            .node_mut(first)
            .unwrap()
            .store_written("name", Slot::Scalar(Value::from("Annie")));

        let wider = name_view().add_property("email").add_property("notes");
        let second = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &id, Some(&wider))
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(rows.selects(), 2);
        assert_eq!(rows.related(), 1);
        let node = graph.node(first).unwrap();
        let group = node.fetch_group().unwrap();
        assert!(group.contains("email"));
        assert!(group.contains("notes"));
        // Only the missing column was selected, the pending write survives.
        assert_eq!(node.slot("name"), Some(&Slot::Scalar(Value::from("Annie"))));
        assert_eq!(
            node.slot("email"),
            Some(&Slot::Scalar(Value::from("ann@example.org")))
        );
        let Some(Slot::ToMany(notes)) = node.slot("notes") else {
            panic!("notes not loaded");
        };
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn test_covered_view_does_not_read() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let id = Identity::from(2);
        let mut loader = Loader::new(&mut graph).unwrap();
        let first = loader.load(&meta, &id, Some(&name_view())).unwrap();
        let second = loader.load(&meta, &id, Some(&name_view())).unwrap();
        assert_eq!(first, second);
        assert_eq!(rows.selects(), 1);
    }

    #[test]
    fn test_untracked_cycle_ends_at_identity_map() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let ann = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &Identity::from(1), None)
            .unwrap()
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(rows.selects(), 2);
        let Some(Slot::ToOne(Some(bo))) = graph.node(ann).unwrap().slot("partner") else {
            panic!("partner not loaded");
        };
        let bo = graph.node(*bo).unwrap();
        assert!(bo.fetch_group().is_none());
        assert_eq!(bo.slot("name"), Some(&Slot::Scalar(Value::from("Bo"))));
        assert_eq!(bo.slot("partner"), Some(&Slot::ToOne(Some(ann))));
        // Collections stay lazy.
        assert!(bo.slot("notes").is_none());
        assert_eq!(rows.related(), 0);
    }

    #[test]
    fn test_ensure_stub_reuses_existing_node() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let id = Identity::from(1);
        let mut loader = Loader::new(&mut graph).unwrap();
        let loaded = loader.load(&meta, &id, Some(&name_view())).unwrap().unwrap();
        let stub = loader.ensure_stub(&meta, &id);
        assert_eq!(stub, loaded);

        let fresh = loader.ensure_stub(&meta, &Identity::from(5));
        assert_ne!(fresh, loaded);
        assert_eq!(loader.ensure_stub(&meta, &Identity::from(5)), fresh);
        drop(loader);

        let node = graph.node(fresh).unwrap();
        assert!(node.state().is_managed());
        assert_eq!(node.fetch_group().unwrap().len(), 1);
        assert_eq!(graph.len(), 2);
        assert_eq!(rows.selects(), 1);
    }

    #[test]
    fn test_pending_insert_is_never_selected() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let id = Identity::from(7);
        let mut node = Node::new(Arc::clone(&meta), id.clone(), EntityState::Managed, None);
        node.put_slot("name", Slot::Scalar(Value::from("Cy")));
        let pending = graph.insert(node);
        graph.register(EntityKey::new("Person", 7), pending);

        let view = name_view().add_property("email").add_property("notes");
        let found = Loader::new(&mut graph)
            .unwrap()
            .with_pending_inserts([pending])
            .load(&meta, &id, Some(&view))
            .unwrap();

        assert_eq!(found, Some(pending));
        assert_eq!(rows.selects(), 0);
        assert_eq!(rows.related(), 1);
        let node = graph.node(pending).unwrap();
        assert_eq!(node.slot("name"), Some(&Slot::Scalar(Value::from("Cy"))));
        assert_eq!(node.slot("notes"), Some(&Slot::ToMany(Vec::new())));
    }

    #[test]
    fn test_vanished_row_is_not_found() {
        let (rows, mut graph, schema) = seeded();
        let meta = person(&schema);
        let id = Identity::from(2);
        let bo = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &id, Some(&name_view()))
            .unwrap()
            .unwrap();
        rows.drop_row("Person", 2);

        let wider = name_view().add_property("email");
        let err = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &id, Some(&wider))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(ref e) if e.kind == StorageErrorKind::NotFound
        ));
        assert!(err.to_string().contains("Person[2]"));
        assert!(!graph.node(bo).unwrap().is_available("email"));

        // Unknown identities are simply absent.
        let missing = Loader::new(&mut graph)
            .unwrap()
            .load(&meta, &Identity::from(3), Some(&name_view()))
            .unwrap();
        assert!(missing.is_none());
    }
}
