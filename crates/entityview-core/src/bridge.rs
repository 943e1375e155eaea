//! Carrying entities across process boundaries.
//!
//! [`SerializationBridge::capture`] turns an entity and everything reachable
//! from it through populated references into an [`EntityEnvelope`]: a flat,
//! serde-friendly list of node records that keeps each instance's state,
//! fetch group and dirty set next to its attribute values. References are
//! stored as positions in that list, so shared and cyclic references survive
//! the trip.
//!
//! [`SerializationBridge::restore`] rebuilds the instances in a fresh arena.
//! Managed and removed instances come back detached with frozen fetch groups,
//! which keeps attribute gating and reference-id answers identical on both
//! sides of the boundary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::entity::Entity;
use crate::error::Error;
use crate::fetch_group::FetchGroup;
use crate::graph::{Graph, GraphRef, Node, NodeId, Slot};
use crate::identity::Identity;
use crate::schema::{AttributeKind, Schema};
use crate::state::{EntityState, LifecycleEvent};
use crate::value::Value;

/// Version written into every envelope.
pub const ENVELOPE_FORMAT: u32 = 1;

/// Transport-neutral form of a captured object graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEnvelope {
    pub format: u32,
    /// Position of the captured entity in `nodes`.
    pub root: usize,
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub entity: String,
    pub id: Identity,
    pub state: EntityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_group: Option<FetchGroup>,
    pub values: BTreeMap<String, SlotRecord>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dirty: BTreeSet<String>,
}

/// Attribute value of a [`NodeRecord`]; references are node positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotRecord {
    Scalar(Value),
    ToOne(Option<usize>),
    ToMany(Vec<usize>),
}

/// Captures and restores entities together with their tracking metadata.
#[derive(Debug, Clone)]
pub struct SerializationBridge {
    schema: Arc<Schema>,
}

impl SerializationBridge {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Capture `entity` and every instance reachable from it.
    pub fn capture(&self, entity: &Entity) -> Result<EntityEnvelope> {
        entity.with_graph(|graph, root| {
            let order = graph.reachable_from(root)?;
            let positions: HashMap<NodeId, usize> =
                order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            let nodes = order
                .iter()
                .map(|id| record(graph, *id, &positions))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(
                key = %entity.key(),
                nodes = nodes.len(),
                "Captured entity graph"
            );
            Ok(EntityEnvelope {
                format: ENVELOPE_FORMAT,
                root: 0,
                nodes,
            })
        })
    }

    /// Rebuild the captured graph in a new arena and return its root.
    pub fn restore(&self, envelope: &EntityEnvelope) -> Result<Entity> {
        if envelope.format != ENVELOPE_FORMAT {
            return Err(Error::Serde(format!(
                "unsupported envelope format {} (expected {})",
                envelope.format, ENVELOPE_FORMAT
            )));
        }

        let graph = GraphRef::new();
        let ids = graph.with_mut(|g| self.rebuild(g, &envelope.nodes))?;
        let root = ids
            .get(envelope.root)
            .copied()
            .ok_or_else(|| Error::Serde("envelope has no root node".to_string()))?;
        tracing::debug!(nodes = ids.len(), "Restored entity graph");
        Entity::attach(&graph, root)
    }

    fn rebuild(&self, graph: &mut Graph, records: &[NodeRecord]) -> Result<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let meta = self.schema.entity(&record.entity).ok_or_else(|| {
                Error::Serde(format!("unknown entity type {}", record.entity))
            })?;
            let state = record.state.apply(LifecycleEvent::Deserialize, meta.name())?;
            let mut fetch_group = record.fetch_group.clone();
            if !state.is_new() {
                if let Some(group) = &mut fetch_group {
                    group.freeze();
                }
            }
            ids.push(graph.insert(Node::new(
                Arc::clone(meta),
                record.id.clone(),
                state,
                fetch_group,
            )));
        }

        let target = |position: usize, expected: &str| -> Result<NodeId> {
            match (records.get(position), ids.get(position)) {
                (Some(r), Some(id)) if r.entity == expected => Ok(*id),
                (Some(r), Some(_)) => Err(Error::Serde(format!(
                    "node {} is a {}, expected {}",
                    position, r.entity, expected
                ))),
                _ => Err(Error::Serde(format!("dangling node reference {}", position))),
            }
        };

        for (record, node_id) in records.iter().zip(&ids) {
            let meta = Arc::clone(graph.node(*node_id)?.meta());
            let mut slots = Vec::with_capacity(record.values.len());
            for (name, value) in &record.values {
                let info = meta.attribute(name).ok_or_else(|| {
                    Error::Serde(format!("{} has no attribute {}", meta.name(), name))
                })?;
                let slot = match (value, &info.kind) {
                    (SlotRecord::Scalar(v), AttributeKind::Scalar) => Slot::Scalar(v.clone()),
                    (SlotRecord::ToOne(t), AttributeKind::ToOne { target: expected }) => {
                        Slot::ToOne(t.map(|p| target(p, expected)).transpose()?)
                    }
                    (SlotRecord::ToMany(ts), AttributeKind::ToMany { target: expected, .. }) => {
                        Slot::ToMany(
                            ts.iter()
                                .map(|p| target(*p, expected))
                                .collect::<Result<_>>()?,
                        )
                    }
                    _ => {
                        return Err(Error::Serde(format!(
                            "value of {}.{} does not match its kind",
                            meta.name(),
                            name
                        )));
                    }
                };
                slots.push((name, slot));
            }

            let node = graph.node_mut(*node_id)?;
            for (name, slot) in slots {
                node.put_slot(name, slot);
            }
            for name in &record.dirty {
                node.mark_dirty(name);
            }
        }
        Ok(ids)
    }

    pub fn to_bytes(&self, entity: &Entity) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.capture(entity)?)?)
    }

    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Entity> {
        let envelope: EntityEnvelope = serde_json::from_slice(bytes)?;
        self.restore(&envelope)
    }

    /// Serialize and immediately deserialize `entity`.
    pub fn reserialize(&self, entity: &Entity) -> Result<Entity> {
        self.from_bytes(&self.to_bytes(entity)?)
    }
}

fn record(graph: &Graph, id: NodeId, positions: &HashMap<NodeId, usize>) -> Result<NodeRecord> {
    let position = |target: &NodeId| {
        positions
            .get(target)
            .copied()
            .ok_or_else(|| Error::Serde(format!("reference to uncaptured node {}", target)))
    };
    let node = graph.node(id)?;
    let mut values = BTreeMap::new();
    for (name, slot) in node.slots() {
        let value = match slot {
            Slot::Scalar(v) => SlotRecord::Scalar(v.clone()),
            Slot::ToOne(t) => SlotRecord::ToOne(t.as_ref().map(position).transpose()?),
            Slot::ToMany(ts) => SlotRecord::ToMany(ts.iter().map(position).collect::<Result<_>>()?),
        };
        values.insert(name.to_string(), value);
    }
    Ok(NodeRecord {
        entity: node.meta().name().to_string(),
        id: node.id().clone(),
        state: node.state(),
        fetch_group: node.fetch_group().cloned(),
        values,
        dirty: node.dirty().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReferenceIdErrorKind, UnfetchedReason};
    use crate::reference::reference_id;
    use crate::schema::{AttributeInfo, EntityMeta};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .entity(
                    EntityMeta::new("Group")
                        .add_attribute(AttributeInfo::scalar("name"))
                        .add_attribute(AttributeInfo::to_many("users", "User", "group")),
                )
                .entity(
                    EntityMeta::new("User")
                        .add_attribute(AttributeInfo::scalar("login"))
                        .add_attribute(AttributeInfo::scalar("name"))
                        .add_attribute(AttributeInfo::to_one("group", "Group")),
                )
                .build()
                .unwrap(),
        )
    }

    /// A user in the given state with fetch group `{id, login, group}`.
    fn tracked_user(schema: &Schema, state: EntityState) -> Entity {
        let user = Entity::new(schema.require("User").unwrap(), 1);
        let group = Entity::new(schema.require("Group").unwrap(), 10);
        user.set("login", "admin").unwrap();
        user.set_reference("group", Some(&group)).unwrap();
        user.with_graph(|g, n| {
            let node = g.node_mut(n).unwrap();
            node.set_fetch_group(Some(FetchGroup::new(["id", "login", "group"])));
            node.set_state(state);
        });
        group.with_graph(|g, n| {
            let node = g.node_mut(n).unwrap();
            node.set_fetch_group(Some(FetchGroup::new(["id"])));
            node.set_state(state);
        });
        user
    }

    #[test]
    fn test_round_trip_detaches_and_freezes() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = tracked_user(&schema, EntityState::Managed);

        let copy = bridge.reserialize(&user).unwrap();
        assert!(copy.is_detached());
        assert!(!copy.same_instance(&user));
        let group = copy.fetch_group().unwrap();
        assert!(group.is_frozen());
        assert!(group.contains("login"));

        assert_eq!(copy.get_as::<String>("login").unwrap(), "admin");
        let err = copy.get("name").unwrap_err();
        assert!(matches!(
            err,
            Error::UnfetchedAttribute(ref e) if e.reason == UnfetchedReason::NotManaged
        ));

        let target = copy.reference("group").unwrap().unwrap();
        assert!(target.is_detached());
        assert!(target.get("name").is_err());
    }

    #[test]
    fn test_reference_id_survives_round_trip() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = tracked_user(&schema, EntityState::Detached);

        let before = reference_id(&user, "group").unwrap();
        let copy = bridge.reserialize(&user).unwrap();
        let after = reference_id(&copy, "group").unwrap();
        assert_eq!(before, after);
        assert_eq!(after.value().unwrap(), Some(&Identity::Int(10)));
    }

    #[test]
    fn test_untracked_detached_stays_untracked() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = Entity::new(schema.require("User").unwrap(), 1);
        user.set("login", "admin").unwrap();
        user.with_graph(|g, n| g.node_mut(n).unwrap().set_state(EntityState::Managed));

        let copy = bridge.reserialize(&user).unwrap();
        assert!(copy.fetch_group().is_none());
        let err = reference_id(&copy, "group").unwrap_err();
        assert!(matches!(
            err,
            Error::ReferenceId(ref e) if e.kind == ReferenceIdErrorKind::Untracked
        ));
        assert_eq!(copy.get_as::<String>("login").unwrap(), "admin");
        assert!(copy.get("name").is_err());
    }

    #[test]
    fn test_new_instances_stay_new() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = Entity::new(schema.require("User").unwrap(), 5);
        let copy = bridge.reserialize(&user).unwrap();
        assert!(copy.is_new());
        assert_eq!(copy.get("name").unwrap(), Value::Null);
    }

    #[test]
    fn test_cycles_and_shared_targets() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let group = Entity::new(schema.require("Group").unwrap(), 10);
        let a = Entity::new(schema.require("User").unwrap(), 1);
        let b = Entity::new(schema.require("User").unwrap(), 2);
        a.set_reference("group", Some(&group)).unwrap();
        b.set_reference("group", Some(&group)).unwrap();
        group.with_graph(|g, n| {
            g.node_mut(n)
                .unwrap()
                .put_slot("users", Slot::ToMany(vec![a.node_id(), b.node_id()]));
        });

        let envelope = bridge.capture(&group).unwrap();
        assert_eq!(envelope.nodes.len(), 3);

        let copy = bridge.restore(&envelope).unwrap();
        let users = copy.collection("users").unwrap();
        assert_eq!(users.len(), 2);
        let back = users[1].reference("group").unwrap().unwrap();
        assert!(back.same_instance(&copy));
    }

    #[test]
    fn test_dirty_set_is_carried() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = tracked_user(&schema, EntityState::Managed);
        user.set("name", "Administrator").unwrap();
        assert_eq!(user.dirty_attributes(), vec!["name".to_string()]);

        let copy = bridge.reserialize(&user).unwrap();
        assert_eq!(copy.dirty_attributes(), vec!["name".to_string()]);
        assert_eq!(copy.get_as::<String>("name").unwrap(), "Administrator");
    }

    #[test]
    fn test_rejects_bad_envelopes() {
        let schema = schema();
        let bridge = SerializationBridge::new(Arc::clone(&schema));
        let user = tracked_user(&schema, EntityState::Managed);
        let envelope = bridge.capture(&user).unwrap();

        let mut wrong_format = envelope.clone();
        wrong_format.format = 99;
        assert!(matches!(bridge.restore(&wrong_format), Err(Error::Serde(_))));

        let mut unknown = envelope.clone();
        unknown.nodes[0].entity = "Robot".to_string();
        assert!(matches!(bridge.restore(&unknown), Err(Error::Serde(_))));

        let mut mismatched = envelope;
        let values = &mut mismatched.nodes[0].values;
        values.insert("login".to_string(), SlotRecord::ToOne(None));
        assert!(matches!(bridge.restore(&mismatched), Err(Error::Serde(_))));

        assert!(bridge.from_bytes(b"not json").is_err());
    }
}
