//! Transactional in-memory storage engine for EntityView.
//!
//! `MemoryStorage` keeps one table per entity type, keyed by identity. Each
//! open transaction writes into a private overlay that is applied to the
//! committed tables on commit and discarded on rollback. Reads inside a
//! transaction see committed rows plus the transaction's own writes.
//!
//! The engine enforces the constraints a relational store would:
//!
//! - primary key uniqueness
//! - NOT NULL for attributes declared non-nullable
//! - foreign key existence for to-one references
//! - restrict-on-delete while other rows still reference a row
//!
//! It also counts every call it serves (see [`StorageStats`]), which lets
//! tests assert that an operation did or did not touch storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use entityview_core::{
    AttributeInfo, AttributeKind, EntityMeta, Error, Identity, Projection, Result, Row, Schema,
    Storage, StorageErrorKind, TransactionId, Value,
};

/// One stored row, identity excluded.
pub type Record = BTreeMap<String, Value>;

/// Counters of the calls served by a [`MemoryStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub selects: u64,
    pub related_selects: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl StorageStats {
    /// Total number of read calls.
    pub fn reads(&self) -> u64 {
        self.selects + self.related_selects
    }

    /// Total number of write calls.
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

type Table = BTreeMap<Identity, Record>;

/// Pending writes of one transaction. `None` marks a deleted row.
#[derive(Debug, Default)]
struct Overlay {
    writes: HashMap<(String, Identity), Option<Record>>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    open: HashMap<TransactionId, Overlay>,
    next_tx: u64,
    stats: StorageStats,
    fail_next_commit: bool,
}

impl State {
    fn overlay(&self, tx: TransactionId) -> Result<&Overlay> {
        self.open.get(&tx).ok_or_else(|| unknown_tx(tx))
    }

    fn overlay_mut(&mut self, tx: TransactionId) -> Result<&mut Overlay> {
        self.open.get_mut(&tx).ok_or_else(|| unknown_tx(tx))
    }

    /// Row as seen from inside `tx`.
    fn visible(&self, tx: TransactionId, entity: &str, id: &Identity) -> Result<Option<Record>> {
        let overlay = self.overlay(tx)?;
        if let Some(pending) = overlay.writes.get(&(entity.to_string(), id.clone())) {
            return Ok(pending.clone());
        }
        Ok(self
            .tables
            .get(entity)
            .and_then(|table| table.get(id))
            .cloned())
    }

    /// Every row of `entity` visible from inside `tx`, ordered by identity.
    fn visible_rows(&self, tx: TransactionId, entity: &str) -> Result<Table> {
        let overlay = self.overlay(tx)?;
        let mut rows = self.tables.get(entity).cloned().unwrap_or_default();
        for ((table, id), pending) in &overlay.writes {
            if table != entity {
                continue;
            }
            match pending {
                Some(record) => {
                    rows.insert(id.clone(), record.clone());
                }
                None => {
                    rows.remove(id);
                }
            }
        }
        Ok(rows)
    }
}

fn unknown_tx(tx: TransactionId) -> Error {
    Error::storage(
        StorageErrorKind::Transaction,
        format!("transaction {} is not open", tx),
    )
}

fn constraint(message: String) -> Error {
    Error::storage(StorageErrorKind::Constraint, message)
}

/// Transactional in-memory [`Storage`] implementation.
#[derive(Debug)]
pub struct MemoryStorage {
    schema: Arc<Schema>,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            state: Mutex::new(State::default()),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a committed row directly, bypassing transactions.
    ///
    /// Only primary key uniqueness is checked, so fixtures can be loaded in
    /// any order.
    pub fn seed<I, S>(&self, entity: &str, id: impl Into<Identity>, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let meta = self.schema.require(entity)?;
        let id = id.into();
        let record: Record = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for name in record.keys() {
            meta.require(name)?;
        }
        let mut state = self.lock();
        let table = state.tables.entry(entity.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(constraint(format!("duplicate key {}[{}]", entity, id)));
        }
        tracing::trace!(entity, id = %id, "Seeding row");
        table.insert(id, record);
        Ok(())
    }

    /// Committed content of one row.
    pub fn row(&self, entity: &str, id: impl Into<Identity>) -> Option<Record> {
        let id = id.into();
        self.lock()
            .tables
            .get(entity)
            .and_then(|table| table.get(&id))
            .cloned()
    }

    /// Number of committed rows of `entity`.
    pub fn count(&self, entity: &str) -> usize {
        self.lock().tables.get(entity).map_or(0, BTreeMap::len)
    }

    pub fn stats(&self) -> StorageStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = StorageStats::default();
    }

    /// Number of transactions begun and not yet finished.
    pub fn open_transactions(&self) -> usize {
        self.lock().open.len()
    }

    /// Make the next commit fail with a transaction error.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }

    /// NOT NULL and foreign key checks for the given attribute values.
    fn check_values(
        &self,
        state: &State,
        tx: TransactionId,
        meta: &EntityMeta,
        id: &Identity,
        record: &Record,
        attributes: &[&AttributeInfo],
    ) -> Result<()> {
        for attr in attributes {
            let value = record.get(&attr.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !attr.nullable {
                    return Err(constraint(format!(
                        "{}.{} of {}[{}] must not be null",
                        meta.name(),
                        attr.name,
                        meta.name(),
                        id
                    )));
                }
                continue;
            }
            if let AttributeKind::ToOne { target } = &attr.kind {
                let fk = Identity::from_value(value)?.ok_or_else(|| {
                    constraint(format!("{}.{} holds no identity", meta.name(), attr.name))
                })?;
                if state.visible(tx, target, &fk)?.is_none() {
                    return Err(constraint(format!(
                        "{}.{} of {}[{}] references missing {}[{}]",
                        meta.name(),
                        attr.name,
                        meta.name(),
                        id,
                        target,
                        fk
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn begin(&self) -> Result<TransactionId> {
        let mut state = self.lock();
        state.next_tx += 1;
        let tx = TransactionId::new(state.next_tx);
        state.open.insert(tx, Overlay::default());
        tracing::debug!(tx = %tx, "Transaction started");
        Ok(tx)
    }

    fn select(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        projection: &Projection,
    ) -> Result<Option<Row>> {
        let mut state = self.lock();
        state.stats.selects += 1;
        let Some(record) = state.visible(tx, entity.name(), id)? else {
            return Ok(None);
        };
        let mut names = Vec::with_capacity(projection.len());
        let mut values = Vec::with_capacity(projection.len());
        for name in projection.names() {
            entity.require(name)?;
            names.push(name.to_string());
            values.push(record.get(name).cloned().unwrap_or(Value::Null));
        }
        tracing::trace!(
            tx = %tx,
            entity = %entity.name(),
            id = %id,
            columns = names.len(),
            "select"
        );
        Ok(Some(Row::new(names, values)))
    }

    fn select_related(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        attribute: &AttributeInfo,
        owner: &Identity,
    ) -> Result<Vec<Identity>> {
        let AttributeKind::ToMany { target, mapped_by } = &attribute.kind else {
            return Err(Error::storage(
                StorageErrorKind::Engine,
                format!("{}.{} is not a collection", entity.name(), attribute.name),
            ));
        };
        let mut state = self.lock();
        state.stats.related_selects += 1;
        let rows = state.visible_rows(tx, target)?;
        let mut related = Vec::new();
        for (id, record) in rows {
            let points_here = match record.get(mapped_by) {
                Some(value) => Identity::from_value(value)?.as_ref() == Some(owner),
                None => false,
            };
            if points_here {
                related.push(id);
            }
        }
        tracing::trace!(
            tx = %tx,
            entity = %entity.name(),
            attribute = %attribute.name,
            owner = %owner,
            found = related.len(),
            "select related"
        );
        Ok(related)
    }

    fn insert(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        values: &[(String, Value)],
    ) -> Result<()> {
        let mut state = self.lock();
        state.stats.inserts += 1;
        if state.visible(tx, entity.name(), id)?.is_some() {
            return Err(constraint(format!(
                "duplicate key {}[{}]",
                entity.name(),
                id
            )));
        }
        let mut record = Record::new();
        for (name, value) in values {
            let attr = entity.require(name)?;
            if attr.is_to_many() || entity.is_identity(name) {
                continue;
            }
            record.insert(name.clone(), value.clone());
        }
        let columns: Vec<&AttributeInfo> = entity
            .attributes()
            .iter()
            .filter(|a| !a.is_to_many() && !entity.is_identity(&a.name))
            .collect();
        self.check_values(&state, tx, entity, id, &record, &columns)?;

        tracing::trace!(tx = %tx, entity = %entity.name(), id = %id, "insert");
        state
            .overlay_mut(tx)?
            .writes
            .insert((entity.name().to_string(), id.clone()), Some(record));
        Ok(())
    }

    fn update(
        &self,
        tx: TransactionId,
        entity: &EntityMeta,
        id: &Identity,
        values: &[(String, Value)],
    ) -> Result<u64> {
        let mut state = self.lock();
        state.stats.updates += 1;
        let Some(mut record) = state.visible(tx, entity.name(), id)? else {
            return Ok(0);
        };
        let mut changed = Vec::with_capacity(values.len());
        for (name, value) in values {
            let attr = entity.require(name)?;
            if attr.is_to_many() || entity.is_identity(name) {
                continue;
            }
            record.insert(name.clone(), value.clone());
            changed.push(attr);
        }
        self.check_values(&state, tx, entity, id, &record, &changed)?;

        tracing::trace!(
            tx = %tx,
            entity = %entity.name(),
            id = %id,
            attributes = changed.len(),
            "update"
        );
        state
            .overlay_mut(tx)?
            .writes
            .insert((entity.name().to_string(), id.clone()), Some(record));
        Ok(1)
    }

    fn delete(&self, tx: TransactionId, entity: &EntityMeta, id: &Identity) -> Result<u64> {
        let mut state = self.lock();
        state.stats.deletes += 1;
        if state.visible(tx, entity.name(), id)?.is_none() {
            return Ok(0);
        }

        for meta in self.schema.entities() {
            for reference in meta.to_one_references() {
                if reference.target() != Some(entity.name()) {
                    continue;
                }
                for (other, record) in state.visible_rows(tx, meta.name())? {
                    let Some(value) = record.get(&reference.name) else {
                        continue;
                    };
                    if Identity::from_value(value)?.as_ref() == Some(id) {
                        return Err(constraint(format!(
                            "{}[{}] is still referenced by {}[{}].{}",
                            entity.name(),
                            id,
                            meta.name(),
                            other,
                            reference.name
                        )));
                    }
                }
            }
        }

        tracing::trace!(tx = %tx, entity = %entity.name(), id = %id, "delete");
        state
            .overlay_mut(tx)?
            .writes
            .insert((entity.name().to_string(), id.clone()), None);
        Ok(1)
    }

    fn commit(&self, tx: TransactionId) -> Result<()> {
        let mut state = self.lock();
        if state.fail_next_commit {
            state.fail_next_commit = false;
            return Err(Error::storage(
                StorageErrorKind::Transaction,
                format!("commit of {} was refused", tx),
            ));
        }
        let overlay = state.open.remove(&tx).ok_or_else(|| unknown_tx(tx))?;
        state.stats.commits += 1;
        let writes = overlay.writes.len();
        for ((entity, id), pending) in overlay.writes {
            let table = state.tables.entry(entity).or_default();
            match pending {
                Some(record) => {
                    table.insert(id, record);
                }
                None => {
                    table.remove(&id);
                }
            }
        }
        tracing::debug!(tx = %tx, writes, "Transaction committed");
        Ok(())
    }

    fn rollback(&self, tx: TransactionId) -> Result<()> {
        let mut state = self.lock();
        let overlay = state.open.remove(&tx).ok_or_else(|| unknown_tx(tx))?;
        state.stats.rollbacks += 1;
        tracing::debug!(tx = %tx, discarded = overlay.writes.len(), "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .entity(
                    EntityMeta::new("Group")
                        .add_attribute(AttributeInfo::scalar("name").nullable(false))
                        .add_attribute(AttributeInfo::to_many("users", "User", "group")),
                )
                .entity(
                    EntityMeta::new("User")
                        .add_attribute(AttributeInfo::scalar("login"))
                        .add_attribute(AttributeInfo::to_one("group", "Group")),
                )
                .build()
                .unwrap(),
        )
    }

    fn storage() -> MemoryStorage {
        let storage = MemoryStorage::new(schema());
        storage
            .seed("Group", 1, [("name", Value::from("admins"))])
            .unwrap();
        storage
            .seed(
                "User",
                10,
                [
                    ("login", Value::from("admin")),
                    ("group", Identity::Int(1).to_value()),
                ],
            )
            .unwrap();
        storage
    }

    fn meta(storage: &MemoryStorage, name: &str) -> Arc<EntityMeta> {
        Arc::clone(storage.schema().require(name).unwrap())
    }

    #[test]
    fn test_projected_select() {
        let storage = storage();
        let user = meta(&storage, "User");
        let tx = storage.begin().unwrap();
        let row = storage
            .select(tx, &user, &Identity::Int(10), &Projection::new().with("login"))
            .unwrap()
            .unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row.get_by_name("login"), Some(&Value::from("admin")));
        assert!(!row.contains_column("group"));

        let missing = storage
            .select(tx, &user, &Identity::Int(99), &Projection::new())
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(storage.stats().selects, 2);
    }

    #[test]
    fn test_overlay_isolation_and_commit() {
        let storage = storage();
        let user = meta(&storage, "User");
        let tx = storage.begin().unwrap();
        storage
            .insert(
                tx,
                &user,
                &Identity::Int(11),
                &[("login".to_string(), Value::from("guest"))],
            )
            .unwrap();
        assert!(storage.row("User", 11).is_none());
        let seen = storage
            .select(tx, &user, &Identity::Int(11), &Projection::new().with("login"))
            .unwrap();
        assert!(seen.is_some());

        storage.commit(tx).unwrap();
        assert_eq!(
            storage.row("User", 11).unwrap().get("login"),
            Some(&Value::from("guest"))
        );
        assert_eq!(storage.open_transactions(), 0);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let storage = storage();
        let user = meta(&storage, "User");
        let tx = storage.begin().unwrap();
        let updated = storage
            .update(
                tx,
                &user,
                &Identity::Int(10),
                &[("login".to_string(), Value::from("root"))],
            )
            .unwrap();
        assert_eq!(updated, 1);
        storage.rollback(tx).unwrap();
        assert_eq!(
            storage.row("User", 10).unwrap().get("login"),
            Some(&Value::from("admin"))
        );
        assert!(storage.commit(tx).is_err());
    }

    #[test]
    fn test_constraints() {
        let storage = storage();
        let user = meta(&storage, "User");
        let group = meta(&storage, "Group");
        let tx = storage.begin().unwrap();

        let duplicate = storage.insert(tx, &user, &Identity::Int(10), &[]);
        assert!(duplicate.unwrap_err().is_constraint_violation());

        let dangling = storage.insert(
            tx,
            &user,
            &Identity::Int(12),
            &[("group".to_string(), Identity::Int(7).to_value())],
        );
        assert!(dangling.unwrap_err().is_constraint_violation());

        let not_null = storage.insert(tx, &group, &Identity::Int(2), &[]);
        assert!(not_null.unwrap_err().is_constraint_violation());

        let referenced = storage.delete(tx, &group, &Identity::Int(1));
        assert!(referenced.unwrap_err().is_constraint_violation());

        assert_eq!(storage.delete(tx, &user, &Identity::Int(10)).unwrap(), 1);
        assert_eq!(storage.delete(tx, &group, &Identity::Int(1)).unwrap(), 1);
        assert_eq!(storage.delete(tx, &group, &Identity::Int(1)).unwrap(), 0);
    }

    #[test]
    fn test_select_related_follows_mapped_by() {
        let storage = storage();
        storage
            .seed(
                "User",
                11,
                [
                    ("login", Value::from("guest")),
                    ("group", Identity::Int(1).to_value()),
                ],
            )
            .unwrap();
        storage.seed("User", 12, [("login", Value::from("other"))]).unwrap();
        let group = meta(&storage, "Group");
        let users = group.require("users").unwrap().clone();
        let tx = storage.begin().unwrap();
        let related = storage
            .select_related(tx, &group, &users, &Identity::Int(1))
            .unwrap();
        assert_eq!(related, vec![Identity::Int(10), Identity::Int(11)]);
    }

    #[test]
    fn test_unknown_transaction() {
        let storage = storage();
        let user = meta(&storage, "User");
        let err = storage
            .select(TransactionId::new(42), &user, &Identity::Int(10), &Projection::new())
            .unwrap_err();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_refused_commit_keeps_transaction_open() {
        let storage = storage();
        let tx = storage.begin().unwrap();
        storage.fail_next_commit();
        assert!(storage.commit(tx).is_err());
        assert_eq!(storage.open_transactions(), 1);
        storage.rollback(tx).unwrap();
        assert_eq!(storage.stats().rollbacks, 1);
    }
}
