//! Application-facing operations on a persistence context.

use entityview_core::{Entity, EntityModel, Identity, ReferenceId, Result, View, reference_id};

use crate::ContextDebugInfo;
use crate::context::PersistenceContext;
use crate::flush::FlushResult;

/// Borrowed handle for working with the entities of one transaction.
///
/// Obtained from [`Transaction::entity_manager`](crate::Transaction::entity_manager).
pub struct EntityManager<'a> {
    context: &'a mut PersistenceContext,
}

impl<'a> EntityManager<'a> {
    pub fn new(context: &'a mut PersistenceContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &PersistenceContext {
        &*self.context
    }

    /// Find an instance by identity, loading the attributes `view` names.
    ///
    /// Returns `Ok(None)` when no row matches.
    pub fn find(
        &mut self,
        entity: &str,
        id: impl Into<Identity>,
        view: Option<&View>,
    ) -> Result<Option<Entity>> {
        self.context.find(entity, id, view)
    }

    /// Typed [`find`](Self::find).
    pub fn find_as<M: EntityModel>(
        &mut self,
        id: impl Into<Identity>,
        view: Option<&View>,
    ) -> Result<Option<M>> {
        self.context
            .find(M::ENTITY, id, view)?
            .map(M::cast)
            .transpose()
    }

    /// Find several instances; identities without a row are skipped.
    pub fn find_many<I>(&mut self, entity: &str, ids: I, view: Option<&View>) -> Result<Vec<Entity>>
    where
        I: IntoIterator,
        I::Item: Into<Identity>,
    {
        let mut found = Vec::new();
        for id in ids {
            if let Some(e) = self.context.find(entity, id, view)? {
                found.push(e);
            }
        }
        Ok(found)
    }

    /// Fetch the instance with the identity of `entity` through `view`.
    ///
    /// For a managed instance this extends it in place. For a detached one
    /// it yields this context's instance; the input is left untouched.
    pub fn reload(&mut self, entity: &Entity, view: Option<&View>) -> Result<Option<Entity>> {
        self.context
            .find(entity.entity_name(), entity.id().clone(), view)
    }

    /// Managed instance that only knows its identity, without touching storage.
    pub fn get_reference(&mut self, entity: &str, id: impl Into<Identity>) -> Result<Entity> {
        self.context.get_reference(entity, id)
    }

    /// Construct a new instance and persist it.
    pub fn create(&mut self, entity: &str, id: impl Into<Identity>) -> Result<Entity> {
        let meta = std::sync::Arc::clone(self.context.schema().require(entity)?);
        let created = Entity::new(&meta, id);
        self.context.persist(&created)?;
        Ok(created)
    }

    pub fn persist(&mut self, entity: &Entity) -> Result<()> {
        self.context.persist(entity)
    }

    /// Reconcile a detached instance; returns the managed instance.
    pub fn merge(&mut self, entity: &Entity) -> Result<Entity> {
        self.context.merge(entity)
    }

    pub fn remove(&mut self, entity: &Entity) -> Result<()> {
        self.context.remove(entity)
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.context.contains(entity)
    }

    pub fn flush(&mut self) -> Result<FlushResult> {
        self.context.flush()
    }

    /// Foreign key of a to-one attribute without loading the target.
    pub fn reference_id(&self, entity: &Entity, attribute: &str) -> Result<ReferenceId> {
        reference_id(entity, attribute)
    }

    pub fn is_loaded(&self, entity: &Entity, attribute: &str) -> bool {
        entity.is_loaded(attribute)
    }

    pub fn dirty_attributes(&self, entity: &Entity) -> Vec<String> {
        entity.dirty_attributes()
    }

    pub fn debug_state(&self) -> ContextDebugInfo {
        ContextDebugInfo::of(&*self.context)
    }
}
