//! Declarative fetch specifications.
//!
//! A [`View`] names the attributes of an entity type that a load must
//! populate. Reference attributes may carry a nested view describing what to
//! load on the referenced type, so a view describes a finite tree of the
//! object graph.
//!
//! Views are immutable values once built. They are cheap to clone (nested
//! views are shared through `Arc`) and can be used by any number of
//! concurrent loads.
//!
//! # Example
//!
//! ```ignore
//! let view = View::new("User")
//!     .add_property("login")
//!     .add_reference("group", View::new("Group").add_property("name"))
//!     .load_partial_entities(true);
//!
//! let user = em.find("User", user_id, Some(&view))?;
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::{Error, SchemaErrorKind};
use crate::schema::{AttributeKind, EntityMeta, Schema};

/// Hint to the storage engine about how a reference should be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchMode {
    /// Let the storage engine decide.
    #[default]
    Auto,
    /// Fetch in the same statement as the owner.
    Join,
    /// No preference recorded.
    Undefined,
}

/// One entry of a view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewProperty {
    name: String,
    view: Option<Arc<View>>,
    fetch_mode: FetchMode,
    cacheable: bool,
}

impl ViewProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nested view for reference attributes.
    pub fn view(&self) -> Option<&View> {
        self.view.as_deref()
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch_mode
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }
}

/// Declarative, recursive specification of which attributes to load.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    entity: String,
    name: Option<String>,
    properties: Vec<ViewProperty>,
    load_partial_entities: bool,
    include_system_properties: bool,
}

impl View {
    /// Create an empty view of `entity` that includes system properties.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            name: None,
            properties: Vec::new(),
            load_partial_entities: false,
            include_system_properties: true,
        }
    }

    /// View containing every non-system scalar attribute of `meta`.
    pub fn local(meta: &EntityMeta) -> Self {
        meta.scalars()
            .filter(|a| !a.system)
            .fold(Self::new(meta.name()).named("_local"), |view, attr| {
                view.add_property(attr.name.clone())
            })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn include_system_properties(mut self, value: bool) -> Self {
        self.include_system_properties = value;
        self
    }

    /// When true, every attribute outside the view (scalars included) is left
    /// unfetched. When false only references are subject to lazy loading.
    pub fn load_partial_entities(mut self, value: bool) -> Self {
        self.load_partial_entities = value;
        self
    }

    pub fn add_property(self, name: impl Into<String>) -> Self {
        self.add_property_with(name, None, FetchMode::Auto)
    }

    pub fn add_reference(self, name: impl Into<String>, view: View) -> Self {
        self.add_property_with(name, Some(view), FetchMode::Auto)
    }

    /// Add a property, replacing an existing entry with the same name in place.
    pub fn add_property_with(
        self,
        name: impl Into<String>,
        view: Option<View>,
        fetch_mode: FetchMode,
    ) -> Self {
        self.push(ViewProperty {
            name: name.into(),
            view: view.map(Arc::new),
            fetch_mode,
            cacheable: false,
        })
    }

    /// Like [`View::add_property_with`] but flags the reference as cacheable.
    pub fn add_property_cacheable(
        self,
        name: impl Into<String>,
        view: Option<View>,
        fetch_mode: FetchMode,
    ) -> Self {
        self.push(ViewProperty {
            name: name.into(),
            view: view.map(Arc::new),
            fetch_mode,
            cacheable: true,
        })
    }

    fn push(mut self, property: ViewProperty) -> Self {
        if let Some(existing) = self
            .properties
            .iter_mut()
            .find(|p| p.name == property.name)
        {
            *existing = property;
        } else {
            self.properties.push(property);
        }
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn properties(&self) -> &[ViewProperty] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&ViewProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn is_load_partial_entities(&self) -> bool {
        self.load_partial_entities
    }

    pub fn is_include_system_properties(&self) -> bool {
        self.include_system_properties
    }

    /// Check every property (recursively) against the schema.
    ///
    /// Errors name the full attribute path, e.g. `User.group.nme`.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let meta = schema.require(&self.entity)?;
        self.validate_at(schema, meta, &self.entity)
    }

    fn validate_at(&self, schema: &Schema, meta: &EntityMeta, path: &str) -> Result<()> {
        for property in &self.properties {
            let here = format!("{}.{}", path, property.name);
            let attr = meta.attribute(&property.name).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::AttributeNotFound,
                    format!("view property {} does not exist", here),
                )
            })?;
            match (&attr.kind, property.view()) {
                (AttributeKind::Scalar, Some(_)) => {
                    return Err(Error::schema(
                        SchemaErrorKind::KindMismatch,
                        format!("view property {} is scalar but has a nested view", here),
                    ));
                }
                (AttributeKind::Scalar, None) => {}
                (
                    AttributeKind::ToOne { target } | AttributeKind::ToMany { target, .. },
                    nested,
                ) => {
                    if let Some(nested) = nested {
                        if nested.entity != *target {
                            return Err(Error::schema(
                                SchemaErrorKind::KindMismatch,
                                format!(
                                    "nested view of {} is for {} but the attribute targets {}",
                                    here, nested.entity, target
                                ),
                            ));
                        }
                        let target_meta = schema.require(target)?;
                        nested.validate_at(schema, target_meta, &here)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        if let Some(name) = &self.name {
            write!(f, "/{}", name)?;
        }
        write!(f, " {{")?;
        for (i, property) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", property.name)?;
            if let Some(nested) = property.view() {
                write!(f, " {{")?;
                for (j, inner) in nested.properties.iter().enumerate() {
                    if j > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}", inner.name)?;
                    if inner.view.is_some() {
                        write!(f, " {{..}}")?;
                    }
                }
                write!(f, " }}")?;
            }
        }
        write!(f, " }}")
    }
}
