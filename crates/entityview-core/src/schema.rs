//! Entity type metadata.
//!
//! A [`Schema`] is the registry of every entity type the persistence layer
//! knows about. Each [`EntityMeta`] lists its attributes in declaration order
//! together with their [`AttributeKind`]:
//!
//! - `Scalar` attributes hold a [`Value`](crate::Value)
//! - `ToOne` attributes link to one instance of the target type (the owning
//!   side stores the foreign key)
//! - `ToMany` attributes are the inverse of a `ToOne` declared on the target
//!   type and are loaded by querying that foreign key
//!
//! # Example
//!
//! ```ignore
//! let schema = Schema::builder()
//!     .entity(EntityMeta::new("Group").add_attribute(AttributeInfo::scalar("name")))
//!     .entity(
//!         EntityMeta::new("User")
//!             .add_attribute(AttributeInfo::scalar("login").nullable(false))
//!             .add_attribute(AttributeInfo::to_one("group", "Group").nullable(false)),
//!     )
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::Result;
use crate::error::{Error, SchemaErrorKind};

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_$]*$";

fn identifier_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid identifier pattern");
                None
            }
        })
        .as_ref()
}

fn is_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// How an attribute is stored and loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    Scalar,
    ToOne { target: String },
    ToMany { target: String, mapped_by: String },
}

/// Metadata about one attribute of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: String,
    pub kind: AttributeKind,
    /// Whether the storage engine accepts NULL for this attribute
    pub nullable: bool,
    /// Identity, version and audit attributes
    pub system: bool,
}

impl AttributeInfo {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Scalar,
            nullable: true,
            system: false,
        }
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::ToOne {
                target: target.into(),
            },
            nullable: true,
            system: false,
        }
    }

    /// Inverse collection of the `mapped_by` reference declared on `target`.
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::ToMany {
                target: target.into(),
                mapped_by: mapped_by.into(),
            },
            nullable: true,
            system: false,
        }
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as a system attribute (implicitly loaded by views that include system properties).
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, AttributeKind::Scalar)
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, AttributeKind::ToOne { .. })
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind, AttributeKind::ToMany { .. })
    }

    /// Target entity type for reference attributes.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::Scalar => None,
            AttributeKind::ToOne { target } | AttributeKind::ToMany { target, .. } => Some(target),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            AttributeKind::Scalar => "scalar",
            AttributeKind::ToOne { .. } => "to-one reference",
            AttributeKind::ToMany { .. } => "to-many collection",
        }
    }
}

/// Metadata about one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMeta {
    name: String,
    id_attribute: String,
    attributes: Vec<AttributeInfo>,
}

impl EntityMeta {
    /// Create metadata for `name` with a system identity attribute called `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_attribute: "id".to_string(),
            attributes: vec![AttributeInfo::scalar("id").nullable(false).system()],
        }
    }

    /// Rename the identity attribute.
    pub fn id_attribute_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if let Some(attr) = self
            .attributes
            .iter_mut()
            .find(|a| a.name == self.id_attribute)
        {
            attr.name.clone_from(&name);
        }
        self.id_attribute = name;
        self
    }

    /// Append an attribute, replacing any previous declaration with the same name.
    pub fn add_attribute(mut self, info: AttributeInfo) -> Self {
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == info.name) {
            *existing = info;
        } else {
            self.attributes.push(info);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    pub fn is_identity(&self, attribute: &str) -> bool {
        self.id_attribute == attribute
    }

    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up an attribute, failing with a schema error naming the entity.
    pub fn require(&self, name: &str) -> Result<&AttributeInfo> {
        self.attribute(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::AttributeNotFound,
                format!("{} has no attribute '{}'", self.name, name),
            )
        })
    }

    /// Scalar attributes other than the identity.
    pub fn scalars(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.attributes
            .iter()
            .filter(|a| a.is_scalar() && a.name != self.id_attribute)
    }

    /// System attributes other than the identity.
    pub fn system_attributes(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.attributes
            .iter()
            .filter(|a| a.system && a.name != self.id_attribute)
    }

    pub fn to_one_references(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.attributes.iter().filter(|a| a.is_to_one())
    }
}

/// Registry of entity types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<String, Arc<EntityMeta>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntityMeta>> {
        self.entities.get(name)
    }

    /// Look up an entity type, failing with a schema error.
    pub fn require(&self, name: &str) -> Result<&Arc<EntityMeta>> {
        self.entities.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::EntityNotFound,
                format!("unknown entity type '{}'", name),
            )
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects entity types and validates them as a whole.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityMeta>,
}

impl SchemaBuilder {
    pub fn entity(mut self, meta: EntityMeta) -> Self {
        self.entities.push(meta);
        self
    }

    /// Validate names and cross-entity references and produce the schema.
    pub fn build(self) -> Result<Schema> {
        let mut entities: HashMap<String, Arc<EntityMeta>> = HashMap::new();
        for meta in self.entities {
            if !is_identifier(&meta.name) {
                return Err(invalid(format!("invalid entity name '{}'", meta.name)));
            }
            for attr in &meta.attributes {
                if !is_identifier(&attr.name) {
                    return Err(invalid(format!(
                        "invalid attribute name '{}.{}'",
                        meta.name, attr.name
                    )));
                }
            }
            if entities.contains_key(&meta.name) {
                return Err(invalid(format!("entity '{}' declared twice", meta.name)));
            }
            entities.insert(meta.name.clone(), Arc::new(meta));
        }

        for meta in entities.values() {
            for attr in meta.attributes() {
                match &attr.kind {
                    AttributeKind::Scalar => {}
                    AttributeKind::ToOne { target } => {
                        if !entities.contains_key(target) {
                            return Err(invalid(format!(
                                "{}.{} references unknown entity '{}'",
                                meta.name, attr.name, target
                            )));
                        }
                    }
                    AttributeKind::ToMany { target, mapped_by } => {
                        let target_meta = entities.get(target).ok_or_else(|| {
                            invalid(format!(
                                "{}.{} references unknown entity '{}'",
                                meta.name, attr.name, target
                            ))
                        })?;
                        let back = target_meta.attribute(mapped_by);
                        let points_back = matches!(
                            back.map(|b| &b.kind),
                            Some(AttributeKind::ToOne { target }) if *target == meta.name
                        );
                        if !points_back {
                            return Err(invalid(format!(
                                "{}.{} is mapped by '{}.{}' which is not a reference to {}",
                                meta.name, attr.name, target, mapped_by, meta.name
                            )));
                        }
                    }
                }
            }
        }

        tracing::debug!(entities = entities.len(), "Schema built");
        Ok(Schema { entities })
    }
}

fn invalid(message: String) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}
