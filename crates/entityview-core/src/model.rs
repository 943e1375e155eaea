//! Typed wrappers over [`Entity`] handles.
//!
//! Application code usually prefers `user.login()?` over
//! `user.get_as::<String>("login")?`. The [`entity_model!`](crate::entity_model)
//! macro generates such a wrapper for one entity type; every accessor routes
//! through the same gating as the untyped handle, so unfetched attributes
//! fail the same way.
//!
//! # Example
//!
//! ```ignore
//! entity_model! {
//!     pub struct User: "User" {
//!         scalar login / set_login: String = "login";
//!         scalar name / set_name: Option<String> = "name";
//!         reference group / set_group: Group = "group";
//!         collection user_roles: UserRole = "userRoles";
//!     }
//! }
//! ```
//!
//! Accessor groups must appear in the order shown: scalars, then
//! references, then collections.

use crate::Result;
use crate::entity::Entity;
use crate::error::{Error, SchemaErrorKind};
use crate::identity::Identity;
use crate::schema::Schema;
use crate::state::EntityState;

/// A typed view of one entity type.
pub trait EntityModel: Sized {
    /// Name of the entity type in the schema.
    const ENTITY: &'static str;

    fn from_entity(entity: Entity) -> Self;

    fn entity(&self) -> &Entity;

    /// Wrap `entity`, checking its type.
    fn cast(entity: Entity) -> Result<Self> {
        if entity.entity_name() != Self::ENTITY {
            return Err(Error::schema(
                SchemaErrorKind::KindMismatch,
                format!("{} is not a {}", entity.key(), Self::ENTITY),
            ));
        }
        Ok(Self::from_entity(entity))
    }

    /// Construct a new, unmanaged instance.
    fn create(schema: &Schema, id: impl Into<Identity>) -> Result<Self> {
        let meta = schema.require(Self::ENTITY)?;
        Ok(Self::from_entity(Entity::new(meta, id)))
    }

    fn id(&self) -> &Identity {
        self.entity().id()
    }

    fn state(&self) -> EntityState {
        self.entity().state()
    }
}

/// Generate an [`EntityModel`] wrapper with typed accessors.
#[macro_export]
macro_rules! entity_model {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $entity:literal {
            $( scalar $get:ident / $set:ident : $ty:ty = $attr:literal; )*
            $( reference $rget:ident / $rset:ident : $rty:ty = $rattr:literal; )*
            $( collection $cget:ident : $cty:ty = $cattr:literal; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $name($crate::Entity);

        impl $crate::EntityModel for $name {
            const ENTITY: &'static str = $entity;

            fn from_entity(entity: $crate::Entity) -> Self {
                Self(entity)
            }

            fn entity(&self) -> &$crate::Entity {
                &self.0
            }
        }

        #[allow(dead_code)]
        impl $name {
            $(
                pub fn $get(&self) -> $crate::Result<$ty> {
                    self.0.get_as::<$ty>($attr)
                }

                pub fn $set(&self, value: $ty) -> $crate::Result<()> {
                    self.0.set($attr, value)
                }
            )*
            $(
                pub fn $rget(&self) -> $crate::Result<::std::option::Option<$rty>> {
                    ::std::result::Result::Ok(
                        self.0
                            .reference($rattr)?
                            .map(<$rty as $crate::EntityModel>::from_entity),
                    )
                }

                pub fn $rset(&self, target: ::std::option::Option<&$rty>) -> $crate::Result<()> {
                    self.0
                        .set_reference($rattr, target.map(<$rty as $crate::EntityModel>::entity))
                }
            )*
            $(
                pub fn $cget(&self) -> $crate::Result<::std::vec::Vec<$cty>> {
                    ::std::result::Result::Ok(
                        self.0
                            .collection($cattr)?
                            .into_iter()
                            .map(<$cty as $crate::EntityModel>::from_entity)
                            .collect(),
                    )
                }
            )*
        }
    };
}
