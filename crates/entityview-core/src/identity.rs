//! Entity identities and identity-map keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};
use crate::value::Value;

/// The identity (primary key) of one stored entity.
///
/// Unlike [`Value`], identities are hashable and totally ordered so they can
/// key the identity map and the storage engine's tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Int(i64),
    Text(String),
    Uuid([u8; 16]),
}

impl Identity {
    /// Convert into the value carried by a foreign key column.
    pub fn to_value(&self) -> Value {
        match self {
            Identity::Int(v) => Value::BigInt(*v),
            Identity::Text(v) => Value::Text(v.clone()),
            Identity::Uuid(v) => Value::Uuid(*v),
        }
    }

    /// Read an identity back from a foreign key value.
    ///
    /// Returns `Ok(None)` for NULL.
    pub fn from_value(value: &Value) -> Result<Option<Self>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(Identity::Int(i64::from(*v)))),
            Value::BigInt(v) => Ok(Some(Identity::Int(*v))),
            Value::Text(v) => Ok(Some(Identity::Text(v.clone()))),
            Value::Uuid(v) => Ok(Some(Identity::Uuid(*v))),
            other => Err(Error::Type(TypeError {
                expected: "identity",
                actual: other.type_name().to_string(),
                attribute: None,
            })),
        }
    }
}

impl From<i64> for Identity {
    fn from(v: i64) -> Self {
        Identity::Int(v)
    }
}

impl From<i32> for Identity {
    fn from(v: i32) -> Self {
        Identity::Int(i64::from(v))
    }
}

impl From<&str> for Identity {
    fn from(v: &str) -> Self {
        Identity::Text(v.to_string())
    }
}

impl From<String> for Identity {
    fn from(v: String) -> Self {
        Identity::Text(v)
    }
}

impl From<[u8; 16]> for Identity {
    fn from(v: [u8; 16]) -> Self {
        Identity::Uuid(v)
    }
}

impl From<&Identity> for Identity {
    fn from(v: &Identity) -> Self {
        v.clone()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Int(v) => write!(f, "{v}"),
            Identity::Text(v) => write!(f, "{v}"),
            Identity::Uuid(bytes) => {
                for (i, b) in bytes.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Identity-map key: entity type name plus identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity: String,
    pub id: Identity,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: impl Into<Identity>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, self.id)
    }
}
