//! Error types for EntityView operations.

use std::fmt;

use crate::state::EntityState;

/// The primary error type for all EntityView operations.
#[derive(Debug)]
pub enum Error {
    /// Read of an attribute that is not in the instance's fetch group and cannot be fetched
    UnfetchedAttribute(UnfetchedAttributeError),
    /// Lifecycle operation not permitted in the instance's current state
    InvalidState(StateError),
    /// Misuse of the reference-id fast path
    ReferenceId(ReferenceIdError),
    /// Unknown entity types, unknown attributes, kind mismatches, invalid views
    Schema(SchemaError),
    /// Value conversion errors
    Type(TypeError),
    /// Failures reported by the storage engine, passed through unmodified
    Storage(StorageError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct UnfetchedAttributeError {
    pub entity: String,
    pub attribute: String,
    pub state: EntityState,
    pub reason: UnfetchedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfetchedReason {
    /// The instance is detached (or was never registered) so nothing can be fetched
    NotManaged,
    /// The fetch group is frozen
    Frozen,
    /// The instance is managed but lazy loading is switched off
    LazyLoadingDisabled,
}

#[derive(Debug)]
pub struct StateError {
    pub operation: &'static str,
    pub state: EntityState,
    pub entity: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ReferenceIdError {
    pub kind: ReferenceIdErrorKind,
    pub entity: String,
    pub attribute: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceIdErrorKind {
    /// The owning instance carries no fetch group and is not registered with a live context
    Untracked,
    /// `value()` was called on a reference id that is not loaded
    NotLoaded,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity type not registered
    EntityNotFound,
    /// Attribute not declared on the entity type
    AttributeNotFound,
    /// Attribute exists but has a different kind than the operation expects
    KindMismatch,
    /// Identity attributes cannot be written
    ImmutableIdentity,
    /// Invalid schema or view definition
    Invalid,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub attribute: Option<String>,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Row or table not found where one was required
    NotFound,
    /// Unknown or finished transaction handle
    Transaction,
    /// Any other engine failure
    Engine,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The persistence context has already ended
    Closed,
    /// Pending inserts reference each other in a cycle
    DependencyCycle,
    /// An entity belongs to a different live persistence context
    ForeignContext,
}

impl Error {
    /// Shorthand for an unfetched attribute access.
    pub fn unfetched(
        entity: impl Into<String>,
        attribute: impl Into<String>,
        state: EntityState,
        reason: UnfetchedReason,
    ) -> Self {
        Error::UnfetchedAttribute(UnfetchedAttributeError {
            entity: entity.into(),
            attribute: attribute.into(),
            state,
            reason,
        })
    }

    /// Shorthand for an invalid lifecycle transition.
    pub fn invalid_state(
        operation: &'static str,
        state: EntityState,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidState(StateError {
            operation,
            state,
            entity: entity.into(),
            message: message.into(),
        })
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a local programming error (bad access, bad transition, bad view)?
    ///
    /// These are raised synchronously at the point of violation and are never retried.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::UnfetchedAttribute(_)
                | Error::InvalidState(_)
                | Error::ReferenceId(_)
                | Error::Schema(_)
        )
    }

    /// Did this error originate in the storage engine?
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Is this a constraint violation reported by the storage engine?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Storage(e) if e.kind == StorageErrorKind::Constraint)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnfetchedAttribute(e) => write!(f, "Unfetched attribute: {}", e),
            Error::InvalidState(e) => write!(f, "Invalid state transition: {}", e),
            Error::ReferenceId(e) => write!(f, "Reference id error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Type(e) => {
                if let Some(attr) = &e.attribute {
                    write!(
                        f,
                        "Type error in attribute '{}': expected {}, found {}",
                        attr, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Storage(e) => write!(f, "Storage error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for UnfetchedAttributeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let why = match self.reason {
            UnfetchedReason::NotManaged => "instance is not managed",
            UnfetchedReason::Frozen => "fetch group is frozen",
            UnfetchedReason::LazyLoadingDisabled => "lazy loading is disabled",
        };
        write!(
            f,
            "{}.{} was not loaded ({}, state {})",
            self.entity, self.attribute, why, self.state
        )
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} {} in state {}: {}",
            self.operation, self.entity, self.state, self.message
        )
    }
}

impl fmt::Display for ReferenceIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReferenceIdErrorKind::Untracked => write!(
                f,
                "{} carries no fetch group, cannot resolve reference id of '{}'",
                self.entity, self.attribute
            ),
            ReferenceIdErrorKind::NotLoaded => write!(
                f,
                "reference id of {}.{} is not loaded",
                self.entity, self.attribute
            ),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(attr) = &self.attribute {
            write!(
                f,
                "expected {} for attribute '{}', found {}",
                self.expected, attr, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<UnfetchedAttributeError> for Error {
    fn from(err: UnfetchedAttributeError) -> Self {
        Error::UnfetchedAttribute(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<ReferenceIdError> for Error {
    fn from(err: ReferenceIdError) -> Self {
        Error::ReferenceId(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for EntityView operations.
pub type Result<T> = std::result::Result<T, Error>;
