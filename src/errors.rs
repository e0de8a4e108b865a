//! Error types for saga configuration, persistence and pipeline execution

use crate::SagaId;

/// Error raised while building saga metadata at startup.
///
/// These are configuration defects: they abort startup and are never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SagaConfigError {
    /// The saga definition is structurally invalid
    #[error("invalid saga definition '{saga}': {reason}")]
    InvalidSagaDefinition {
        /// Saga name
        saga: Box<str>,
        /// What is wrong with it
        reason: Box<str>,
    },
    /// A message allowed to start the saga has no way to be correlated
    #[error(
        "message type '{message_type}' can start saga '{saga}' but no finder is configured for it; \
         map a message property to the saga state or register a custom finder"
    )]
    MissingFinder {
        /// Saga name
        saga: Box<str>,
        /// Offending message type
        message_type: Box<str>,
    },
    /// The saga references a type the catalog does not classify as a message
    #[error("saga '{saga}' handles '{message_type}' but it is not classified as a message")]
    UnclassifiedMessage {
        /// Saga name
        saga: Box<str>,
        /// Unknown message type
        message_type: Box<str>,
    },
    /// Two sagas were registered under the same name
    #[error("saga '{name}' is defined more than once")]
    DuplicateSaga {
        /// Saga name
        name: Box<str>,
    },
}

/// Error from the saga persister
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PersisterError {
    /// A write would give two live sagas the same unique property value
    #[error(
        "cannot store saga entity '{entity}': a saga with the same value [{value}] for unique property '{property}' already exists"
    )]
    DuplicateUniqueValue {
        /// Entity name
        entity: Box<str>,
        /// Unique property
        property: Box<str>,
        /// Conflicting value (JSON text)
        value: Box<str>,
    },
    /// The entity was written by someone else since it was read
    #[error("concurrency violation: saga entity Id[{id}] already saved by [{owner}]")]
    ConcurrencyConflict {
        /// Saga id
        id: SagaId,
        /// Label of the writer that won
        owner: Box<str>,
    },
    /// The entity has the nil id
    #[error("saga entity '{entity}' has no id")]
    MissingId {
        /// Entity name
        entity: Box<str>,
    },
    /// Update of an entity that was never saved
    #[error("saga entity Id[{id}] was never saved")]
    NotFound {
        /// Saga id
        id: SagaId,
    },
    /// The id belongs to an entity of another type
    #[error("saga entity Id[{id}] is a '{stored}', not a '{requested}'")]
    EntityMismatch {
        /// Saga id
        id: SagaId,
        /// Stored entity name
        stored: Box<str>,
        /// Entity name of the write
        requested: Box<str>,
    },
    /// State was written back under a different id than it was loaded with
    #[error("saga entity Id[{id}] cannot be replaced by state with Id[{attempted}]")]
    IdChanged {
        /// Id the state was loaded with
        id: SagaId,
        /// Id carried by the replacement
        attempted: SagaId,
    },
    /// State could not be converted to or from its stored form
    #[error("serialization error: {reason}")]
    Serialization {
        /// Error description
        reason: Box<str>,
    },
    /// Underlying storage failed
    #[error("storage error: {reason}")]
    Storage {
        /// Error description
        reason: Box<str>,
    },
}

impl PersisterError {
    /// Check if this is an optimistic concurrency failure
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Check if this is a uniqueness violation
    pub fn is_duplicate_unique_value(&self) -> bool {
        matches!(self, Self::DuplicateUniqueValue { .. })
    }
}

impl From<serde_json::Error> for PersisterError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            reason: error.to_string().into(),
        }
    }
}

/// Error surfaced by a behavior chain.
///
/// Errors are cheap to clone so the chain can keep the first one raised while
/// the stack unwinds.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Persister failure during saga load or commit
    #[error(transparent)]
    Persister(#[from] PersisterError),
    /// The builder could not resolve a behavior
    #[error("no behavior registered for '{behavior}'")]
    Build {
        /// Behavior identifier
        behavior: Box<str>,
    },
    /// A behavior failed
    #[error("behavior '{behavior}' failed: {reason}")]
    Behavior {
        /// Behavior identifier
        behavior: Box<str>,
        /// Error description
        reason: Box<str>,
    },
    /// A saga handler failed
    #[error("saga '{saga}' handler failed: {reason}")]
    Handler {
        /// Saga name
        saga: Box<str>,
        /// Error description
        reason: Box<str>,
    },
    /// An external collaborator (deferrer, diagnostics, finder) failed
    #[error("collaborator failed: {reason}")]
    Collaborator {
        /// Error description
        reason: Box<str>,
    },
}

impl PipelineError {
    /// Create a behavior failure
    pub fn behavior(behavior: impl Into<Box<str>>, reason: impl Into<Box<str>>) -> Self {
        Self::Behavior {
            behavior: behavior.into(),
            reason: reason.into(),
        }
    }

    /// Create a collaborator failure
    pub fn collaborator(reason: impl Into<Box<str>>) -> Self {
        Self::Collaborator {
            reason: reason.into(),
        }
    }

    /// Check if a fresh read and retry of the message is expected to succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Persister(e) if e.is_concurrency_conflict())
    }
}
