//! Conversation state: the typed contract, its type-erased stored form and
//! the per-message active instance wrapper

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{PersisterError, SagaId, SagaMetadata};

/// Identity and origin fields every conversation state carries.
///
/// Embed it with `#[serde(flatten)]` so `id`, `originator` and
/// `original_message_id` are addressable as properties.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SagaEnvelope {
    /// Saga id
    pub id: SagaId,
    /// Address of whoever started the conversation
    #[serde(default)]
    pub originator: Option<String>,
    /// Message id of the message that started the conversation
    #[serde(default)]
    pub original_message_id: Option<String>,
    /// Write token observed when this copy was read
    #[serde(skip)]
    pub(crate) version: Option<u64>,
}

impl SagaEnvelope {
    /// Create an envelope for a fresh saga
    pub fn new(id: SagaId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Write token captured at read time, `None` for never-persisted state
    pub fn version(&self) -> Option<u64> {
        self.version
    }
}

impl PartialEq for SagaEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.originator == other.originator
            && self.original_message_id == other.original_message_id
    }
}

/// Contract for a conversation-state type.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Default, Serialize, Deserialize)]
/// struct OrderSagaData {
///     #[serde(flatten)]
///     envelope: SagaEnvelope,
///     order_id: String,
/// }
///
/// impl SagaState for OrderSagaData {
///     const UNIQUE_PROPERTIES: &'static [&'static str] = &["order_id"];
///     fn envelope(&self) -> &SagaEnvelope { &self.envelope }
///     fn envelope_mut(&mut self) -> &mut SagaEnvelope { &mut self.envelope }
/// }
/// ```
pub trait SagaState: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Properties explicitly marked as unique across live sagas of this type
    const UNIQUE_PROPERTIES: &'static [&'static str] = &[];

    /// Name identifying the state type in the meta model and the persister
    fn entity_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Identity and origin fields
    fn envelope(&self) -> &SagaEnvelope;

    /// Identity and origin fields (mutable)
    fn envelope_mut(&mut self) -> &mut SagaEnvelope;

    /// Saga id
    fn id(&self) -> SagaId {
        self.envelope().id
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, PersisterError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(PersisterError::Serialization {
            reason: format!("saga state must serialize to an object, got {other}").into(),
        }),
    }
}

fn template_of<S: SagaState>() -> Result<Map<String, Value>, PersisterError> {
    to_object(&S::default())
}

/// Type descriptor for a conversation-state type, captured once at startup
#[derive(Clone)]
pub struct StateDescriptor {
    entity_name: Box<str>,
    unique_properties: Vec<Box<str>>,
    template: fn() -> Result<Map<String, Value>, PersisterError>,
}

impl StateDescriptor {
    /// Describe a state type
    pub fn of<S: SagaState>() -> Self {
        Self {
            entity_name: S::entity_name().into(),
            unique_properties: S::UNIQUE_PROPERTIES.iter().map(|p| (*p).into()).collect(),
            template: template_of::<S>,
        }
    }

    /// Entity name
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Properties explicitly marked unique on the type
    pub fn declared_unique_properties(&self) -> &[Box<str>] {
        &self.unique_properties
    }

    /// Names of the properties a default instance serializes
    pub fn property_names(&self) -> Result<BTreeSet<String>, PersisterError> {
        Ok((self.template)()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Construct a default entity with the given identity
    pub fn new_entity(&self, envelope: SagaEnvelope) -> Result<SagaEntity, PersisterError> {
        let mut entity = SagaEntity {
            entity_name: self.entity_name.clone(),
            envelope: SagaEnvelope::default(),
            fields: (self.template)()?,
        };
        entity.set_envelope(envelope)?;
        Ok(entity)
    }
}

impl std::fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("entity_name", &self.entity_name)
            .field("unique_properties", &self.unique_properties)
            .finish()
    }
}

/// Type-erased conversation state as moved through the pipeline and the persister
#[derive(Clone, Debug, PartialEq)]
pub struct SagaEntity {
    entity_name: Box<str>,
    envelope: SagaEnvelope,
    fields: Map<String, Value>,
}

impl SagaEntity {
    /// Erase a typed state
    pub fn from_state<S: SagaState>(state: &S) -> Result<Self, PersisterError> {
        Ok(Self {
            entity_name: S::entity_name().into(),
            envelope: state.envelope().clone(),
            fields: to_object(state)?,
        })
    }

    /// Rebuild the typed state, carrying over the captured write token
    pub fn to_state<S: SagaState>(&self) -> Result<S, PersisterError> {
        self.check_entity::<S>()?;
        let mut state: S = serde_json::from_value(Value::Object(self.fields.clone()))?;
        *state.envelope_mut() = self.envelope.clone();
        Ok(state)
    }

    /// Replace the contents with a typed state, keeping the captured write token.
    ///
    /// The state must keep the id it was loaded with.
    pub fn set_state<S: SagaState>(&mut self, state: &S) -> Result<(), PersisterError> {
        self.check_entity::<S>()?;
        if state.id() != self.envelope.id {
            return Err(PersisterError::IdChanged {
                id: self.envelope.id,
                attempted: state.id(),
            });
        }
        let version = self.envelope.version;
        self.fields = to_object(state)?;
        self.envelope = state.envelope().clone();
        self.envelope.version = version;
        Ok(())
    }

    fn check_entity<S: SagaState>(&self) -> Result<(), PersisterError> {
        if &*self.entity_name == S::entity_name() {
            return Ok(());
        }
        Err(PersisterError::EntityMismatch {
            id: self.envelope.id,
            stored: self.entity_name.clone(),
            requested: S::entity_name().into(),
        })
    }

    /// Entity name
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Saga id
    pub fn id(&self) -> SagaId {
        self.envelope.id
    }

    /// Identity and origin fields
    pub fn envelope(&self) -> &SagaEnvelope {
        &self.envelope
    }

    /// Replace identity and origin fields, mirrored into the property map
    pub(crate) fn set_envelope(&mut self, envelope: SagaEnvelope) -> Result<(), PersisterError> {
        for (key, value) in to_object(&envelope)? {
            self.fields.insert(key, value);
        }
        self.envelope = envelope;
        Ok(())
    }

    /// Look up a property value
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a property value. Envelope properties cannot be changed this way.
    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if matches!(name.as_str(), "id" | "originator" | "original_message_id") {
            tracing::warn!(entity = %self.entity_name, property = %name, "envelope property is read-only");
            return;
        }
        self.fields.insert(name, value);
    }

    /// All properties
    pub fn properties(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub(crate) fn version(&self) -> Option<u64> {
        self.envelope.version
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.set_version(version);
        self
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.envelope.version = Some(version);
    }
}

/// Whether the instance was loaded, created or could not be resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceResolution {
    /// Existing state was loaded
    Found,
    /// Fresh state was created by a start message
    Created,
    /// No state exists and the message cannot start one
    NotFound,
}

/// A saga instance being processed for one incoming message.
///
/// Created by the saga persistence behavior and discarded once it commits.
#[derive(Debug)]
pub struct ActiveSagaInstance {
    metadata: Arc<SagaMetadata>,
    entity: Option<SagaEntity>,
    resolution: Option<InstanceResolution>,
    completed: bool,
    is_timeout: bool,
}

impl ActiveSagaInstance {
    /// Start resolving an instance of the given saga
    pub fn new(metadata: Arc<SagaMetadata>) -> Self {
        Self {
            metadata,
            entity: None,
            resolution: None,
            completed: false,
            is_timeout: false,
        }
    }

    /// Attach state created by this message
    pub fn attach_new_entity(&mut self, entity: SagaEntity) {
        self.entity = Some(entity);
        self.resolution = Some(InstanceResolution::Created);
    }

    /// Attach state loaded from the persister
    pub fn attach_existing_entity(&mut self, entity: SagaEntity) {
        self.entity = Some(entity);
        self.resolution = Some(InstanceResolution::Found);
    }

    /// Record that no state could be found or created
    pub fn mark_as_not_found(&mut self) {
        self.entity = None;
        self.resolution = Some(InstanceResolution::NotFound);
    }

    /// Flag the conversation as finished; its state is removed on commit
    pub fn mark_as_complete(&mut self) {
        self.completed = true;
    }

    pub(crate) fn mark_as_timeout(&mut self) {
        self.is_timeout = true;
    }

    /// Saga metadata
    pub fn metadata(&self) -> &Arc<SagaMetadata> {
        &self.metadata
    }

    /// Saga id, once state is attached
    pub fn saga_id(&self) -> Option<SagaId> {
        self.entity.as_ref().map(SagaEntity::id)
    }

    /// How the instance was resolved, `None` while still resolving
    pub fn resolution(&self) -> Option<InstanceResolution> {
        self.resolution
    }

    /// True if the state was created by this message
    pub fn is_new(&self) -> bool {
        self.resolution == Some(InstanceResolution::Created)
    }

    /// True if no state exists for this message
    pub fn not_found(&self) -> bool {
        self.resolution == Some(InstanceResolution::NotFound)
    }

    /// True if the saga flagged completion
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// True if the message is a timeout requested by this saga
    pub fn is_timeout(&self) -> bool {
        self.is_timeout
    }

    /// Attached state
    pub fn entity(&self) -> Option<&SagaEntity> {
        self.entity.as_ref()
    }

    /// Attached state (mutable)
    pub fn entity_mut(&mut self) -> Option<&mut SagaEntity> {
        self.entity.as_mut()
    }

    /// Typed copy of the attached state
    pub fn state<S: SagaState>(&self) -> Option<Result<S, PersisterError>> {
        self.entity.as_ref().map(SagaEntity::to_state)
    }

    /// Write a typed state back into the attached entity
    pub fn set_state<S: SagaState>(&mut self, state: &S) -> Result<(), PersisterError> {
        match self.entity.as_mut() {
            Some(entity) => entity.set_state(state),
            None => Err(PersisterError::Storage {
                reason: format!("saga '{}' has no attached state", self.metadata.name()).into(),
            }),
        }
    }

    pub(crate) fn take_entity(&mut self) -> Option<SagaEntity> {
        self.entity.take()
    }
}
