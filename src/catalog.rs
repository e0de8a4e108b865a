//! The catalog of known message, saga and finder types consumed once at startup

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::{LogicalMessage, PropertyAccessor, SagaFinder, SagaState, StateDescriptor};

/// A message-to-state property mapping declared by a saga
#[derive(Clone)]
pub struct PropertyMapping {
    pub(crate) message_type: Box<str>,
    pub(crate) saga_property: Box<str>,
    pub(crate) accessor: PropertyAccessor,
}

impl PropertyMapping {
    /// Message type the mapping applies to
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// State property the message value is matched against
    pub fn saga_property(&self) -> &str {
        &self.saga_property
    }
}

impl std::fmt::Debug for PropertyMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyMapping")
            .field("message_type", &self.message_type)
            .field("saga_property", &self.saga_property)
            .finish()
    }
}

/// Declarative description of a saga type.
///
/// This is the saga's type descriptor: which state it owns, which messages
/// start it, which it handles, and how messages map onto state properties.
/// It is never instantiated as a running saga while metadata is derived.
///
/// ```rust,ignore
/// let definition = SagaDefinition::new::<OrderSagaData>("OrderSaga")
///     .started_by("OrderPlaced")
///     .handles("OrderShipped")
///     .map_property("OrderPlaced", "order_id", |m: &OrderPlaced| m.order_id.clone())
///     .map_property("OrderShipped", "order_id", |m: &OrderShipped| m.order_id.clone());
/// ```
#[derive(Clone, Debug)]
pub struct SagaDefinition {
    pub(crate) name: Box<str>,
    pub(crate) state: StateDescriptor,
    pub(crate) started_by: Vec<Box<str>>,
    pub(crate) handles: Vec<Box<str>>,
    pub(crate) mappings: Vec<PropertyMapping>,
}

impl SagaDefinition {
    /// Define a saga owning state type `S`
    pub fn new<S: SagaState>(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            state: StateDescriptor::of::<S>(),
            started_by: Vec::new(),
            handles: Vec::new(),
            mappings: Vec::new(),
        }
    }

    /// Declare a message type that may start a new conversation
    pub fn started_by(mut self, message_type: impl Into<Box<str>>) -> Self {
        self.started_by.push(message_type.into());
        self
    }

    /// Declare a message type handled by existing conversations only
    pub fn handles(mut self, message_type: impl Into<Box<str>>) -> Self {
        self.handles.push(message_type.into());
        self
    }

    /// Correlate `message_type` to state whose `saga_property` equals the
    /// value `accessor` extracts from the message body `M`
    pub fn map_property<M, V, F>(
        mut self,
        message_type: impl Into<Box<str>>,
        saga_property: impl Into<Box<str>>,
        accessor: F,
    ) -> Self
    where
        M: Any,
        V: Serialize,
        F: Fn(&M) -> V + Send + Sync + 'static,
    {
        let accessor: PropertyAccessor = Arc::new(move |message: &LogicalMessage| {
            let body = message.body::<M>()?;
            serde_json::to_value(accessor(body)).ok()
        });
        self.mappings.push(PropertyMapping {
            message_type: message_type.into(),
            saga_property: saga_property.into(),
            accessor,
        });
        self
    }

    /// Saga name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A custom finder implementation for one (message type, state type) pair
#[derive(Clone)]
pub struct FinderRegistration {
    pub(crate) name: Box<str>,
    pub(crate) message_type: Box<str>,
    pub(crate) entity_name: Box<str>,
    pub(crate) finder: Arc<dyn SagaFinder>,
}

impl FinderRegistration {
    /// Register `finder` as able to find state `S` for `message_type`
    pub fn new<S: SagaState>(
        name: impl Into<Box<str>>,
        message_type: impl Into<Box<str>>,
        finder: Arc<dyn SagaFinder>,
    ) -> Self {
        Self {
            name: name.into(),
            message_type: message_type.into(),
            entity_name: S::entity_name().into(),
            finder,
        }
    }
}

impl std::fmt::Debug for FinderRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinderRegistration")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("entity_name", &self.entity_name)
            .finish()
    }
}

/// All types known to the endpoint
#[derive(Clone, Debug, Default)]
pub struct TypeCatalog {
    pub(crate) messages: BTreeSet<Box<str>>,
    pub(crate) sagas: Vec<SagaDefinition>,
    pub(crate) finders: Vec<FinderRegistration>,
}

impl TypeCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a type as a message
    pub fn message(mut self, message_type: impl Into<Box<str>>) -> Self {
        self.messages.insert(message_type.into());
        self
    }

    /// Classify several types as messages
    pub fn messages<I, T>(mut self, message_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Box<str>>,
    {
        self.messages.extend(message_types.into_iter().map(Into::into));
        self
    }

    /// Add a saga type
    pub fn saga(mut self, definition: SagaDefinition) -> Self {
        self.sagas.push(definition);
        self
    }

    /// Add a custom finder implementation
    pub fn finder(mut self, registration: FinderRegistration) -> Self {
        self.finders.push(registration);
        self
    }

    /// True if the type is classified as a message
    pub fn is_message(&self, message_type: &str) -> bool {
        self.messages.contains(message_type)
    }

    /// Saga definitions in registration order
    pub fn sagas(&self) -> &[SagaDefinition] {
        &self.sagas
    }

    /// Finders declared for the given state type
    pub fn finders_for_entity<'a>(
        &'a self,
        entity_name: &'a str,
    ) -> impl Iterator<Item = &'a FinderRegistration> + 'a {
        self.finders
            .iter()
            .filter(move |registration| &*registration.entity_name == entity_name)
    }
}
