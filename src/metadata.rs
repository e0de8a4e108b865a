//! Saga metadata and its derivation from saga definitions

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::{
    LogicalMessage, PropertyMapping, SagaConfigError, SagaDefinition, SagaFinder,
    StateDescriptor, TypeCatalog,
};

/// Extracts the correlation value from a message
pub type PropertyAccessor = Arc<dyn Fn(&LogicalMessage) -> Option<Value> + Send + Sync>;

/// A message type associated with a saga
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SagaMessage {
    /// Message type identifier
    pub message_type: Box<str>,
    /// True if the message may start a new conversation
    pub is_allowed_to_start: bool,
}

/// How a message is correlated to existing state
#[derive(Clone)]
pub enum FinderStrategy {
    /// Match a message value against a state property
    PropertyMatch {
        /// State property holding the correlation value
        saga_property: Box<str>,
        /// Extracts the value from the message
        accessor: PropertyAccessor,
    },
    /// Delegate to an externally supplied finder
    Custom {
        /// Name the finder was registered under
        finder_name: Box<str>,
        /// The finder
        finder: Arc<dyn SagaFinder>,
    },
}

impl std::fmt::Debug for FinderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PropertyMatch { saga_property, .. } => f
                .debug_struct("PropertyMatch")
                .field("saga_property", saga_property)
                .finish(),
            Self::Custom { finder_name, .. } => f
                .debug_struct("Custom")
                .field("finder_name", finder_name)
                .finish(),
        }
    }
}

/// Finder for one message type
#[derive(Clone, Debug)]
pub struct SagaFinderDefinition {
    /// Message type identifier
    pub message_type: Box<str>,
    /// Correlation strategy
    pub strategy: FinderStrategy,
    /// Strategy parameters, for diagnostics
    pub properties: BTreeMap<Box<str>, Box<str>>,
}

impl SagaFinderDefinition {
    fn property_match(mapping: &PropertyMapping) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("saga-property".into(), mapping.saga_property.clone());
        Self {
            message_type: mapping.message_type.clone(),
            strategy: FinderStrategy::PropertyMatch {
                saga_property: mapping.saga_property.clone(),
                accessor: mapping.accessor.clone(),
            },
            properties,
        }
    }

    fn custom(message_type: &str, finder_name: &str, finder: Arc<dyn SagaFinder>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("custom-finder".into(), finder_name.into());
        Self {
            message_type: message_type.into(),
            strategy: FinderStrategy::Custom {
                finder_name: finder_name.into(),
                finder,
            },
            properties,
        }
    }
}

/// Everything the runtime needs to know about one saga type.
///
/// Built once by [`MetadataBuilder`] and immutable afterwards.
#[derive(Clone, Debug)]
pub struct SagaMetadata {
    name: Box<str>,
    entity_name: Box<str>,
    unique_properties: BTreeSet<Box<str>>,
    associated_messages: BTreeMap<Box<str>, SagaMessage>,
    finders: BTreeMap<Box<str>, SagaFinderDefinition>,
    state: StateDescriptor,
}

impl SagaMetadata {
    /// Saga name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the state entity
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Properties whose values must be unique across live sagas
    pub fn unique_properties(&self) -> &BTreeSet<Box<str>> {
        &self.unique_properties
    }

    /// State type descriptor
    pub fn state(&self) -> &StateDescriptor {
        &self.state
    }

    /// Messages associated with the saga, ordered by message type
    pub fn associated_messages(&self) -> impl Iterator<Item = &SagaMessage> {
        self.associated_messages.values()
    }

    /// True if the saga handles the message type at all
    pub fn handles(&self, message_type: &str) -> bool {
        self.associated_messages.contains_key(message_type)
    }

    /// True if the message type may start the saga
    pub fn is_message_allowed_to_start(&self, message_type: &str) -> bool {
        self.associated_messages
            .get(message_type)
            .map(|message| message.is_allowed_to_start)
            .unwrap_or(false)
    }

    /// Finder configured for the message type
    pub fn finder(&self, message_type: &str) -> Option<&SagaFinderDefinition> {
        self.finders.get(message_type)
    }

    /// All finders, ordered by message type
    pub fn finders(&self) -> impl Iterator<Item = &SagaFinderDefinition> {
        self.finders.values()
    }
}

/// Derives the unique properties of a state type
pub struct UniquenessAnalyzer;

impl UniquenessAnalyzer {
    /// Properties marked unique on the type, plus every property targeted by
    /// a message mapping (a correlation property must identify one saga)
    pub fn unique_properties(
        state: &StateDescriptor,
        mappings: &[PropertyMapping],
    ) -> BTreeSet<Box<str>> {
        state
            .declared_unique_properties()
            .iter()
            .cloned()
            .chain(mappings.iter().map(|m| m.saga_property.clone()))
            .collect()
    }
}

/// Builds [`SagaMetadata`] from a saga definition and the type catalog
pub struct MetadataBuilder;

impl MetadataBuilder {
    /// Build and validate the metadata for one saga
    pub fn build(
        definition: &SagaDefinition,
        catalog: &TypeCatalog,
    ) -> Result<SagaMetadata, SagaConfigError> {
        let saga: &str = &definition.name;
        let invalid = |reason: String| SagaConfigError::InvalidSagaDefinition {
            saga: saga.into(),
            reason: reason.into(),
        };

        if saga.trim().is_empty() {
            return Err(invalid("saga name must not be empty".into()));
        }

        let declared = definition
            .handles
            .iter()
            .chain(&definition.started_by)
            .chain(definition.mappings.iter().map(|m| &m.message_type));
        for message_type in declared {
            if !catalog.is_message(message_type) {
                return Err(SagaConfigError::UnclassifiedMessage {
                    saga: saga.into(),
                    message_type: message_type.clone(),
                });
            }
        }

        let mut associated_messages = BTreeMap::new();
        for message_type in &definition.handles {
            associated_messages.insert(
                message_type.clone(),
                SagaMessage {
                    message_type: message_type.clone(),
                    is_allowed_to_start: false,
                },
            );
        }
        for message_type in &definition.started_by {
            associated_messages.insert(
                message_type.clone(),
                SagaMessage {
                    message_type: message_type.clone(),
                    is_allowed_to_start: true,
                },
            );
        }

        let state = &definition.state;
        let properties = state
            .property_names()
            .map_err(|e| invalid(format!("state '{}' cannot be described: {e}", state.entity_name())))?;

        let unique_properties = UniquenessAnalyzer::unique_properties(state, &definition.mappings);
        for property in &unique_properties {
            if !properties.contains(&**property) {
                return Err(invalid(format!(
                    "state '{}' has no property '{property}'",
                    state.entity_name()
                )));
            }
        }

        let mut finders = BTreeMap::new();
        for mapping in &definition.mappings {
            if !associated_messages.contains_key(&mapping.message_type) {
                return Err(invalid(format!(
                    "mapping for '{}' but the saga does not handle that message",
                    mapping.message_type
                )));
            }
            if finders.contains_key(&mapping.message_type) {
                return Err(invalid(format!(
                    "message '{}' is mapped more than once",
                    mapping.message_type
                )));
            }
            finders.insert(
                mapping.message_type.clone(),
                SagaFinderDefinition::property_match(mapping),
            );
        }

        let mut scanned: BTreeMap<Box<str>, &str> = BTreeMap::new();
        for registration in catalog.finders_for_entity(state.entity_name()) {
            let message_type = &registration.message_type;
            if !associated_messages.contains_key(message_type) {
                tracing::debug!(
                    saga = %saga,
                    finder = %registration.name,
                    message_type = %message_type,
                    "Finder ignored, saga does not handle its message"
                );
                continue;
            }
            if let Some(previous) = scanned.insert(message_type.clone(), &registration.name) {
                return Err(invalid(format!(
                    "finders '{previous}' and '{}' both find '{message_type}'",
                    registration.name
                )));
            }
            if finders.contains_key(message_type) {
                tracing::debug!(
                    saga = %saga,
                    finder = %registration.name,
                    message_type = %message_type,
                    "Explicit mapping takes precedence over custom finder"
                );
                continue;
            }
            finders.insert(
                message_type.clone(),
                SagaFinderDefinition::custom(
                    message_type,
                    &registration.name,
                    registration.finder.clone(),
                ),
            );
        }

        for message in associated_messages.values() {
            if message.is_allowed_to_start && !finders.contains_key(&message.message_type) {
                return Err(SagaConfigError::MissingFinder {
                    saga: saga.into(),
                    message_type: message.message_type.clone(),
                });
            }
        }

        tracing::debug!(
            saga = %saga,
            entity = %state.entity_name(),
            messages = associated_messages.len(),
            finders = finders.len(),
            "Saga metadata built"
        );

        Ok(SagaMetadata {
            name: saga.into(),
            entity_name: state.entity_name().into(),
            unique_properties,
            associated_messages,
            finders,
            state: state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        order_catalog, order_saga, OrderPlaced, OrderSagaData, ORDER_PLACED, ORDER_SHIPPED,
        PAYMENT_RECEIVED,
    };
    use crate::{FinderRegistration, PersisterError, SagaEntity, SagaPersister};

    struct NoopFinder;

    impl SagaFinder for NoopFinder {
        fn find(
            &self,
            _persister: &dyn SagaPersister,
            _message: &LogicalMessage,
        ) -> Result<Option<SagaEntity>, PersisterError> {
            Ok(None)
        }
    }

    #[test]
    fn test_associated_messages_deduplicated_with_start_precedence() {
        let definition = order_saga().handles(ORDER_PLACED);
        let metadata = MetadataBuilder::build(&definition, &order_catalog()).unwrap();

        let messages: Vec<_> = metadata.associated_messages().cloned().collect();
        assert_eq!(messages.len(), 3);
        assert!(metadata.is_message_allowed_to_start(ORDER_PLACED));
        assert!(!metadata.is_message_allowed_to_start(ORDER_SHIPPED));
        assert!(metadata.handles(PAYMENT_RECEIVED));
        assert!(!metadata.is_message_allowed_to_start("Unknown"));
    }

    #[test]
    fn test_mapped_property_is_unique() {
        let metadata = MetadataBuilder::build(&order_saga(), &order_catalog()).unwrap();
        assert!(metadata.unique_properties().contains("order_id"));
        // declared on the state type
        assert!(metadata.unique_properties().contains("tracking_code"));
    }

    #[test]
    fn test_start_message_without_finder_fails() {
        let definition = SagaDefinition::new::<OrderSagaData>("OrderSaga").started_by(ORDER_PLACED);
        let error = MetadataBuilder::build(&definition, &order_catalog()).unwrap_err();
        assert_eq!(
            error,
            SagaConfigError::MissingFinder {
                saga: "OrderSaga".into(),
                message_type: ORDER_PLACED.into(),
            }
        );
        assert!(error.to_string().contains("OrderSaga"));
    }

    #[test]
    fn test_custom_finder_satisfies_start_message() {
        let definition = SagaDefinition::new::<OrderSagaData>("OrderSaga").started_by(ORDER_PLACED);
        let catalog = order_catalog().finder(FinderRegistration::new::<OrderSagaData>(
            "NoopFinder",
            ORDER_PLACED,
            Arc::new(NoopFinder),
        ));
        let metadata = MetadataBuilder::build(&definition, &catalog).unwrap();
        let finder = metadata.finder(ORDER_PLACED).unwrap();
        assert!(matches!(finder.strategy, FinderStrategy::Custom { .. }));
        assert_eq!(finder.properties.get("custom-finder").map(|v| &**v), Some("NoopFinder"));
    }

    #[test]
    fn test_explicit_mapping_wins_over_scanned_finder() {
        let catalog = order_catalog().finder(FinderRegistration::new::<OrderSagaData>(
            "NoopFinder",
            ORDER_PLACED,
            Arc::new(NoopFinder),
        ));
        let metadata = MetadataBuilder::build(&order_saga(), &catalog).unwrap();
        assert!(matches!(
            metadata.finder(ORDER_PLACED).unwrap().strategy,
            FinderStrategy::PropertyMatch { .. }
        ));
    }

    #[test]
    fn test_unclassified_message_fails() {
        let definition = order_saga().handles("NotAMessage");
        let error = MetadataBuilder::build(&definition, &order_catalog()).unwrap_err();
        assert!(matches!(error, SagaConfigError::UnclassifiedMessage { .. }));
    }

    #[test]
    fn test_mapping_to_unknown_property_fails() {
        let definition = SagaDefinition::new::<OrderSagaData>("OrderSaga")
            .started_by(ORDER_PLACED)
            .map_property(ORDER_PLACED, "missing", |m: &OrderPlaced| m.order_id.clone());
        let error = MetadataBuilder::build(&definition, &order_catalog()).unwrap_err();
        assert!(matches!(error, SagaConfigError::InvalidSagaDefinition { .. }));
    }

    #[test]
    fn test_build_is_deterministic() {
        let catalog = order_catalog();
        let first = MetadataBuilder::build(&order_saga(), &catalog).unwrap();
        let second = MetadataBuilder::build(&order_saga(), &catalog).unwrap();
        let types = |m: &SagaMetadata| {
            m.finders()
                .map(|f| f.message_type.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(types(&first), types(&second));
        assert_eq!(
            first.associated_messages().collect::<Vec<_>>(),
            second.associated_messages().collect::<Vec<_>>()
        );
    }
}
