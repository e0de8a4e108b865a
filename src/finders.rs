//! Finder strategies and their resolution against the persister

use serde_json::Value;

use crate::{
    FinderStrategy, LogicalMessage, PersisterError, SagaEntity, SagaFinderDefinition,
    SagaPersister,
};

/// Custom strategy for correlating a message to existing saga state.
///
/// Registered in the [`TypeCatalog`](crate::TypeCatalog) for one
/// (message type, state type) pair and picked up when metadata is built.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderByCustomerFinder;
///
/// impl SagaFinder for OrderByCustomerFinder {
///     fn find(&self, persister: &dyn SagaPersister, message: &LogicalMessage)
///         -> Result<Option<SagaEntity>, PersisterError>
///     {
///         let Some(m) = message.body::<CustomerMoved>() else { return Ok(None) };
///         persister.get_by_property("OrderSagaData", "customer", &json!(m.customer))
///     }
/// }
/// ```
pub trait SagaFinder: Send + Sync + 'static {
    /// Find the state the message belongs to, `None` if there is none
    fn find(
        &self,
        persister: &dyn SagaPersister,
        message: &LogicalMessage,
    ) -> Result<Option<SagaEntity>, PersisterError>;
}

impl SagaFinderDefinition {
    /// Run this finder for `message` against state of type `entity_name`
    pub fn find(
        &self,
        entity_name: &str,
        persister: &dyn SagaPersister,
        message: &LogicalMessage,
    ) -> Result<Option<SagaEntity>, PersisterError> {
        let found = match &self.strategy {
            FinderStrategy::PropertyMatch {
                saga_property,
                accessor,
            } => match accessor(message) {
                None | Some(Value::Null) => {
                    tracing::debug!(
                        message_type = %self.message_type,
                        saga_property = %saga_property,
                        "Message carries no correlation value"
                    );
                    None
                }
                Some(value) => persister.get_by_property(entity_name, saga_property, &value)?,
            },
            FinderStrategy::Custom { finder, .. } => finder.find(persister, message)?,
        };

        match found {
            Some(entity) if entity.entity_name() != entity_name => {
                Err(PersisterError::EntityMismatch {
                    id: entity.id(),
                    stored: entity.entity_name().into(),
                    requested: entity_name.into(),
                })
            }
            found => Ok(found),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{InMemorySagaPersister, SagaPersisterExt, SagaState};
    use std::sync::Arc;

    #[test]
    fn test_property_match_finds_saved_state() {
        let model = Arc::new(order_model());
        let persister = InMemorySagaPersister::new(model.clone());
        let mut state = OrderSagaData::with_id(crate::SagaId::new(), "o-1");
        persister.save_state(&mut state).unwrap();

        let metadata = model.find_by_name(ORDER_SAGA).unwrap();
        let finder = metadata.finder(ORDER_SHIPPED).unwrap();

        let shipped = LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-1"));
        let entity = finder
            .find(metadata.entity_name(), &persister, &shipped)
            .unwrap()
            .unwrap();
        assert_eq!(entity.id(), state.id());

        let other = LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-2"));
        assert!(finder
            .find(metadata.entity_name(), &persister, &other)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_property_match_with_foreign_body_finds_nothing() {
        let model = Arc::new(order_model());
        let persister = InMemorySagaPersister::new(model.clone());
        let metadata = model.find_by_name(ORDER_SAGA).unwrap();
        let finder = metadata.finder(ORDER_SHIPPED).unwrap();

        let wrong_body = LogicalMessage::new(ORDER_SHIPPED, 42_u32);
        assert!(finder
            .find(metadata.entity_name(), &persister, &wrong_body)
            .unwrap()
            .is_none());
    }

    struct WrongTypeFinder;

    impl SagaFinder for WrongTypeFinder {
        fn find(
            &self,
            _persister: &dyn SagaPersister,
            _message: &LogicalMessage,
        ) -> Result<Option<SagaEntity>, PersisterError> {
            SagaEntity::from_state(&ShippingSagaData::with_id(crate::SagaId::new(), "o-1")).map(Some)
        }
    }

    #[test]
    fn test_custom_finder_result_must_match_entity() {
        let model = Arc::new(order_model());
        let persister = InMemorySagaPersister::new(model);
        let definition = SagaFinderDefinition {
            message_type: ORDER_SHIPPED.into(),
            strategy: FinderStrategy::Custom {
                finder_name: "wrong".into(),
                finder: Arc::new(WrongTypeFinder),
            },
            properties: Default::default(),
        };
        let message = LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-1"));
        let error = definition
            .find(OrderSagaData::entity_name(), &persister, &message)
            .unwrap_err();
        assert!(matches!(error, PersisterError::EntityMismatch { .. }));
    }
}
