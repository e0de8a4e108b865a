//! Immutable registry of all saga metadata

use std::collections::HashMap;
use std::sync::Arc;

use crate::{MetadataBuilder, SagaConfigError, SagaMetadata, TypeCatalog};

/// All known sagas, indexed by name, state entity and message type.
///
/// Built once at startup; read-only afterwards.
#[derive(Debug, Default)]
pub struct SagaMetaModel {
    sagas: Vec<Arc<SagaMetadata>>,
    by_name: HashMap<Box<str>, Arc<SagaMetadata>>,
    by_entity_name: HashMap<Box<str>, Arc<SagaMetadata>>,
    by_message_type: HashMap<Box<str>, Vec<Arc<SagaMetadata>>>,
}

impl SagaMetaModel {
    /// Build metadata for every saga in the catalog.
    ///
    /// Any invalid saga aborts the whole build.
    pub fn build(catalog: &TypeCatalog) -> Result<Self, SagaConfigError> {
        let metadata = catalog
            .sagas()
            .iter()
            .map(|definition| MetadataBuilder::build(definition, catalog))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_metadata(metadata)
    }

    /// Index already-built metadata
    pub fn from_metadata(metadata: Vec<SagaMetadata>) -> Result<Self, SagaConfigError> {
        let mut model = Self::default();

        for saga in metadata {
            let saga = Arc::new(saga);

            if model.by_name.contains_key(saga.name()) {
                return Err(SagaConfigError::DuplicateSaga {
                    name: saga.name().into(),
                });
            }
            if let Some(owner) = model.by_entity_name.get(saga.entity_name()) {
                return Err(SagaConfigError::InvalidSagaDefinition {
                    saga: saga.name().into(),
                    reason: format!(
                        "state '{}' is already owned by saga '{}'",
                        saga.entity_name(),
                        owner.name()
                    )
                    .into(),
                });
            }

            model.by_name.insert(saga.name().into(), saga.clone());
            model
                .by_entity_name
                .insert(saga.entity_name().into(), saga.clone());
            for message in saga.associated_messages() {
                model
                    .by_message_type
                    .entry(message.message_type.clone())
                    .or_default()
                    .push(saga.clone());
            }
            model.sagas.push(saga);
        }

        tracing::debug!(sagas = model.sagas.len(), "Saga meta model built");
        Ok(model)
    }

    /// Find a saga by name
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<SagaMetadata>> {
        self.by_name.get(name)
    }

    /// Find the saga owning a state entity
    pub fn find_by_entity_name(&self, entity_name: &str) -> Option<&Arc<SagaMetadata>> {
        self.by_entity_name.get(entity_name)
    }

    /// Sagas associated with a message type, in registration order.
    ///
    /// Empty for messages no saga cares about.
    pub fn find_by_message_type(&self, message_type: &str) -> &[Arc<SagaMetadata>] {
        self.by_message_type
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All sagas in registration order
    pub fn all(&self) -> &[Arc<SagaMetadata>] {
        &self.sagas
    }
}
