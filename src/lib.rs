//! Saga orchestration core for message-bus runtimes
//!
//! Derives saga metadata from declarative saga definitions, persists saga state
//! with optimistic concurrency, and runs the incoming behavior chain that loads,
//! invokes and commits sagas for each message.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Describe messages and sagas once at startup
//! let catalog = TypeCatalog::new()
//!     .messages(["OrderPlaced", "OrderShipped"])
//!     .saga(
//!         SagaDefinition::new::<OrderSagaData>("OrderSaga")
//!             .started_by("OrderPlaced")
//!             .handles("OrderShipped")
//!             .map_property("OrderPlaced", "order_id", |m: &OrderPlaced| m.order_id.clone())
//!             .map_property("OrderShipped", "order_id", |m: &OrderShipped| m.order_id.clone()),
//!     );
//! let model = Arc::new(SagaMetaModel::build(&catalog)?);
//!
//! // 2. Register the saga behaviors
//! let persister = Arc::new(InMemorySagaPersister::new(model.clone()));
//! let mut registry = BehaviorRegistry::new();
//! registry
//!     .register_instance(ASSOCIATE_MESSAGE_WITH_SAGAS, Arc::new(AssociateMessageWithSagas::new(model)))
//!     .register_instance(SAGA_PERSISTENCE, Arc::new(SagaPersistenceBehavior::new(persister)))
//!     .register_instance(INVOKE_SAGA_HANDLERS, Arc::new(InvokeSagaHandlers::new([order_handler])));
//!
//! // 3. Run every incoming message through the chain
//! let executor = PipelineExecutor::new(
//!     [ASSOCIATE_MESSAGE_WITH_SAGAS, SAGA_PERSISTENCE, INVOKE_SAGA_HANDLERS],
//!     Arc::new(registry),
//! );
//! executor.invoke(&mut IncomingContext::new(message))?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod context;
mod errors;
mod state;

// === Metadata ===
mod catalog;
mod meta_model;
mod metadata;

// === Storage ===
mod finders;
mod persister;

// === Pipeline ===
mod behaviors;
mod collaborators;
mod pipeline;

// === Observability ===
mod observer;
mod stats;

#[cfg(any(test, feature = "test-harness"))]
#[allow(missing_docs)]
pub mod test_support;

// === Re-exports ===

// Types
pub use context::{headers, IncomingContext, LogicalMessage, MessageIntent, SagaId};

// State
pub use state::{
    ActiveSagaInstance, InstanceResolution, SagaEntity, SagaEnvelope, SagaState, StateDescriptor,
};

// Errors
pub use errors::{PersisterError, PipelineError, SagaConfigError};

// Metadata
pub use catalog::{FinderRegistration, PropertyMapping, SagaDefinition, TypeCatalog};
pub use meta_model::SagaMetaModel;
pub use metadata::{
    FinderStrategy, MetadataBuilder, PropertyAccessor, SagaFinderDefinition, SagaMessage,
    SagaMetadata, UniquenessAnalyzer,
};

// Storage
pub use finders::SagaFinder;
pub use persister::{
    default_owner_label, InMemorySagaPersister, PersisterOptions, SagaPersister, SagaPersisterExt,
};

// Pipeline
pub use behaviors::{
    well_known_steps, AssociateMessageWithSagas, InvokeSagaHandlers, SagaPersistenceBehavior,
    SagaPersistenceOptions,
};
pub use collaborators::{MessageDeferrer, NoOpDeferrer, SagaHandler, SagaNotFoundHandler};
pub use pipeline::{
    Behavior, BehaviorBuilder, BehaviorChain, BehaviorRegistry, Next, PipelineExecutor,
    PipelineInstance, Step,
};

// Observability
pub use observer::{InMemoryDiagnostics, NoOpDiagnostics, PipelineDiagnostics, TracingDiagnostics};
pub use stats::{SagaStats, SagaStatsSnapshot};
