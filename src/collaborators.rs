//! Collaborator traits supplied by the surrounding infrastructure

use crate::{ActiveSagaInstance, LogicalMessage, PipelineError};

/// Invoked when a message correlates to no saga and cannot start one
pub trait SagaNotFoundHandler: Send + Sync + 'static {
    /// Handle the orphaned message
    fn handle(&self, saga_name: &str, message: &LogicalMessage);
}

/// Service holding messages deferred until a later time (saga timeouts).
///
/// The saga core only ever clears: timeouts are requested by saga logic
/// through the bus, outside this crate.
pub trait MessageDeferrer: Send + Sync + 'static {
    /// Drop every deferred message whose header `header_key` equals `header_value`
    fn clear_deferred_messages(
        &self,
        header_key: &str,
        header_value: &str,
    ) -> Result<(), PipelineError>;
}

/// Deferrer for endpoints without a timeout store
#[derive(Debug, Default)]
pub struct NoOpDeferrer;

impl MessageDeferrer for NoOpDeferrer {
    fn clear_deferred_messages(
        &self,
        _header_key: &str,
        _header_value: &str,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Saga logic invoked for messages correlated to an instance of the saga.
///
/// Handlers mutate the attached state and may call
/// [`ActiveSagaInstance::mark_as_complete`].
pub trait SagaHandler: Send + Sync + 'static {
    /// Name of the saga this handler implements
    fn saga_name(&self) -> &str;

    /// Handle one message against the loaded or created state
    fn handle(
        &self,
        message: &LogicalMessage,
        instance: &mut ActiveSagaInstance,
    ) -> Result<(), PipelineError>;
}
