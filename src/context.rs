//! Saga identity, message headers and the per-message pipeline context

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ActiveSagaInstance, SagaMetadata};

/// Unique identifier for a saga (conversation) instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(pub Uuid);

impl SagaId {
    /// Create a fresh, time-ordered saga ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The nil ID, never assigned to a persisted saga
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Check whether this is the nil ID
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse an ID carried in a message header
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }

    /// Get the raw UUID value
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::nil()
    }
}

impl std::fmt::Debug for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SagaId({})", self.0)
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known message header keys
pub mod headers {
    /// Id of the saga a message is addressed to
    pub const SAGA_ID: &str = "SagaId";
    /// Name of the saga a message is addressed to
    pub const SAGA_TYPE: &str = "SagaType";
    /// Id of the physical message
    pub const MESSAGE_ID: &str = "MessageId";
    /// Address replies should be sent to
    pub const REPLY_TO_ADDRESS: &str = "ReplyToAddress";
    /// Present on messages requested as saga timeouts
    pub const IS_SAGA_TIMEOUT_MESSAGE: &str = "IsSagaTimeoutMessage";
}

/// How a message was sent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageIntent {
    /// Point-to-point command
    #[default]
    Send,
    /// Event published to subscribers
    Publish,
    /// Reply to a previous message
    Reply,
}

/// A deserialized message as produced by the upstream routing steps
#[derive(Clone)]
pub struct LogicalMessage {
    message_type: Box<str>,
    intent: MessageIntent,
    headers: HashMap<String, String>,
    body: Arc<dyn Any + Send + Sync>,
}

impl LogicalMessage {
    /// Wrap a message body under its message type identifier
    pub fn new<M>(message_type: impl Into<Box<str>>, body: M) -> Self
    where
        M: Any + Send + Sync,
    {
        Self {
            message_type: message_type.into(),
            intent: MessageIntent::Send,
            headers: HashMap::new(),
            body: Arc::new(body),
        }
    }

    /// Set a header (builder style)
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the message intent (builder style)
    pub fn with_intent(mut self, intent: MessageIntent) -> Self {
        self.intent = intent;
        self
    }

    /// Message type identifier
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Message intent
    pub fn intent(&self) -> MessageIntent {
        self.intent
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Mutable access to the headers
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// Downcast the body to a concrete message type
    pub fn body<M: Any>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// Saga id carried in the headers, if any and well-formed
    pub fn saga_id(&self) -> Option<SagaId> {
        self.header(headers::SAGA_ID)
            .filter(|raw| !raw.is_empty())
            .and_then(SagaId::parse)
    }

    /// True if the message was requested as a saga timeout
    pub fn is_timeout(&self) -> bool {
        self.headers.contains_key(headers::IS_SAGA_TIMEOUT_MESSAGE)
    }
}

impl std::fmt::Debug for LogicalMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalMessage")
            .field("message_type", &self.message_type)
            .field("intent", &self.intent)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Context passed through the incoming behavior chain for one logical message
#[derive(Debug)]
pub struct IncomingContext {
    /// The message being processed
    pub message: LogicalMessage,
    /// Sagas associated with the message type
    pub sagas: Vec<Arc<SagaMetadata>>,
    /// Saga instances loaded or created for this message
    pub active_sagas: Vec<ActiveSagaInstance>,
}

impl IncomingContext {
    /// Create a context for an incoming message
    pub fn new(message: LogicalMessage) -> Self {
        Self {
            message,
            sagas: Vec::new(),
            active_sagas: Vec::new(),
        }
    }

    /// Find the active instance for a saga by name
    pub fn active_saga(&self, saga_name: &str) -> Option<&ActiveSagaInstance> {
        self.active_sagas
            .iter()
            .find(|instance| instance.metadata().name() == saga_name)
    }

    /// Find the active instance for a saga by name (mutable)
    pub fn active_saga_mut(&mut self, saga_name: &str) -> Option<&mut ActiveSagaInstance> {
        self.active_sagas
            .iter_mut()
            .find(|instance| instance.metadata().name() == saga_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_id_header_parsing() {
        let id = SagaId::new();
        let message = LogicalMessage::new("OrderShipped", ())
            .with_header(headers::SAGA_ID, id.to_string());
        assert_eq!(message.saga_id(), Some(id));

        let empty = LogicalMessage::new("OrderShipped", ()).with_header(headers::SAGA_ID, "");
        assert_eq!(empty.saga_id(), None);

        let garbage = LogicalMessage::new("OrderShipped", ()).with_header(headers::SAGA_ID, "nope");
        assert_eq!(garbage.saga_id(), None);
    }

    #[test]
    fn test_body_downcast() {
        let message = LogicalMessage::new("Ping", 42u32);
        assert_eq!(message.body::<u32>(), Some(&42));
        assert!(message.body::<String>().is_none());
    }
}
