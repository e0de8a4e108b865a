//! Saga behaviors for the incoming pipeline: associate, persist, invoke

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::headers;
use crate::{
    ActiveSagaInstance, Behavior, FinderStrategy, IncomingContext, LogicalMessage, MessageDeferrer,
    MessageIntent, Next, NoOpDeferrer, PersisterError, PipelineError, SagaEnvelope, SagaHandler,
    SagaId, SagaMetaModel, SagaMetadata, SagaNotFoundHandler, SagaPersister, SagaStats,
};

/// Identifiers the saga behaviors are conventionally registered under
pub mod well_known_steps {
    /// [`AssociateMessageWithSagas`](super::AssociateMessageWithSagas)
    pub const ASSOCIATE_MESSAGE_WITH_SAGAS: &str = "AssociateMessageWithSagas";
    /// [`SagaPersistenceBehavior`](super::SagaPersistenceBehavior)
    pub const SAGA_PERSISTENCE: &str = "SagaPersistence";
    /// [`InvokeSagaHandlers`](super::InvokeSagaHandlers)
    pub const INVOKE_SAGA_HANDLERS: &str = "InvokeSagaHandlers";
}

/// Options for the association step
#[derive(Clone, Debug)]
pub struct SagaPersistenceOptions {
    /// Remove saga id/type headers from published events before correlation
    pub strip_saga_headers_on_publish: bool,
}

impl Default for SagaPersistenceOptions {
    fn default() -> Self {
        Self {
            strip_saga_headers_on_publish: true,
        }
    }
}

/// Looks up the sagas associated with the message type and stores them on the context
pub struct AssociateMessageWithSagas {
    model: Arc<SagaMetaModel>,
    options: SagaPersistenceOptions,
}

impl AssociateMessageWithSagas {
    /// Create the step over a built model
    pub fn new(model: Arc<SagaMetaModel>) -> Self {
        Self::with_options(model, SagaPersistenceOptions::default())
    }

    /// Create the step with explicit options
    pub fn with_options(model: Arc<SagaMetaModel>, options: SagaPersistenceOptions) -> Self {
        Self { model, options }
    }
}

impl Behavior<IncomingContext> for AssociateMessageWithSagas {
    fn invoke(
        &self,
        context: &mut IncomingContext,
        next: &mut Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        let message = &mut context.message;
        if self.options.strip_saga_headers_on_publish && message.intent() == MessageIntent::Publish
        {
            let message_headers = message.headers_mut();
            message_headers.remove(headers::SAGA_ID);
            message_headers.remove(headers::SAGA_TYPE);
        }

        context.sagas = self
            .model
            .find_by_message_type(context.message.message_type())
            .to_vec();

        if !context.sagas.is_empty() {
            tracing::debug!(
                message_type = %context.message.message_type(),
                sagas = context.sagas.len(),
                "Message associated with sagas"
            );
        }

        next.invoke(context)
    }
}

/// True if a `SagaType` header value designates the saga `name`.
///
/// Senders may qualify the name (`OrderSaga, Sales`); the part before the
/// first comma must equal the saga name.
fn names_saga(saga_type: &str, name: &str) -> bool {
    saga_type
        .split(',')
        .next()
        .is_some_and(|qualified| qualified.trim() == name)
}

/// Loads or creates saga state before the handlers run and commits it after.
///
/// For every saga associated with the message the state is resolved by the
/// `SagaId` header when present, otherwise by the saga's finder for the
/// message type. Unresolved messages either start a new conversation or are
/// reported to the not-found handlers. Once the rest of the pipeline returns,
/// each instance is saved, updated or completed in association order.
pub struct SagaPersistenceBehavior {
    persister: Arc<dyn SagaPersister>,
    deferrer: Arc<dyn MessageDeferrer>,
    not_found_handlers: Vec<Arc<dyn SagaNotFoundHandler>>,
    stats: Arc<SagaStats>,
}

impl SagaPersistenceBehavior {
    /// Create the step over a persister
    pub fn new(persister: Arc<dyn SagaPersister>) -> Self {
        Self {
            persister,
            deferrer: Arc::new(NoOpDeferrer),
            not_found_handlers: Vec::new(),
            stats: Arc::new(SagaStats::new()),
        }
    }

    /// Clear outstanding timeouts through `deferrer` when a saga completes
    pub fn with_deferrer(mut self, deferrer: Arc<dyn MessageDeferrer>) -> Self {
        self.deferrer = deferrer;
        self
    }

    /// Add a handler for messages no saga could be found for
    pub fn with_not_found_handler(mut self, handler: Arc<dyn SagaNotFoundHandler>) -> Self {
        self.not_found_handlers.push(handler);
        self
    }

    /// Share a statistics block
    pub fn with_stats(mut self, stats: Arc<SagaStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Statistics kept by this step
    pub fn stats(&self) -> &Arc<SagaStats> {
        &self.stats
    }

    fn resolve(
        &self,
        metadata: &Arc<SagaMetadata>,
        message: &LogicalMessage,
    ) -> Result<ActiveSagaInstance, PipelineError> {
        let mut instance = ActiveSagaInstance::new(metadata.clone());
        if message.is_timeout() {
            instance.mark_as_timeout();
        }

        let names_this_saga = message
            .header(headers::SAGA_TYPE)
            .map(|saga_type| names_saga(saga_type, metadata.name()));
        let saga_id = message
            .saga_id()
            .filter(|_| names_this_saga.unwrap_or(true));
        // an id addressed to this saga by name is a reply or timeout, never a start
        let addressed = saga_id.is_some() && names_this_saga == Some(true);

        let entity_name = metadata.entity_name();
        let message_type = message.message_type();
        let finder = metadata.finder(message_type);

        let loaded = match (saga_id, finder) {
            (Some(id), _) => self.persister.get(entity_name, id)?,
            (None, Some(finder)) => finder.find(entity_name, &*self.persister, message)?,
            (None, None) => {
                tracing::debug!(
                    saga = %metadata.name(),
                    message_type = %message_type,
                    "No saga id header and no finder for message"
                );
                None
            }
        };

        if let Some(entity) = loaded {
            instance.attach_existing_entity(entity);
        } else if !addressed && metadata.is_message_allowed_to_start(message_type) {
            let mut envelope = SagaEnvelope::new(SagaId::new());
            envelope.originator = message.header(headers::REPLY_TO_ADDRESS).map(String::from);
            envelope.original_message_id = message.header(headers::MESSAGE_ID).map(String::from);

            let mut entity = metadata.state().new_entity(envelope)?;
            if let Some(FinderStrategy::PropertyMatch {
                saga_property,
                accessor,
            }) = finder.map(|f| &f.strategy)
            {
                if let Some(value) = accessor(message) {
                    entity.set_property(&**saga_property, value);
                }
            }
            instance.attach_new_entity(entity);
        } else {
            instance.mark_as_not_found();
            self.invoke_not_found_handlers(metadata.name(), message);
        }

        if let Some(resolution) = instance.resolution() {
            self.stats.record_resolution(resolution);
        }
        Ok(instance)
    }

    fn invoke_not_found_handlers(&self, saga: &str, message: &LogicalMessage) {
        tracing::info!(
            saga = %saga,
            message_type = %message.message_type(),
            handlers = self.not_found_handlers.len(),
            "Could not find a saga for the message, invoking saga not found handlers"
        );
        for handler in &self.not_found_handlers {
            tracing::debug!(saga = %saga, "Invoking saga not found handler");
            handler.handle(saga, message);
        }
    }

    fn commit(&self, mut instance: ActiveSagaInstance) -> Result<(), PipelineError> {
        if instance.not_found() {
            return Ok(());
        }
        let Some(mut entity) = instance.take_entity() else {
            return Ok(());
        };
        let saga = instance.metadata().name();
        let saga_id = entity.id();

        if instance.is_completed() {
            if !instance.is_new() {
                self.persister
                    .complete(&entity)
                    .map_err(|e| self.rejected(saga, saga_id, e))?;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            self.deferrer
                .clear_deferred_messages(headers::SAGA_ID, &saga_id.to_string())?;
            tracing::debug!(saga = %saga, saga_id = %saga_id, "Saga has completed");
        } else if instance.is_new() {
            self.persister
                .save(&mut entity)
                .map_err(|e| self.rejected(saga, saga_id, e))?;
            self.stats.saved.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(saga = %saga, saga_id = %saga_id, "Saga saved");
        } else {
            self.persister
                .update(&mut entity)
                .map_err(|e| self.rejected(saga, saga_id, e))?;
            self.stats.updated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(saga = %saga, saga_id = %saga_id, "Saga updated");
        }
        Ok(())
    }

    fn rejected(&self, saga: &str, saga_id: SagaId, error: PersisterError) -> PipelineError {
        if error.is_concurrency_conflict() || error.is_duplicate_unique_value() {
            tracing::warn!(saga = %saga, saga_id = %saga_id, error = %error, "Saga write rejected");
        }
        self.stats.record_failure(&error);
        error.into()
    }
}

impl Behavior<IncomingContext> for SagaPersistenceBehavior {
    fn invoke(
        &self,
        context: &mut IncomingContext,
        next: &mut Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        if context.sagas.is_empty() {
            return next.invoke(context);
        }

        let first = context.active_sagas.len();
        for metadata in &context.sagas {
            let instance = self.resolve(metadata, &context.message)?;
            context.active_sagas.push(instance);
        }

        next.invoke(context)?;

        let resolved: Vec<_> = context.active_sagas.drain(first..).collect();
        for instance in resolved {
            self.commit(instance)?;
        }
        Ok(())
    }
}

/// Dispatches the message to the saga handlers of every resolved instance
pub struct InvokeSagaHandlers {
    handlers: HashMap<Box<str>, Arc<dyn SagaHandler>>,
}

impl InvokeSagaHandlers {
    /// Index handlers by the saga they implement
    pub fn new<I>(handlers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn SagaHandler>>,
    {
        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| (handler.saga_name().into(), handler))
                .collect(),
        }
    }
}

impl Behavior<IncomingContext> for InvokeSagaHandlers {
    fn invoke(
        &self,
        context: &mut IncomingContext,
        next: &mut Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        let message = &context.message;
        for instance in context.active_sagas.iter_mut().filter(|i| !i.not_found()) {
            let metadata = instance.metadata().clone();
            match self.handlers.get(metadata.name()) {
                Some(handler) => handler.handle(message, instance)?,
                None => tracing::debug!(saga = %metadata.name(), "No handler registered for saga"),
            }
        }

        next.invoke(context)
    }
}

#[cfg(test)]
mod tests {
    use super::well_known_steps::*;
    use super::*;
    use crate::test_support::*;
    use crate::{
        BehaviorRegistry, InMemorySagaPersister, PipelineExecutor, SagaPersisterExt, SagaState,
        SagaStatsSnapshot,
    };
    use std::sync::Mutex;

    type HandlerFn =
        dyn Fn(&LogicalMessage, &mut ActiveSagaInstance) -> Result<(), PipelineError> + Send + Sync;

    struct FnHandler {
        saga: &'static str,
        handle: Box<HandlerFn>,
    }

    impl FnHandler {
        fn new<F>(saga: &'static str, handle: F) -> Arc<dyn SagaHandler>
        where
            F: Fn(&LogicalMessage, &mut ActiveSagaInstance) -> Result<(), PipelineError>
                + Send
                + Sync
                + 'static,
        {
            Arc::new(Self {
                saga,
                handle: Box::new(handle),
            })
        }
    }

    impl SagaHandler for FnHandler {
        fn saga_name(&self) -> &str {
            self.saga
        }

        fn handle(
            &self,
            message: &LogicalMessage,
            instance: &mut ActiveSagaInstance,
        ) -> Result<(), PipelineError> {
            (self.handle)(message, instance)
        }
    }

    #[derive(Default)]
    struct RecordingDeferrer(Mutex<Vec<(String, String)>>);

    impl MessageDeferrer for RecordingDeferrer {
        fn clear_deferred_messages(
            &self,
            header_key: &str,
            header_value: &str,
        ) -> Result<(), PipelineError> {
            self.0
                .lock()
                .unwrap()
                .push((header_key.to_string(), header_value.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotFound(Mutex<Vec<String>>);

    impl SagaNotFoundHandler for RecordingNotFound {
        fn handle(&self, saga_name: &str, message: &LogicalMessage) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{saga_name}:{}", message.message_type()));
        }
    }

    struct Harness {
        persister: Arc<InMemorySagaPersister>,
        deferrer: Arc<RecordingDeferrer>,
        not_found: Arc<RecordingNotFound>,
        stats: Arc<SagaStats>,
        executor: PipelineExecutor<IncomingContext>,
    }

    impl Harness {
        fn new(handlers: Vec<Arc<dyn SagaHandler>>) -> Self {
            init_tracing();
            let model = Arc::new(order_model());
            let persister = Arc::new(InMemorySagaPersister::new(model.clone()));
            let deferrer = Arc::new(RecordingDeferrer::default());
            let not_found = Arc::new(RecordingNotFound::default());
            let stats = Arc::new(SagaStats::new());

            let persistence = SagaPersistenceBehavior::new(persister.clone())
                .with_deferrer(deferrer.clone())
                .with_not_found_handler(not_found.clone())
                .with_stats(stats.clone());

            let mut registry = BehaviorRegistry::new();
            registry
                .register_instance(
                    ASSOCIATE_MESSAGE_WITH_SAGAS,
                    Arc::new(AssociateMessageWithSagas::new(model)),
                )
                .register_instance(SAGA_PERSISTENCE, Arc::new(persistence))
                .register_instance(INVOKE_SAGA_HANDLERS, Arc::new(InvokeSagaHandlers::new(handlers)));

            let executor = PipelineExecutor::new(
                [ASSOCIATE_MESSAGE_WITH_SAGAS, SAGA_PERSISTENCE, INVOKE_SAGA_HANDLERS],
                Arc::new(registry),
            );

            Self {
                persister,
                deferrer,
                not_found,
                stats,
                executor,
            }
        }

        fn send(&self, message: LogicalMessage) -> Result<(), PipelineError> {
            self.executor.invoke(&mut IncomingContext::new(message))
        }

        fn order(&self, order_id: &str) -> Option<OrderSagaData> {
            self.persister
                .find_state_by_property("order_id", order_id)
                .unwrap()
        }

        fn not_found(&self) -> Vec<String> {
            self.not_found.0.lock().unwrap().clone()
        }
    }

    fn order_handler() -> Arc<dyn SagaHandler> {
        FnHandler::new(ORDER_SAGA, |message, instance| {
            let mut state = instance.state::<OrderSagaData>().unwrap()?;
            if let Some(placed) = message.body::<OrderPlaced>() {
                state.total = placed.total;
            }
            if message.body::<OrderShipped>().is_some() {
                state.tracking_code = Some(format!("TRK-{}", state.order_id));
            }
            if message.body::<PaymentReceived>().is_some() {
                state.paid = true;
                instance.mark_as_complete();
            }
            instance.set_state(&state)?;
            Ok(())
        })
    }

    fn placed(order_id: &str) -> LogicalMessage {
        LogicalMessage::new(ORDER_PLACED, OrderPlaced::new(order_id, 30))
            .with_header(headers::MESSAGE_ID, "msg-1")
            .with_header(headers::REPLY_TO_ADDRESS, "sales@host")
    }

    #[test]
    fn test_start_message_creates_and_saves_saga() {
        let harness = Harness::new(vec![order_handler()]);
        harness.send(placed("o-1")).unwrap();

        let saved = harness.order("o-1").unwrap();
        assert_eq!(saved.total, 30);
        assert_eq!(saved.envelope.originator.as_deref(), Some("sales@host"));
        assert_eq!(saved.envelope.original_message_id.as_deref(), Some("msg-1"));
        assert!(!saved.id().is_nil());
        assert_eq!(
            harness.stats.snapshot(),
            SagaStatsSnapshot {
                created: 1,
                saved: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_follow_up_updates_and_starts_second_saga() {
        let harness = Harness::new(vec![order_handler()]);
        harness.send(placed("o-1")).unwrap();
        let id = harness.order("o-1").unwrap().id();

        harness
            .send(LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-1")))
            .unwrap();

        let order = harness.order("o-1").unwrap();
        assert_eq!(order.id(), id);
        assert_eq!(order.tracking_code.as_deref(), Some("TRK-o-1"));

        let shipping: ShippingSagaData = harness
            .persister
            .find_state_by_property("order_id", "o-1")
            .unwrap()
            .unwrap();
        assert_ne!(shipping.id(), id);

        let stats = harness.stats.snapshot();
        assert_eq!((stats.found, stats.created), (1, 2));
        assert_eq!((stats.saved, stats.updated), (2, 1));
    }

    #[test]
    fn test_saga_id_header_completes_saga() {
        let harness = Harness::new(vec![order_handler()]);
        harness.send(placed("o-1")).unwrap();
        let id = harness.order("o-1").unwrap().id();

        let payment = LogicalMessage::new(PAYMENT_RECEIVED, PaymentReceived { amount: 30 })
            .with_header(headers::SAGA_ID, id.to_string());
        harness.send(payment).unwrap();

        assert!(harness.order("o-1").is_none());
        assert!(harness
            .persister
            .get_state::<OrderSagaData>(id)
            .unwrap()
            .is_none());
        assert_eq!(
            *harness.deferrer.0.lock().unwrap(),
            vec![(headers::SAGA_ID.to_string(), id.to_string())]
        );
        assert_eq!(harness.stats.snapshot().completed, 1);
    }

    #[test]
    fn test_uncorrelated_message_is_not_found() {
        let invoked = Arc::new(Mutex::new(0));
        let counter = invoked.clone();
        let handler = FnHandler::new(ORDER_SAGA, move |_, _| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let harness = Harness::new(vec![handler]);

        harness
            .send(LogicalMessage::new(PAYMENT_RECEIVED, PaymentReceived { amount: 1 }))
            .unwrap();

        assert_eq!(harness.not_found(), vec!["OrderSaga:PaymentReceived"]);
        assert_eq!(*invoked.lock().unwrap(), 0);
        assert!(harness.persister.is_empty().unwrap());
        assert_eq!(harness.stats.snapshot().not_found, 1);
    }

    #[test]
    fn test_id_addressed_to_saga_never_starts_it() {
        let harness = Harness::new(vec![order_handler()]);

        let late = placed("o-1")
            .with_header(headers::SAGA_ID, SagaId::new().to_string())
            .with_header(headers::SAGA_TYPE, ORDER_SAGA);
        harness.send(late).unwrap();
        assert_eq!(harness.not_found(), vec!["OrderSaga:OrderPlaced"]);
        assert!(harness.order("o-1").is_none());

        // an id meant for another saga type is ignored and the finder decides
        let foreign = placed("o-1")
            .with_header(headers::SAGA_ID, SagaId::new().to_string())
            .with_header(headers::SAGA_TYPE, "BillingSaga");
        harness.send(foreign).unwrap();
        assert!(harness.order("o-1").is_some());
    }

    #[test]
    fn test_saga_type_header_matching() {
        assert!(names_saga("OrderSaga", "OrderSaga"));
        assert!(names_saga("OrderSaga, Sales, Version=1.0", "OrderSaga"));
        assert!(!names_saga("OrderSagaV2", "OrderSaga"));
        assert!(!names_saga("Order", "OrderSaga"));
    }

    #[test]
    fn test_qualified_saga_type_still_blocks_start() {
        let harness = Harness::new(vec![order_handler()]);
        let late = placed("o-1")
            .with_header(headers::SAGA_ID, SagaId::new().to_string())
            .with_header(headers::SAGA_TYPE, "OrderSaga, Sales");
        harness.send(late).unwrap();
        assert_eq!(harness.not_found(), vec!["OrderSaga:OrderPlaced"]);
        assert!(harness.order("o-1").is_none());
    }

    #[test]
    fn test_handler_cannot_retarget_state_to_another_saga() {
        let target: Arc<Mutex<Option<SagaId>>> = Default::default();
        let slot = target.clone();
        let retarget = FnHandler::new(ORDER_SAGA, move |_, instance| {
            let Some(other) = *slot.lock().unwrap() else {
                return Ok(());
            };
            let mut state = instance.state::<OrderSagaData>().unwrap()?;
            state.envelope.id = other;
            state.order_id = "B".into();
            state.total = 666;
            instance.set_state(&state)?;
            Ok(())
        });
        let harness = Harness::new(vec![retarget]);
        harness.send(placed("A")).unwrap();
        harness.send(placed("B")).unwrap();
        let b = harness.order("B").unwrap();
        *target.lock().unwrap() = Some(b.id());

        let error = harness
            .send(LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("A")))
            .unwrap_err();
        assert!(matches!(
            error,
            PipelineError::Persister(PersisterError::IdChanged { .. })
        ));
        assert_eq!(harness.order("B").unwrap(), b);
        assert!(harness.order("A").is_some());
    }

    #[test]
    fn test_published_events_ignore_saga_id() {
        let harness = Harness::new(vec![order_handler()]);
        harness.send(placed("o-1")).unwrap();
        let id = harness.order("o-1").unwrap().id();

        let event = LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-2"))
            .with_intent(MessageIntent::Publish)
            .with_header(headers::SAGA_ID, id.to_string());
        harness.send(event).unwrap();

        assert_eq!(harness.not_found(), vec!["OrderSaga:OrderShipped"]);
        assert!(harness.order("o-1").unwrap().tracking_code.is_none());
    }

    #[test]
    fn test_stale_commit_surfaces_conflict() {
        let persister_slot: Arc<Mutex<Option<Arc<InMemorySagaPersister>>>> = Default::default();
        let slot = persister_slot.clone();
        let racing = FnHandler::new(ORDER_SAGA, move |_, instance| {
            if instance.is_new() {
                return Ok(());
            }
            let id = instance.saga_id().unwrap();
            let persister = slot.lock().unwrap().clone().unwrap();
            let mut other: OrderSagaData = persister.get_state(id).unwrap().unwrap();
            other.total = 7;
            persister.update_state(&mut other).unwrap();
            Ok(())
        });

        let harness = Harness::new(vec![racing]);
        *persister_slot.lock().unwrap() = Some(harness.persister.clone());
        harness.send(placed("o-1")).unwrap();

        let error = harness
            .send(LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-1")))
            .unwrap_err();
        assert!(error.is_retriable());
        assert!(error.to_string().contains("already saved by [Worker."));
        assert_eq!(harness.order("o-1").unwrap().total, 7);
        assert_eq!(harness.stats.snapshot().concurrency_conflicts, 1);
    }

    #[test]
    fn test_duplicate_start_is_rejected() {
        let harness = Harness::new(vec![order_handler()]);
        harness.send(placed("o-1")).unwrap();

        // the finder matches the live saga, so a second start message updates it
        harness.send(placed("o-1")).unwrap();
        assert_eq!(harness.stats.snapshot().updated, 1);

        let copy = FnHandler::new(ORDER_SAGA, |_, instance| {
            if let Some(entity) = instance.entity_mut() {
                entity.set_property("order_id", serde_json::Value::from("o-1"));
            }
            Ok(())
        });
        let harness = Harness::new(vec![copy]);
        harness.send(placed("o-1")).unwrap();
        let error = harness.send(placed("o-2")).unwrap_err();
        assert!(matches!(
            error,
            PipelineError::Persister(PersisterError::DuplicateUniqueValue { .. })
        ));
        assert_eq!(harness.stats.snapshot().duplicate_unique_values, 1);
    }

    #[test]
    fn test_timeout_flag_reaches_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let handler = FnHandler::new(ORDER_SAGA, move |_, instance| {
            record.lock().unwrap().push(instance.is_timeout());
            Ok(())
        });
        let harness = Harness::new(vec![handler]);
        harness.send(placed("o-1")).unwrap();

        let timeout = LogicalMessage::new(ORDER_SHIPPED, OrderShipped::new("o-1"))
            .with_header(headers::IS_SAGA_TIMEOUT_MESSAGE, "True");
        harness.send(timeout).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn test_unrelated_message_passes_through() {
        let harness = Harness::new(vec![order_handler()]);
        harness
            .send(LogicalMessage::new("Heartbeat", ()))
            .unwrap();
        assert!(harness.persister.is_empty().unwrap());
        assert_eq!(harness.stats.snapshot(), SagaStatsSnapshot::default());
    }

    #[test]
    fn test_new_saga_completed_immediately_is_never_stored() {
        let handler = FnHandler::new(ORDER_SAGA, |_, instance| {
            instance.mark_as_complete();
            Ok(())
        });
        let harness = Harness::new(vec![handler]);
        harness.send(placed("o-1")).unwrap();

        assert!(harness.persister.is_empty().unwrap());
        assert_eq!(harness.deferrer.0.lock().unwrap().len(), 1);
        assert_eq!(harness.stats.snapshot().completed, 0);
    }
}
