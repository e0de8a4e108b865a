//! Test fixtures: an order saga, a shipping saga and their messages

use serde::{Deserialize, Serialize};

use crate::{SagaDefinition, SagaEnvelope, SagaId, SagaMetaModel, SagaState, TypeCatalog};

pub const ORDER_PLACED: &str = "OrderPlaced";
pub const ORDER_SHIPPED: &str = "OrderShipped";
pub const PAYMENT_RECEIVED: &str = "PaymentReceived";
pub const ORDER_SAGA: &str = "OrderSaga";
pub const SHIPPING_SAGA: &str = "ShippingSaga";

/// Install a `fmt` subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSagaData {
    #[serde(flatten)]
    pub envelope: SagaEnvelope,
    pub order_id: String,
    pub total: u64,
    pub tracking_code: Option<String>,
    pub paid: bool,
}

impl OrderSagaData {
    pub fn with_id(id: SagaId, order_id: &str) -> Self {
        Self {
            envelope: SagaEnvelope::new(id),
            order_id: order_id.into(),
            ..Self::default()
        }
    }
}

impl SagaState for OrderSagaData {
    const UNIQUE_PROPERTIES: &'static [&'static str] = &["tracking_code"];

    fn entity_name() -> &'static str {
        "OrderSagaData"
    }

    fn envelope(&self) -> &SagaEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SagaEnvelope {
        &mut self.envelope
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingSagaData {
    #[serde(flatten)]
    pub envelope: SagaEnvelope,
    pub order_id: String,
    pub shipments: u32,
}

impl ShippingSagaData {
    pub fn with_id(id: SagaId, order_id: &str) -> Self {
        Self {
            envelope: SagaEnvelope::new(id),
            order_id: order_id.into(),
            ..Self::default()
        }
    }
}

impl SagaState for ShippingSagaData {
    fn entity_name() -> &'static str {
        "ShippingSagaData"
    }

    fn envelope(&self) -> &SagaEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut SagaEnvelope {
        &mut self.envelope
    }
}

#[derive(Clone, Debug)]
pub struct OrderPlaced {
    pub order_id: String,
    pub total: u64,
}

impl OrderPlaced {
    pub fn new(order_id: &str, total: u64) -> Self {
        Self {
            order_id: order_id.into(),
            total,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrderShipped {
    pub order_id: String,
}

impl OrderShipped {
    pub fn new(order_id: &str) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PaymentReceived {
    pub amount: u64,
}

/// Catalog classifying the fixture messages, without any saga
pub fn order_catalog() -> TypeCatalog {
    TypeCatalog::new().messages([ORDER_PLACED, ORDER_SHIPPED, PAYMENT_RECEIVED])
}

/// Started by `OrderPlaced`, correlated by `order_id`; `PaymentReceived`
/// reaches it only through the saga id header
pub fn order_saga() -> SagaDefinition {
    SagaDefinition::new::<OrderSagaData>(ORDER_SAGA)
        .started_by(ORDER_PLACED)
        .handles(ORDER_SHIPPED)
        .handles(PAYMENT_RECEIVED)
        .map_property(ORDER_PLACED, "order_id", |m: &OrderPlaced| m.order_id.clone())
        .map_property(ORDER_SHIPPED, "order_id", |m: &OrderShipped| m.order_id.clone())
}

/// Started by `OrderShipped`, correlated by `order_id`
pub fn shipping_saga() -> SagaDefinition {
    SagaDefinition::new::<ShippingSagaData>(SHIPPING_SAGA)
        .started_by(ORDER_SHIPPED)
        .map_property(ORDER_SHIPPED, "order_id", |m: &OrderShipped| m.order_id.clone())
}

/// Model holding both fixture sagas
pub fn order_model() -> SagaMetaModel {
    let catalog = order_catalog().saga(order_saga()).saga(shipping_saga());
    match SagaMetaModel::build(&catalog) {
        Ok(model) => model,
        Err(e) => panic!("fixture sagas must build: {e}"),
    }
}
