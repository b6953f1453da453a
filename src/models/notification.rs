use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Customer(Uuid),
    Courier(Uuid),
    ShopOwner(Uuid),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OrderNew,
    OrderConfirmed,
    DeliveryOffer,
    CourierAssigned,
    OfferWithdrawn,
    NoCourierAvailable,
    CourierPickedUp,
    OrderInTransit,
    OrderDelivered,
    OrderCancelled,
    OrderFailed,
}

/// One outbox entry produced by an order transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub kind: EventKind,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
