use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle.
///
/// ```text
/// created ─▶ confirmed ─▶ assigned ─▶ picked_up ─▶ in_transit ─▶ delivered
///                 ▲            │
///                 └────────────┘  (courier rejected / offer expired)
///
/// any non-terminal ─▶ cancelled | failed
/// ```
///
/// The `assigned -> confirmed` edge is only taken when an offer is rejected
/// or expires, so it is not part of [`OrderStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Confirmed,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (Created, Confirmed)
                | (Confirmed, Assigned)
                | (Assigned, PickedUp)
                | (PickedUp, InTransit)
                | (InTransit, Delivered)
                | (_, Cancelled)
                | (_, Failed)
        )
    }

    /// Whether a released offer may hand the order back to `previous`.
    pub fn can_revert_to(self, previous: OrderStatus) -> bool {
        matches!((self, previous), (Self::Assigned, Self::Confirmed))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Confirmed => "confirmed",
            Self::Assigned => "assigned",
            Self::PickedUp => "picked_up",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: u32,
    /// Catalog price captured when the order was placed.
    pub unit_price: u64,
}

impl LineItem {
    /// `None` on overflow.
    pub fn line_total(&self) -> Option<u64> {
        self.unit_price.checked_mul(u64::from(self.quantity))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub in_transit_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Who moved an order to a new status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Customer(Uuid),
    Shop(Uuid),
    Courier(Uuid),
    Operator,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
    pub actor: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub items: Vec<LineItem>,
    pub subtotal: u64,
    pub delivery_fee: u64,
    pub total: u64,
    pub status: OrderStatus,
    pub assigned_courier: Option<Uuid>,
    pub awaiting_manual_dispatch: bool,
    pub close_reason: Option<String>,
    pub timestamps: OrderTimestamps,
    /// Every status the order has been in, oldest first.
    pub history: Vec<StatusChange>,
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::OrderStatus::*;

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(Created.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(PickedUp));
        assert!(PickedUp.can_transition_to(InTransit));
        assert!(InTransit.can_transition_to(Delivered));
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!Created.can_transition_to(Assigned));
        assert!(!Confirmed.can_transition_to(PickedUp));
        assert!(!Assigned.can_transition_to(Delivered));
        assert!(!PickedUp.can_transition_to(Confirmed));
    }

    #[test]
    fn revert_is_not_a_regular_transition() {
        assert!(!Assigned.can_transition_to(Confirmed));
        assert!(Assigned.can_revert_to(Confirmed));
        assert!(!PickedUp.can_revert_to(Confirmed));
        assert!(!Confirmed.can_revert_to(Created));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Delivered, Cancelled, Failed] {
            for next in [Created, Confirmed, Assigned, PickedUp, InTransit, Delivered, Cancelled, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn cancellation_reachable_from_every_open_state() {
        for open in [Created, Confirmed, Assigned, PickedUp, InTransit] {
            assert!(open.can_transition_to(Cancelled));
            assert!(open.can_transition_to(Failed));
        }
    }
}
