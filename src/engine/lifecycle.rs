use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::assignment::AssignmentEngine;
use crate::error::AppError;
use crate::geo::distance_km;
use crate::models::assignment::{Assignment, AssignmentResponse};
use crate::models::catalog::Shop;
use crate::models::courier::Courier;
use crate::models::notification::{EventKind, Notification, Recipient};
use crate::models::order::{Actor, LineItem, Order, OrderStatus, OrderTimestamps, StatusChange};
use crate::observability::metrics::Metrics;
use crate::store::Store;

/// Result of a successful state change: the order as stored plus the
/// notifications the caller should hand to the outbox.
#[derive(Debug, Clone)]
pub struct Transition {
    pub order: Order,
    pub events: Vec<Notification>,
}

impl Transition {
    fn new(order: Order) -> Self {
        Self {
            order,
            events: Vec::new(),
        }
    }

    fn absorb(&mut self, later: Transition) {
        self.order = later.order;
        self.events.extend(later.events);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub quantity: u32,
}

/// Owns every write to an order. Each write is conditional on the revision
/// read at the start of the operation, so two racing transitions on the same
/// order cannot both land.
pub struct OrderMachine {
    store: Arc<dyn Store>,
    engine: AssignmentEngine,
    delivery_fee: u64,
    metrics: Metrics,
}

impl OrderMachine {
    pub fn new(
        store: Arc<dyn Store>,
        engine: AssignmentEngine,
        delivery_fee: u64,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            engine,
            delivery_fee,
            metrics,
        }
    }

    pub async fn create(
        &self,
        customer_id: Uuid,
        shop_id: Uuid,
        lines: Vec<OrderLine>,
    ) -> Result<Transition, AppError> {
        if lines.is_empty() {
            return Err(AppError::Validation(
                "order must contain at least one item".to_string(),
            ));
        }

        let shop = self
            .store
            .shop(shop_id)
            .await?
            .filter(|shop| shop.is_active)
            .ok_or_else(|| AppError::Validation(format!("shop {shop_id} is unknown or inactive")))?;

        let mut seen = HashSet::with_capacity(lines.len());
        let mut items = Vec::with_capacity(lines.len());

        for line in lines {
            if line.quantity == 0 {
                return Err(AppError::Validation(format!(
                    "quantity for product {} must be > 0",
                    line.product_id
                )));
            }
            if !seen.insert(line.product_id) {
                return Err(AppError::Validation(format!(
                    "product {} is listed more than once",
                    line.product_id
                )));
            }

            let product = self.store.product(line.product_id).await?.ok_or_else(|| {
                AppError::Validation(format!("product {} does not exist", line.product_id))
            })?;

            if product.shop_id != shop.id {
                return Err(AppError::Validation(format!(
                    "product {} is not sold by shop {}",
                    product.id, shop.id
                )));
            }
            if !product.is_active {
                return Err(AppError::Validation(format!(
                    "\"{}\" is not available for sale",
                    product.name
                )));
            }
            if product.stock < line.quantity {
                return Err(AppError::Validation(format!(
                    "only {} of \"{}\" left in stock",
                    product.stock, product.name
                )));
            }

            items.push(LineItem {
                product_id: product.id,
                name: product.name,
                quantity: line.quantity,
                unit_price: product.price,
            });
        }

        let subtotal = items
            .iter()
            .try_fold(0u64, |sum, item| sum.checked_add(item.line_total()?))
            .ok_or_else(|| AppError::Validation("order total is out of range".to_string()))?;
        let total = subtotal
            .checked_add(self.delivery_fee)
            .ok_or_else(|| AppError::Validation("order total is out of range".to_string()))?;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            customer_id,
            shop_id: shop.id,
            items,
            subtotal,
            delivery_fee: self.delivery_fee,
            total,
            status: OrderStatus::Created,
            assigned_courier: None,
            awaiting_manual_dispatch: false,
            close_reason: None,
            timestamps: OrderTimestamps {
                created_at: Some(now),
                ..OrderTimestamps::default()
            },
            history: vec![StatusChange {
                status: OrderStatus::Created,
                at: now,
                actor: Actor::Customer(customer_id),
            }],
            revision: 0,
        };

        self.store.insert_order(&order).await?;
        self.metrics
            .order_transitions_total
            .with_label_values(&[OrderStatus::Created.as_str()])
            .inc();

        info!(order_id = %order.id, shop_id = %shop.id, total = order.total, "order created");

        let events = vec![notice(
            &order,
            Recipient::ShopOwner(shop.owner_id),
            EventKind::OrderNew,
            json!({ "total": order.total, "items": order.items.len() }),
        )];

        Ok(Transition { order, events })
    }

    /// `created -> confirmed`, then tries to hand the order to a courier.
    /// A failed dispatch never undoes the confirmation.
    pub async fn confirm(&self, order_id: Uuid) -> Result<Transition, AppError> {
        let mut order = self.load(order_id).await?;
        ensure_transition(&order, OrderStatus::Confirmed)?;

        let now = Utc::now();
        order.status = OrderStatus::Confirmed;
        order.timestamps.confirmed_at = Some(now);
        let actor = Actor::Shop(order.shop_id);
        let order = self.commit(order, actor, now).await?;

        info!(order_id = %order.id, "order confirmed");

        let mut transition = Transition::new(order.clone());
        transition.events.push(notice(
            &order,
            Recipient::Customer(order.customer_id),
            EventKind::OrderConfirmed,
            json!({}),
        ));

        match self.dispatch(order, now).await {
            Ok(dispatched) => transition.absorb(dispatched),
            Err(err) => warn!(order_id = %order_id, error = %err, "dispatch after confirmation failed"),
        }

        Ok(transition)
    }

    /// `confirmed -> assigned` with an explicit courier (manual dispatch).
    pub async fn assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Transition, AppError> {
        let order = self.load(order_id).await?;

        if !order.status.is_terminal() {
            if let Some(current) = order.assigned_courier {
                return Err(AppError::Conflict(format!(
                    "order {order_id} is already assigned to courier {current}"
                )));
            }
        }
        ensure_transition(&order, OrderStatus::Assigned)?;

        if let Some(active) = self.engine.active_assignment(order_id).await? {
            return Err(AppError::Conflict(format!(
                "order {order_id} already has an open offer to courier {}",
                active.courier_id
            )));
        }

        let shop = self.shop(order.shop_id).await?;
        let now = Utc::now();
        let courier = self.engine.reserve(courier_id, now).await?;
        let distance = distance_km(&courier.location, &shop.location);

        self.bind(order, &shop, &courier, Some(distance), Actor::Operator, now)
            .await
    }

    pub async fn courier_accept(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Transition, AppError> {
        let now = Utc::now();
        let order = self.load(order_id).await?;
        let offer = self.pending_offer(order_id, courier_id, now).await?;

        self.engine
            .resolve(&offer, AssignmentResponse::Accepted, now)
            .await?;

        let shop = self.shop(order.shop_id).await?;
        let courier_name = self.store.courier(courier_id).await?.map(|courier| courier.name);

        info!(order_id = %order_id, courier_id = %courier_id, "courier accepted offer");

        let payload = json!({ "courier_id": courier_id, "courier_name": courier_name });
        let events = vec![
            notice(
                &order,
                Recipient::Customer(order.customer_id),
                EventKind::CourierAssigned,
                payload.clone(),
            ),
            notice(
                &order,
                Recipient::ShopOwner(shop.owner_id),
                EventKind::CourierAssigned,
                payload,
            ),
        ];

        Ok(Transition { order, events })
    }

    /// Reverts `assigned -> confirmed` and offers the order to the next courier.
    pub async fn courier_reject(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Transition, AppError> {
        let now = Utc::now();
        let offer = self.pending_offer(order_id, courier_id, now).await?;
        self.release_offer(offer, AssignmentResponse::Rejected, now).await
    }

    /// Expires every pending offer whose deadline is at or before `now`.
    /// Offers resolved concurrently by their courier are skipped.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Transition>, AppError> {
        let overdue = self.engine.overdue(now).await?;
        let mut transitions = Vec::with_capacity(overdue.len());

        for offer in overdue {
            let (offer_id, order_id) = (offer.id, offer.order_id);
            match self
                .release_offer(offer, AssignmentResponse::Expired, now)
                .await
            {
                Ok(transition) => transitions.push(transition),
                Err(AppError::Conflict(reason)) => {
                    debug!(assignment_id = %offer_id, reason = %reason, "offer resolved concurrently")
                }
                Err(err) => {
                    warn!(assignment_id = %offer_id, order_id = %order_id, error = %err, "failed to expire offer")
                }
            }
        }

        Ok(transitions)
    }

    pub async fn picked_up(&self, order_id: Uuid) -> Result<Transition, AppError> {
        let mut order = self.load(order_id).await?;
        ensure_transition(&order, OrderStatus::PickedUp)?;

        let accepted = self
            .engine
            .active_assignment(order_id)
            .await?
            .is_some_and(|offer| offer.response == AssignmentResponse::Accepted);
        if !accepted {
            return Err(AppError::InvalidTransition(format!(
                "order {order_id}: courier has not accepted the offer yet"
            )));
        }

        let now = Utc::now();
        order.status = OrderStatus::PickedUp;
        order.timestamps.picked_up_at = Some(now);
        let actor = courier_actor(&order);
        let order = self.commit(order, actor, now).await?;
        let shop = self.shop(order.shop_id).await?;

        info!(order_id = %order_id, "order picked up");

        let payload = json!({ "courier_id": order.assigned_courier });
        let events = vec![
            notice(
                &order,
                Recipient::Customer(order.customer_id),
                EventKind::CourierPickedUp,
                payload.clone(),
            ),
            notice(
                &order,
                Recipient::ShopOwner(shop.owner_id),
                EventKind::CourierPickedUp,
                payload,
            ),
        ];

        Ok(Transition { order, events })
    }

    pub async fn start_delivery(&self, order_id: Uuid) -> Result<Transition, AppError> {
        let mut order = self.load(order_id).await?;
        ensure_transition(&order, OrderStatus::InTransit)?;

        let now = Utc::now();
        order.status = OrderStatus::InTransit;
        order.timestamps.in_transit_at = Some(now);
        let actor = courier_actor(&order);
        let order = self.commit(order, actor, now).await?;

        info!(order_id = %order_id, "order in transit");

        let events = vec![notice(
            &order,
            Recipient::Customer(order.customer_id),
            EventKind::OrderInTransit,
            json!({ "courier_id": order.assigned_courier }),
        )];

        Ok(Transition { order, events })
    }

    pub async fn delivered(&self, order_id: Uuid) -> Result<Transition, AppError> {
        let mut order = self.load(order_id).await?;
        ensure_transition(&order, OrderStatus::Delivered)?;

        let now = Utc::now();
        order.status = OrderStatus::Delivered;
        order.timestamps.delivered_at = Some(now);
        let actor = courier_actor(&order);
        let order = self.commit(order, actor, now).await?;

        self.close_assignment(order_id, AssignmentResponse::Completed, now)
            .await;
        let shop = self.shop(order.shop_id).await?;

        info!(order_id = %order_id, "order delivered");

        let events = vec![
            notice(
                &order,
                Recipient::Customer(order.customer_id),
                EventKind::OrderDelivered,
                json!({}),
            ),
            notice(
                &order,
                Recipient::ShopOwner(shop.owner_id),
                EventKind::OrderDelivered,
                json!({ "total": order.total }),
            ),
        ];

        Ok(Transition { order, events })
    }

    pub async fn cancel(&self, order_id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.close(order_id, OrderStatus::Cancelled, reason).await
    }

    pub async fn fail(&self, order_id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.close(order_id, OrderStatus::Failed, reason).await
    }

    pub async fn order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.load(order_id).await
    }

    pub async fn assignments_for(&self, order_id: Uuid) -> Result<Vec<Assignment>, AppError> {
        self.load(order_id).await?;
        self.store.assignments_for_order(order_id).await
    }

    pub async fn assignments(&self) -> Result<Vec<Assignment>, AppError> {
        self.store.assignments().await
    }

    /// Confirmed orders no courier could be found for, oldest first.
    pub async fn manual_dispatch_queue(&self) -> Result<Vec<Order>, AppError> {
        let mut waiting: Vec<Order> = self
            .store
            .orders()
            .await?
            .into_iter()
            .filter(|order| order.awaiting_manual_dispatch && order.status == OrderStatus::Confirmed)
            .collect();
        waiting.sort_by_key(|order| order.timestamps.created_at);
        Ok(waiting)
    }

    async fn close(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        reason: &str,
    ) -> Result<Transition, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation("a reason is required".to_string()));
        }

        let mut order = self.load(order_id).await?;
        ensure_transition(&order, next)?;

        let now = Utc::now();
        order.status = next;
        order.close_reason = Some(reason.to_string());
        order.awaiting_manual_dispatch = false;
        match next {
            OrderStatus::Failed => order.timestamps.failed_at = Some(now),
            _ => order.timestamps.cancelled_at = Some(now),
        }
        let order = self.commit(order, Actor::Operator, now).await?;

        let withdrawn = self
            .close_assignment(order_id, AssignmentResponse::Withdrawn, now)
            .await;
        let shop = self.shop(order.shop_id).await?;

        info!(order_id = %order_id, status = %next, reason = %reason, "order closed");

        let kind = if next == OrderStatus::Failed {
            EventKind::OrderFailed
        } else {
            EventKind::OrderCancelled
        };
        let payload = json!({ "reason": reason });

        let mut events = vec![
            notice(&order, Recipient::Customer(order.customer_id), kind, payload.clone()),
            notice(&order, Recipient::ShopOwner(shop.owner_id), kind, payload.clone()),
        ];
        if let Some(offer) = withdrawn {
            events.push(notice(&order, Recipient::Courier(offer.courier_id), kind, payload));
        }

        Ok(Transition { order, events })
    }

    /// Walks the ranked candidates until one courier can be reserved. When
    /// the pool is exhausted the order stays `confirmed` and is flagged for
    /// manual dispatch.
    async fn dispatch(&self, order: Order, now: DateTime<Utc>) -> Result<Transition, AppError> {
        let started = Instant::now();
        let shop = self.shop(order.shop_id).await?;
        let candidates = self.engine.candidates(&order, &shop).await?;

        for candidate in candidates {
            match self.engine.reserve(candidate.courier.id, now).await {
                Ok(courier) => {
                    let result = self
                        .bind(
                            order,
                            &shop,
                            &courier,
                            Some(candidate.distance_km),
                            Actor::System,
                            now,
                        )
                        .await;
                    let outcome = if result.is_ok() { "assigned" } else { "error" };
                    self.engine
                        .record_dispatch(outcome, started.elapsed().as_secs_f64());
                    return result;
                }
                Err(AppError::Conflict(_)) | Err(AppError::NotFound(_)) => {
                    debug!(
                        order_id = %order.id,
                        courier_id = %candidate.courier.id,
                        "candidate taken before reservation"
                    );
                }
                Err(err) => {
                    self.engine
                        .record_dispatch("error", started.elapsed().as_secs_f64());
                    return Err(err);
                }
            }
        }

        self.engine
            .record_dispatch("exhausted", started.elapsed().as_secs_f64());
        self.flag_for_manual_dispatch(order, &shop).await
    }

    /// Writes the assignment for an already reserved courier. Any failure
    /// releases the courier and leaves the order as it was.
    async fn bind(
        &self,
        order: Order,
        shop: &Shop,
        courier: &Courier,
        distance: Option<f64>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Transition, AppError> {
        let mut next = order.clone();
        next.status = OrderStatus::Assigned;
        next.assigned_courier = Some(courier.id);
        next.awaiting_manual_dispatch = false;
        next.timestamps.assigned_at = Some(now);

        let committed = match self.commit(next, actor, now).await {
            Ok(committed) => committed,
            Err(err) => {
                self.release_quietly(courier.id, now).await;
                return Err(err);
            }
        };

        let offer = match self
            .engine
            .open_offer(order.id, courier.id, distance, now)
            .await
        {
            Ok(offer) => offer,
            Err(err) => {
                self.restore(&order, committed.revision).await;
                self.release_quietly(courier.id, now).await;
                return Err(err);
            }
        };

        info!(
            order_id = %order.id,
            courier_id = %courier.id,
            distance_km = distance,
            deadline = %offer.deadline,
            "courier offered order"
        );

        let events = vec![notice(
            &committed,
            Recipient::Courier(courier.id),
            EventKind::DeliveryOffer,
            json!({
                "assignment_id": offer.id,
                "deadline": offer.deadline,
                "distance_km": distance,
                "shop_name": shop.name,
            }),
        )];

        Ok(Transition {
            order: committed,
            events,
        })
    }

    /// Resolves a pending offer as rejected or expired, hands the order back
    /// to `confirmed` and re-runs dispatch. The offer is claimed first, so a
    /// racing accept either wins outright or sees `Conflict`.
    async fn release_offer(
        &self,
        offer: Assignment,
        outcome: AssignmentResponse,
        now: DateTime<Utc>,
    ) -> Result<Transition, AppError> {
        let resolved = self.engine.resolve(&offer, outcome, now).await?;

        let actor = match outcome {
            AssignmentResponse::Rejected => Actor::Courier(offer.courier_id),
            _ => Actor::System,
        };
        let order = match self.revert(&offer, actor, now).await {
            Ok(order) => order,
            Err(err) => {
                // Hand the offer back so the order keeps a live assignment.
                if let Err(undo) = self
                    .engine
                    .resolve(&resolved, AssignmentResponse::Pending, now)
                    .await
                {
                    error!(assignment_id = %offer.id, error = %undo, "failed to reopen offer");
                }
                return Err(err);
            }
        };
        let mut transition = Transition::new(order);

        self.release_quietly(offer.courier_id, now).await;

        info!(
            order_id = %offer.order_id,
            courier_id = %offer.courier_id,
            outcome = ?outcome,
            "offer released"
        );

        if outcome == AssignmentResponse::Expired {
            transition.events.push(notice(
                &transition.order,
                Recipient::Courier(offer.courier_id),
                EventKind::OfferWithdrawn,
                json!({ "assignment_id": offer.id, "reason": "expired" }),
            ));
        }

        if transition.order.status == OrderStatus::Confirmed {
            match self.dispatch(transition.order.clone(), now).await {
                Ok(dispatched) => transition.absorb(dispatched),
                Err(err) => {
                    warn!(order_id = %offer.order_id, error = %err, "re-dispatch failed")
                }
            }
        }

        Ok(transition)
    }

    /// `assigned -> confirmed` for the order `offer` was made on. Orders that
    /// already moved on (cancelled, reassigned) are returned as they are.
    async fn revert(
        &self,
        offer: &Assignment,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        for _ in 0..3 {
            let order = self.load(offer.order_id).await?;
            let holds_order = order.status.can_revert_to(OrderStatus::Confirmed)
                && order.assigned_courier == Some(offer.courier_id);
            if !holds_order {
                return Ok(order);
            }

            let mut reverted = order;
            reverted.status = OrderStatus::Confirmed;
            reverted.assigned_courier = None;
            reverted.timestamps.assigned_at = None;
            match self.commit(reverted, actor, now).await {
                Err(AppError::Conflict(_)) => continue,
                result => return result,
            }
        }

        Err(AppError::Conflict(format!(
            "order {} kept changing while releasing its offer",
            offer.order_id
        )))
    }

    async fn flag_for_manual_dispatch(
        &self,
        mut order: Order,
        shop: &Shop,
    ) -> Result<Transition, AppError> {
        if !order.awaiting_manual_dispatch {
            order.awaiting_manual_dispatch = true;
            order = self.store.replace_order(&order).await?;
        }

        warn!(order_id = %order.id, "no courier available, order awaits manual dispatch");

        let events = vec![notice(
            &order,
            Recipient::ShopOwner(shop.owner_id),
            EventKind::NoCourierAvailable,
            json!({ "order_id": order.id }),
        )];

        Ok(Transition { order, events })
    }

    async fn pending_offer(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Assignment, AppError> {
        let offer = self
            .store
            .assignments_for_order(order_id)
            .await?
            .into_iter()
            .find(|offer| {
                offer.courier_id == courier_id && offer.response == AssignmentResponse::Pending
            })
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no pending offer for courier {courier_id} on order {order_id}"
                ))
            })?;

        // Left pending on purpose: the sweeper owns the expiry transition.
        if offer.is_overdue(now) {
            return Err(AppError::Expired(format!(
                "offer {} expired at {}",
                offer.id, offer.deadline
            )));
        }

        Ok(offer)
    }

    /// Moves the order's live assignment (if any) to `next` and frees its
    /// courier. Runs after the order write has landed, so failures are
    /// logged rather than returned.
    async fn close_assignment(
        &self,
        order_id: Uuid,
        next: AssignmentResponse,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        for _ in 0..3 {
            let active = match self.engine.active_assignment(order_id).await {
                Ok(Some(active)) => active,
                Ok(None) => return None,
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "failed to load assignment");
                    return None;
                }
            };

            match self.engine.resolve(&active, next, now).await {
                Ok(closed) => {
                    self.release_quietly(closed.courier_id, now).await;
                    return Some(closed);
                }
                Err(AppError::Conflict(_)) => continue,
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "failed to close assignment");
                    return None;
                }
            }
        }

        warn!(order_id = %order_id, "assignment kept changing while closing it");
        None
    }

    async fn release_quietly(&self, courier_id: Uuid, now: DateTime<Utc>) {
        if let Err(err) = self.engine.release(courier_id, now).await {
            error!(courier_id = %courier_id, error = %err, "failed to release courier");
        }
    }

    // Compensating write: puts `previous` back on top of `revision`.
    async fn restore(&self, previous: &Order, revision: u64) {
        let mut restored = previous.clone();
        restored.revision = revision;
        if let Err(err) = self.store.replace_order(&restored).await {
            error!(order_id = %previous.id, error = %err, "failed to restore order");
        }
    }

    /// Writes a status change and appends it to the order's history.
    async fn commit(
        &self,
        mut order: Order,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        order.history.push(StatusChange {
            status: order.status,
            at,
            actor,
        });
        let stored = self.store.replace_order(&order).await?;
        self.metrics
            .order_transitions_total
            .with_label_values(&[stored.status.as_str()])
            .inc();
        Ok(stored)
    }

    async fn load(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn shop(&self, shop_id: Uuid) -> Result<Shop, AppError> {
        self.store
            .shop(shop_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("shop {shop_id} not found")))
    }
}

fn ensure_transition(order: &Order, next: OrderStatus) -> Result<(), AppError> {
    if order.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition(format!(
            "order {} cannot move from {} to {}",
            order.id, order.status, next
        )))
    }
}

fn courier_actor(order: &Order) -> Actor {
    order.assigned_courier.map_or(Actor::System, Actor::Courier)
}

fn notice(order: &Order, recipient: Recipient, kind: EventKind, payload: Value) -> Notification {
    Notification {
        recipient,
        kind,
        order_id: order.id,
        status: order.status,
        payload,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    use super::{OrderLine, OrderMachine};
    use crate::config::DispatchConfig;
    use crate::engine::assignment::AssignmentEngine;
    use crate::error::AppError;
    use crate::models::assignment::{Assignment, AssignmentResponse};
    use crate::models::catalog::{Product, Shop};
    use crate::models::courier::{Courier, CourierStatus, GeoPoint};
    use crate::models::notification::{EventKind, Recipient};
    use crate::models::order::{Actor, Order, OrderStatus};
    use crate::models::otp::OtpCode;
    use crate::observability::metrics::Metrics;
    use crate::store::{CourierUpdate, MemoryStore, Store, StoreStats};

    const SHOP_LOCATION: GeoPoint = GeoPoint { lat: 41.3111, lng: 69.2797 };

    struct Fixture {
        store: Arc<dyn Store>,
        machine: Arc<OrderMachine>,
        shop: Shop,
        plov: Product,
        somsa: Product,
    }

    async fn fixture_with(store: Arc<dyn Store>, config: DispatchConfig) -> Fixture {
        let shop = Shop {
            id: Uuid::new_v4(),
            name: "Chorsu Oshxona".to_string(),
            owner_id: Uuid::new_v4(),
            location: SHOP_LOCATION,
            is_active: true,
        };
        let plov = Product {
            id: Uuid::new_v4(),
            shop_id: shop.id,
            name: "Plov".to_string(),
            price: 50_000,
            stock: 10,
            is_active: true,
        };
        let somsa = Product {
            id: Uuid::new_v4(),
            shop_id: shop.id,
            name: "Somsa".to_string(),
            price: 25_000,
            stock: 10,
            is_active: true,
        };
        store.put_shop(shop.clone()).await.unwrap();
        store.put_product(plov.clone()).await.unwrap();
        store.put_product(somsa.clone()).await.unwrap();

        let metrics = Metrics::new();
        let engine = AssignmentEngine::new(store.clone(), config, metrics.clone());
        let machine = Arc::new(OrderMachine::new(store.clone(), engine, 0, metrics));

        Fixture {
            store,
            machine,
            shop,
            plov,
            somsa,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), DispatchConfig::default()).await
    }

    async fn add_courier(store: &Arc<dyn Store>, seed: u128) -> Courier {
        let courier = Courier {
            id: Uuid::from_u128(seed),
            name: format!("courier-{seed}"),
            location: GeoPoint { lat: 41.3120, lng: 69.2800 },
            status: CourierStatus::Available,
            max_distance_km: 10.0,
            rating: 4.8,
            last_assigned_at: None,
            updated_at: Utc::now(),
        };
        store.put_courier(courier.clone()).await.unwrap();
        courier
    }

    impl Fixture {
        fn lines(&self) -> Vec<OrderLine> {
            vec![
                OrderLine { product_id: self.plov.id, quantity: 2 },
                OrderLine { product_id: self.somsa.id, quantity: 2 },
            ]
        }

        async fn created_order(&self) -> Order {
            self.machine
                .create(Uuid::new_v4(), self.shop.id, self.lines())
                .await
                .unwrap()
                .order
        }

        async fn courier_status(&self, id: Uuid) -> CourierStatus {
            self.store.courier(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn create_prices_items_from_catalog() {
        let fx = fixture().await;
        let transition = fx
            .machine
            .create(Uuid::new_v4(), fx.shop.id, fx.lines())
            .await
            .unwrap();

        assert_eq!(transition.order.status, OrderStatus::Created);
        assert_eq!(transition.order.subtotal, 150_000);
        assert_eq!(transition.order.total, 150_000);
        assert!(transition.order.assigned_courier.is_none());
        assert_eq!(transition.events.len(), 1);
        assert_eq!(transition.events[0].kind, EventKind::OrderNew);
        assert_eq!(transition.events[0].recipient, Recipient::ShopOwner(fx.shop.owner_id));
    }

    #[tokio::test]
    async fn create_rejects_bad_lines() {
        let fx = fixture().await;
        let customer = Uuid::new_v4();

        let empty = fx.machine.create(customer, fx.shop.id, vec![]).await;
        assert!(matches!(empty, Err(AppError::Validation(_))));

        let unknown = fx
            .machine
            .create(
                customer,
                fx.shop.id,
                vec![OrderLine { product_id: Uuid::new_v4(), quantity: 1 }],
            )
            .await;
        assert!(matches!(unknown, Err(AppError::Validation(_))));

        let too_many = fx
            .machine
            .create(
                customer,
                fx.shop.id,
                vec![OrderLine { product_id: fx.plov.id, quantity: 11 }],
            )
            .await;
        assert!(matches!(too_many, Err(AppError::Validation(_))));

        let other_shop = fx
            .machine
            .create(
                customer,
                Uuid::new_v4(),
                vec![OrderLine { product_id: fx.plov.id, quantity: 1 }],
            )
            .await;
        assert!(matches!(other_shop, Err(AppError::Validation(_))));

        let repeated = fx
            .machine
            .create(
                customer,
                fx.shop.id,
                vec![
                    OrderLine { product_id: fx.plov.id, quantity: 1 },
                    OrderLine { product_id: fx.plov.id, quantity: 1 },
                ],
            )
            .await;
        assert!(matches!(repeated, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn confirm_assigns_only_available_courier_and_reject_reverts() {
        let fx = fixture().await;
        let c1 = add_courier(&fx.store, 1).await;
        let order = fx.created_order().await;

        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        assert_eq!(confirmed.order.status, OrderStatus::Assigned);
        assert_eq!(confirmed.order.assigned_courier, Some(c1.id));
        assert!(confirmed
            .events
            .iter()
            .any(|e| e.kind == EventKind::DeliveryOffer && e.recipient == Recipient::Courier(c1.id)));
        assert_eq!(fx.courier_status(c1.id).await, CourierStatus::Busy);

        let rejected = fx.machine.courier_reject(order.id, c1.id).await.unwrap();
        assert_eq!(rejected.order.status, OrderStatus::Confirmed);
        assert!(rejected.order.assigned_courier.is_none());
        assert!(rejected.order.awaiting_manual_dispatch);
        assert!(rejected
            .events
            .iter()
            .any(|e| e.kind == EventKind::NoCourierAvailable));

        let assignments = fx.machine.assignments_for(order.id).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].response, AssignmentResponse::Rejected);
        assert_eq!(fx.courier_status(c1.id).await, CourierStatus::Available);

        let queue = fx.machine.manual_dispatch_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, order.id);
    }

    #[tokio::test]
    async fn reject_moves_offer_to_next_courier() {
        let fx = fixture().await;
        let first = add_courier(&fx.store, 1).await;
        let second = add_courier(&fx.store, 2).await;
        let order = fx.created_order().await;

        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        let offered = confirmed.order.assigned_courier.unwrap();
        let other = if offered == first.id { second.id } else { first.id };

        let rejected = fx.machine.courier_reject(order.id, offered).await.unwrap();
        assert_eq!(rejected.order.status, OrderStatus::Assigned);
        assert_eq!(rejected.order.assigned_courier, Some(other));

        let again = fx.machine.courier_reject(order.id, offered).await;
        assert!(matches!(again, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn full_delivery_frees_courier() {
        let fx = fixture().await;
        let courier = add_courier(&fx.store, 7).await;
        let order = fx.created_order().await;

        fx.machine.confirm(order.id).await.unwrap();
        let accepted = fx.machine.courier_accept(order.id, courier.id).await.unwrap();
        assert_eq!(accepted.order.status, OrderStatus::Assigned);
        assert!(accepted.events.iter().any(|e| e.kind == EventKind::CourierAssigned));

        fx.machine.picked_up(order.id).await.unwrap();
        fx.machine.start_delivery(order.id).await.unwrap();
        let delivered = fx.machine.delivered(order.id).await.unwrap();

        assert_eq!(delivered.order.status, OrderStatus::Delivered);
        assert!(delivered.order.timestamps.delivered_at.is_some());
        assert_eq!(fx.courier_status(courier.id).await, CourierStatus::Available);

        let assignments = fx.machine.assignments_for(order.id).await.unwrap();
        assert_eq!(assignments[0].response, AssignmentResponse::Completed);
    }

    #[tokio::test]
    async fn pickup_requires_accepted_offer() {
        let fx = fixture().await;
        add_courier(&fx.store, 3).await;
        let order = fx.created_order().await;
        fx.machine.confirm(order.id).await.unwrap();

        let result = fx.machine.picked_up(order.id).await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
        assert_eq!(fx.machine.order(order.id).await.unwrap().status, OrderStatus::Assigned);
    }

    #[tokio::test]
    async fn out_of_graph_transitions_leave_status_unchanged() {
        let fx = fixture().await;
        let order = fx.created_order().await;

        assert!(matches!(
            fx.machine.start_delivery(order.id).await,
            Err(AppError::InvalidTransition(_))
        ));
        assert!(matches!(
            fx.machine.delivered(order.id).await,
            Err(AppError::InvalidTransition(_))
        ));
        assert!(matches!(
            fx.machine.assign_courier(order.id, Uuid::new_v4()).await,
            Err(AppError::InvalidTransition(_))
        ));

        let stored = fx.machine.order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Created);
        assert_eq!(stored.revision, order.revision);
    }

    #[tokio::test]
    async fn cancel_after_delivery_is_rejected() {
        let fx = fixture().await;
        let courier = add_courier(&fx.store, 4).await;
        let order = fx.created_order().await;

        fx.machine.confirm(order.id).await.unwrap();
        fx.machine.courier_accept(order.id, courier.id).await.unwrap();
        fx.machine.picked_up(order.id).await.unwrap();
        fx.machine.start_delivery(order.id).await.unwrap();
        fx.machine.delivered(order.id).await.unwrap();

        let result = fx.machine.cancel(order.id, "changed my mind").await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
        assert_eq!(fx.machine.order(order.id).await.unwrap().status, OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn cancel_withdraws_offer_and_frees_courier() {
        let fx = fixture().await;
        let courier = add_courier(&fx.store, 5).await;
        let order = fx.created_order().await;
        fx.machine.confirm(order.id).await.unwrap();

        let cancelled = fx.machine.cancel(order.id, "shop closed").await.unwrap();
        assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.order.close_reason.as_deref(), Some("shop closed"));
        assert!(cancelled
            .events
            .iter()
            .any(|e| e.recipient == Recipient::Courier(courier.id)));
        assert_eq!(fx.courier_status(courier.id).await, CourierStatus::Available);

        let assignments = fx.machine.assignments_for(order.id).await.unwrap();
        assert_eq!(assignments[0].response, AssignmentResponse::Withdrawn);

        let twice = fx.machine.fail(order.id, "lost").await;
        assert!(matches!(twice, Err(AppError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn fail_is_terminal() {
        let fx = fixture().await;
        let order = fx.created_order().await;

        let failed = fx.machine.fail(order.id, "payment declined").await.unwrap();
        assert_eq!(failed.order.status, OrderStatus::Failed);
        assert!(failed.order.timestamps.failed_at.is_some());
        assert!(matches!(
            fx.machine.confirm(order.id).await,
            Err(AppError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn expired_offer_goes_to_next_courier() {
        let fx = fixture().await;
        add_courier(&fx.store, 1).await;
        add_courier(&fx.store, 2).await;
        let order = fx.created_order().await;

        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        let first = confirmed.order.assigned_courier.unwrap();

        let later = Utc::now() + Duration::minutes(2);
        let transitions = fx.machine.expire_overdue(later).await.unwrap();
        assert_eq!(transitions.len(), 1);

        let moved = &transitions[0];
        assert_eq!(moved.order.status, OrderStatus::Assigned);
        assert_ne!(moved.order.assigned_courier, Some(first));
        assert!(moved
            .events
            .iter()
            .any(|e| e.kind == EventKind::OfferWithdrawn && e.recipient == Recipient::Courier(first)));

        let assignments = fx.machine.assignments_for(order.id).await.unwrap();
        assert_eq!(assignments[0].response, AssignmentResponse::Expired);
        assert_eq!(assignments[1].response, AssignmentResponse::Pending);
        assert_eq!(fx.courier_status(first).await, CourierStatus::Available);
    }

    #[tokio::test]
    async fn accepting_after_deadline_is_expired() {
        let config = DispatchConfig {
            response_timeout: Duration::zero(),
            ..DispatchConfig::default()
        };
        let fx = fixture_with(Arc::new(MemoryStore::new()), config).await;
        let courier = add_courier(&fx.store, 9).await;
        let order = fx.created_order().await;
        fx.machine.confirm(order.id).await.unwrap();

        let result = fx.machine.courier_accept(order.id, courier.id).await;
        assert!(matches!(result, Err(AppError::Expired(_))));

        let active = fx.machine.assignments_for(order.id).await.unwrap();
        assert_ne!(active[0].response, AssignmentResponse::Accepted);
    }

    #[tokio::test]
    async fn assigning_an_assigned_order_conflicts() {
        let fx = fixture().await;
        add_courier(&fx.store, 1).await;
        let spare = add_courier(&fx.store, 2).await;
        let order = fx.created_order().await;
        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        let taken = confirmed.order.assigned_courier.unwrap();
        let other = if taken == spare.id { Uuid::from_u128(1) } else { spare.id };

        let result = fx.machine.assign_courier(order.id, other).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(fx.courier_status(other).await, CourierStatus::Available);
    }

    #[tokio::test]
    async fn confirming_twice_keeps_a_single_offer() {
        let fx = fixture().await;
        let c1 = add_courier(&fx.store, 1).await;
        let c2 = add_courier(&fx.store, 2).await;
        let order = fx.created_order().await;

        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        let offered = confirmed.order.assigned_courier.unwrap();
        let spare = if offered == c1.id { c2.id } else { c1.id };

        let again = fx.machine.confirm(order.id).await;
        assert!(matches!(again, Err(AppError::InvalidTransition(_))));

        let stored = fx.machine.order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Assigned);
        assert_eq!(stored.assigned_courier, Some(offered));

        let active: Vec<Assignment> = fx
            .machine
            .assignments_for(order.id)
            .await
            .unwrap()
            .into_iter()
            .filter(Assignment::is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(fx.courier_status(spare).await, CourierStatus::Available);
    }

    #[tokio::test]
    async fn history_survives_reject_and_reassignment() {
        let fx = fixture().await;
        add_courier(&fx.store, 1).await;
        add_courier(&fx.store, 2).await;
        let order = fx.created_order().await;

        let confirmed = fx.machine.confirm(order.id).await.unwrap();
        let first = confirmed.order.assigned_courier.unwrap();
        let rejected = fx.machine.courier_reject(order.id, first).await.unwrap();
        let second = rejected.order.assigned_courier.unwrap();

        let stored = fx.machine.order(order.id).await.unwrap();
        let trail: Vec<(OrderStatus, Actor)> = stored
            .history
            .iter()
            .map(|change| (change.status, change.actor))
            .collect();
        assert_eq!(
            trail,
            vec![
                (OrderStatus::Created, Actor::Customer(order.customer_id)),
                (OrderStatus::Confirmed, Actor::Shop(fx.shop.id)),
                (OrderStatus::Assigned, Actor::System),
                (OrderStatus::Confirmed, Actor::Courier(first)),
                (OrderStatus::Assigned, Actor::System),
            ]
        );
        assert!(stored.history.windows(2).all(|pair| pair[0].at <= pair[1].at));

        fx.machine.courier_accept(order.id, second).await.unwrap();
        let picked = fx.machine.picked_up(order.id).await.unwrap();
        let last = picked.order.history.last().unwrap();
        assert_eq!(last.status, OrderStatus::PickedUp);
        assert_eq!(last.actor, Actor::Courier(second));
        assert_eq!(picked.order.history.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_assignments_never_double_book_a_courier() {
        let fx = fixture().await;

        let mut order_ids = Vec::new();
        for _ in 0..8 {
            let order = fx.created_order().await;
            // nobody online yet, so confirmation leaves the order waiting
            fx.machine.confirm(order.id).await.unwrap();
            order_ids.push(order.id);
        }

        let courier = add_courier(&fx.store, 42).await;

        let handles: Vec<_> = order_ids
            .iter()
            .map(|order_id| {
                let machine = fx.machine.clone();
                let order_id = *order_id;
                tokio::spawn(async move { machine.assign_courier(order_id, courier.id).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(matches!(err, AppError::Conflict(_)), "unexpected {err}"),
            }
        }

        assert_eq!(winners, 1);
        let active: Vec<Assignment> = fx
            .machine
            .assignments()
            .await
            .unwrap()
            .into_iter()
            .filter(Assignment::is_active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        AssignmentInsert,
        Revert,
    }

    /// Delegates to a memory store but fails one kind of write.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
        offers_at_revert: Mutex<Vec<AssignmentResponse>>,
    }

    impl FaultyStore {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryStore::new(),
                fault,
                offers_at_revert: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Store for FaultyStore {
        async fn put_shop(&self, shop: Shop) -> Result<(), AppError> {
            self.inner.put_shop(shop).await
        }
        async fn shop(&self, id: Uuid) -> Result<Option<Shop>, AppError> {
            self.inner.shop(id).await
        }
        async fn put_product(&self, product: Product) -> Result<(), AppError> {
            self.inner.put_product(product).await
        }
        async fn product(&self, id: Uuid) -> Result<Option<Product>, AppError> {
            self.inner.product(id).await
        }
        async fn put_courier(&self, courier: Courier) -> Result<(), AppError> {
            self.inner.put_courier(courier).await
        }
        async fn courier(&self, id: Uuid) -> Result<Option<Courier>, AppError> {
            self.inner.courier(id).await
        }
        async fn couriers(&self) -> Result<Vec<Courier>, AppError> {
            self.inner.couriers().await
        }
        async fn modify_courier(
            &self,
            id: Uuid,
            apply: CourierUpdate<'_>,
        ) -> Result<Courier, AppError> {
            self.inner.modify_courier(id, apply).await
        }
        async fn insert_order(&self, order: &Order) -> Result<(), AppError> {
            self.inner.insert_order(order).await
        }
        async fn order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
            self.inner.order(id).await
        }
        async fn orders(&self) -> Result<Vec<Order>, AppError> {
            self.inner.orders().await
        }
        async fn replace_order(&self, order: &Order) -> Result<Order, AppError> {
            let reverting = order.status == OrderStatus::Confirmed
                && order.history.iter().any(|change| change.status == OrderStatus::Assigned);
            if self.fault == Fault::Revert && reverting {
                let offers = self.inner.assignments_for_order(order.id).await?;
                self.offers_at_revert
                    .lock()
                    .unwrap()
                    .extend(offers.iter().map(|offer| offer.response));
                return Err(AppError::Persistence("orders table unavailable".to_string()));
            }
            self.inner.replace_order(order).await
        }
        async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), AppError> {
            if self.fault == Fault::AssignmentInsert {
                return Err(AppError::Persistence("assignments table unavailable".to_string()));
            }
            self.inner.insert_assignment(assignment).await
        }
        async fn assignments(&self) -> Result<Vec<Assignment>, AppError> {
            self.inner.assignments().await
        }
        async fn assignments_for_order(&self, order_id: Uuid) -> Result<Vec<Assignment>, AppError> {
            self.inner.assignments_for_order(order_id).await
        }
        async fn resolve_assignment(
            &self,
            id: Uuid,
            expected: AssignmentResponse,
            next: AssignmentResponse,
            at: DateTime<Utc>,
        ) -> Result<Assignment, AppError> {
            self.inner.resolve_assignment(id, expected, next, at).await
        }
        async fn otp(&self, identifier: &str) -> Result<Option<OtpCode>, AppError> {
            self.inner.otp(identifier).await
        }
        async fn put_otp(&self, code: &OtpCode) -> Result<(), AppError> {
            self.inner.put_otp(code).await
        }
        async fn replace_otp(&self, code: &OtpCode) -> Result<OtpCode, AppError> {
            self.inner.replace_otp(code).await
        }
        async fn stats(&self) -> Result<StoreStats, AppError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn failed_assignment_write_leaves_no_partial_state() {
        let fx = fixture_with(
            Arc::new(FaultyStore::new(Fault::AssignmentInsert)),
            DispatchConfig::default(),
        )
        .await;
        let order = fx.created_order().await;
        fx.machine.confirm(order.id).await.unwrap();
        let courier = add_courier(&fx.store, 11).await;

        let result = fx.machine.assign_courier(order.id, courier.id).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));

        let stored = fx.machine.order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert!(stored.assigned_courier.is_none());
        assert_eq!(fx.courier_status(courier.id).await, CourierStatus::Available);
    }

    #[tokio::test]
    async fn reject_claims_offer_before_reverting_order() {
        let store = Arc::new(FaultyStore::new(Fault::Revert));
        let fx = fixture_with(store.clone(), DispatchConfig::default()).await;
        let courier = add_courier(&fx.store, 12).await;
        let order = fx.created_order().await;
        fx.machine.confirm(order.id).await.unwrap();

        let result = fx.machine.courier_reject(order.id, courier.id).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));

        // the offer was already resolved when the order write was attempted
        assert_eq!(
            *store.offers_at_revert.lock().unwrap(),
            vec![AssignmentResponse::Rejected]
        );

        let stored = fx.machine.order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Assigned);
        assert_eq!(stored.assigned_courier, Some(courier.id));
        let offers = fx.machine.assignments_for(order.id).await.unwrap();
        assert_eq!(offers[0].response, AssignmentResponse::Pending);
        assert_eq!(fx.courier_status(courier.id).await, CourierStatus::Busy);

        fx.machine.courier_accept(order.id, courier.id).await.unwrap();
    }
}
