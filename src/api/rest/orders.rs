use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::lifecycle::{OrderLine, Transition};
use crate::engine::outbox::enqueue_events;
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::order::Order;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/assignments", get(order_assignments))
        .route("/orders/:id/confirm", post(confirm_order))
        .route("/orders/:id/assign", post(assign_courier))
        .route("/orders/:id/accept", post(accept_offer))
        .route("/orders/:id/reject", post(reject_offer))
        .route("/orders/:id/pickup", post(pick_up))
        .route("/orders/:id/start-delivery", post(start_delivery))
        .route("/orders/:id/deliver", post(deliver))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/fail", post(fail_order))
        .route("/assignments", get(list_assignments))
        .route("/dispatch/manual", get(manual_dispatch_queue))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub items: Vec<OrderLine>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourierRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseRequest {
    pub reason: String,
}

// Events go out only after the transition is stored.
fn publish(state: &AppState, transition: Transition) -> Json<Order> {
    enqueue_events(state, transition.events);
    Json(transition.order)
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state
        .orders
        .create(payload.customer_id, payload.shop_id, payload.items)
        .await?;
    Ok(publish(&state, transition))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.order(id).await?))
}

async fn order_assignments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Assignment>>, AppError> {
    Ok(Json(state.orders.assignments_for(id).await?))
}

async fn confirm_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.confirm(id).await?;
    Ok(publish(&state, transition))
}

async fn assign_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.assign_courier(id, payload.courier_id).await?;
    Ok(publish(&state, transition))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.courier_accept(id, payload.courier_id).await?;
    Ok(publish(&state, transition))
}

async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.courier_reject(id, payload.courier_id).await?;
    Ok(publish(&state, transition))
}

async fn pick_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.picked_up(id).await?;
    Ok(publish(&state, transition))
}

async fn start_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.start_delivery(id).await?;
    Ok(publish(&state, transition))
}

async fn deliver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.delivered(id).await?;
    Ok(publish(&state, transition))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CloseRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.cancel(id, &payload.reason).await?;
    Ok(publish(&state, transition))
}

async fn fail_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CloseRequest>,
) -> Result<Json<Order>, AppError> {
    let transition = state.orders.fail(id, &payload.reason).await?;
    Ok(publish(&state, transition))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Assignment>>, AppError> {
    Ok(Json(state.orders.assignments().await?))
}

async fn manual_dispatch_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.manual_dispatch_queue().await?))
}
