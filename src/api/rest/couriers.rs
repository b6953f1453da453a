use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo;
use crate::models::courier::{Courier, CourierStatus, GeoPoint};
use crate::state::AppState;

const DEFAULT_MAX_DISTANCE_KM: f64 = 5.0;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/:id/status", patch(update_courier_status))
        .route("/couriers/:id/location", patch(update_courier_location))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCourierRequest {
    pub name: String,
    pub location: GeoPoint,
    pub max_distance_km: Option<f64>,
    pub rating: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: CourierStatus,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if !geo::is_valid(&payload.location) {
        return Err(AppError::Validation("location is out of range".to_string()));
    }

    let max_distance_km = payload.max_distance_km.unwrap_or(DEFAULT_MAX_DISTANCE_KM);
    if !max_distance_km.is_finite() || max_distance_km <= 0.0 {
        return Err(AppError::Validation("max_distance_km must be > 0".to_string()));
    }

    let courier = Courier {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        location: payload.location,
        status: CourierStatus::Available,
        max_distance_km,
        rating: payload.rating.unwrap_or(5.0).clamp(0.0, 5.0),
        last_assigned_at: None,
        updated_at: Utc::now(),
    };

    state.store.put_courier(courier.clone()).await?;
    info!(courier_id = %courier.id, "courier registered");
    Ok(Json(courier))
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Courier>>, AppError> {
    let mut couriers = state.store.couriers().await?;
    couriers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    Ok(Json(couriers))
}

/// Couriers toggle between `available` and `offline`; `busy` belongs to the
/// dispatch engine and can be neither set nor left through this endpoint.
async fn update_courier_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Courier>, AppError> {
    if payload.status == CourierStatus::Busy {
        return Err(AppError::Validation(
            "busy is set by dispatch, not by the courier".to_string(),
        ));
    }

    let now = Utc::now();
    let courier = state
        .store
        .modify_courier(id, &|courier| {
            if courier.status == CourierStatus::Busy {
                return Err(AppError::Conflict(format!(
                    "courier {} is on an active delivery",
                    courier.id
                )));
            }
            courier.status = payload.status;
            courier.updated_at = now;
            Ok(())
        })
        .await?;

    info!(courier_id = %id, status = ?courier.status, "courier status changed");
    Ok(Json(courier))
}

async fn update_courier_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Courier>, AppError> {
    if !geo::is_valid(&payload.location) {
        return Err(AppError::Validation("location is out of range".to_string()));
    }

    let now = Utc::now();
    let courier = state
        .store
        .modify_courier(id, &|courier| {
            courier.location = payload.location;
            courier.updated_at = now;
            Ok(())
        })
        .await?;

    Ok(Json(courier))
}
