use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo;
use crate::models::catalog::{Product, Shop};
use crate::models::courier::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/shops", post(create_shop))
        .route("/products", post(create_product))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateShopRequest {
    pub name: String,
    pub owner_id: Uuid,
    pub location: GeoPoint,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateProductRequest {
    pub shop_id: Uuid,
    pub name: String,
    pub price: u64,
    pub stock: u32,
}

async fn create_shop(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateShopRequest>,
) -> Result<Json<Shop>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if !geo::is_valid(&payload.location) {
        return Err(AppError::Validation("location is out of range".to_string()));
    }

    let shop = Shop {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        owner_id: payload.owner_id,
        location: payload.location,
        is_active: true,
    };

    state.store.put_shop(shop.clone()).await?;
    Ok(Json(shop))
}

async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateProductRequest>,
) -> Result<Json<Product>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if payload.price == 0 {
        return Err(AppError::Validation("price must be > 0".to_string()));
    }

    state
        .store
        .shop(payload.shop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("shop {} not found", payload.shop_id)))?;

    let product = Product {
        id: Uuid::new_v4(),
        shop_id: payload.shop_id,
        name: payload.name.trim().to_string(),
        price: payload.price,
        stock: payload.stock,
        is_active: true,
    };

    state.store.put_product(product.clone()).await?;
    Ok(Json(product))
}
