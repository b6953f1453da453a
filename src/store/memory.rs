use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::{Assignment, AssignmentResponse};
use crate::models::catalog::{Product, Shop};
use crate::models::courier::Courier;
use crate::models::order::Order;
use crate::models::otp::OtpCode;
use crate::store::{CourierUpdate, Store, StoreStats};

/// In-process store. Each DashMap shard lock doubles as the per-record lock
/// the conditional operations need.
#[derive(Default)]
pub struct MemoryStore {
    shops: DashMap<Uuid, Shop>,
    products: DashMap<Uuid, Product>,
    couriers: DashMap<Uuid, Courier>,
    orders: DashMap<Uuid, Order>,
    assignments: DashMap<Uuid, Assignment>,
    otps: DashMap<String, OtpCode>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_shop(&self, shop: Shop) -> Result<(), AppError> {
        self.shops.insert(shop.id, shop);
        Ok(())
    }

    async fn shop(&self, id: Uuid) -> Result<Option<Shop>, AppError> {
        Ok(self.shops.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put_product(&self, product: Product) -> Result<(), AppError> {
        self.products.insert(product.id, product);
        Ok(())
    }

    async fn product(&self, id: Uuid) -> Result<Option<Product>, AppError> {
        Ok(self.products.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put_courier(&self, courier: Courier) -> Result<(), AppError> {
        self.couriers.insert(courier.id, courier);
        Ok(())
    }

    async fn courier(&self, id: Uuid) -> Result<Option<Courier>, AppError> {
        Ok(self.couriers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn couriers(&self) -> Result<Vec<Courier>, AppError> {
        Ok(self
            .couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn modify_courier(&self, id: Uuid, apply: CourierUpdate<'_>) -> Result<Courier, AppError> {
        let mut entry = self
            .couriers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("courier {id} not found")))?;

        let mut candidate = entry.value().clone();
        apply(&mut candidate)?;
        *entry.value_mut() = candidate.clone();

        Ok(candidate)
    }

    async fn insert_order(&self, order: &Order) -> Result<(), AppError> {
        if self.orders.contains_key(&order.id) {
            return Err(AppError::Conflict(format!("order {} already exists", order.id)));
        }
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn orders(&self) -> Result<Vec<Order>, AppError> {
        Ok(self.orders.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn replace_order(&self, order: &Order) -> Result<Order, AppError> {
        let mut entry = self
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| AppError::NotFound(format!("order {} not found", order.id)))?;

        if entry.revision != order.revision {
            return Err(AppError::Conflict(format!(
                "order {} was modified concurrently",
                order.id
            )));
        }

        let mut stored = order.clone();
        stored.revision = order.revision + 1;
        *entry.value_mut() = stored.clone();

        Ok(stored)
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), AppError> {
        self.assignments.insert(assignment.id, assignment.clone());
        Ok(())
    }

    async fn assignments(&self) -> Result<Vec<Assignment>, AppError> {
        let mut all: Vec<Assignment> = self
            .assignments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|assignment| assignment.assigned_at);
        Ok(all)
    }

    async fn assignments_for_order(&self, order_id: Uuid) -> Result<Vec<Assignment>, AppError> {
        let mut matching: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by_key(|assignment| assignment.assigned_at);
        Ok(matching)
    }

    async fn resolve_assignment(
        &self,
        id: Uuid,
        expected: AssignmentResponse,
        next: AssignmentResponse,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AppError> {
        let mut entry = self
            .assignments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("assignment {id} not found")))?;

        if entry.response != expected {
            return Err(AppError::Conflict(format!(
                "assignment {id} is already {:?}",
                entry.response
            )));
        }

        entry.response = next;
        entry.responded_at = Some(at);
        Ok(entry.value().clone())
    }

    async fn otp(&self, identifier: &str) -> Result<Option<OtpCode>, AppError> {
        Ok(self.otps.get(identifier).map(|entry| entry.value().clone()))
    }

    async fn put_otp(&self, code: &OtpCode) -> Result<(), AppError> {
        self.otps.insert(code.identifier.clone(), code.clone());
        Ok(())
    }

    async fn replace_otp(&self, code: &OtpCode) -> Result<OtpCode, AppError> {
        let mut entry = self
            .otps
            .get_mut(&code.identifier)
            .ok_or_else(|| AppError::NotFound("no pending code".to_string()))?;

        if entry.id != code.id || entry.revision != code.revision {
            return Err(AppError::Conflict(
                "code was superseded or modified concurrently".to_string(),
            ));
        }

        let mut stored = code.clone();
        stored.revision = code.revision + 1;
        *entry.value_mut() = stored.clone();

        Ok(stored)
    }

    async fn stats(&self) -> Result<StoreStats, AppError> {
        Ok(StoreStats {
            couriers: self.couriers.len(),
            orders: self.orders.len(),
            assignments: self.assignments.len(),
        })
    }
}
