//! Persistence seam for the dispatch core.
//!
//! Every component receives an `Arc<dyn Store>`; nothing reaches storage any
//! other way. Writes that must not race are expressed as conditional
//! operations (revision or expected-state checks) so an implementation backed
//! by a database can map them onto conditional `UPDATE ... WHERE` statements.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::{Assignment, AssignmentResponse};
use crate::models::catalog::{Product, Shop};
use crate::models::courier::Courier;
use crate::models::order::Order;
use crate::models::otp::OtpCode;

pub use memory::MemoryStore;

/// Mutation applied to a courier under the store's per-record lock.
pub type CourierUpdate<'a> = &'a (dyn Fn(&mut Courier) -> Result<(), AppError> + Send + Sync);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub couriers: usize,
    pub orders: usize,
    pub assignments: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_shop(&self, shop: Shop) -> Result<(), AppError>;
    async fn shop(&self, id: Uuid) -> Result<Option<Shop>, AppError>;
    async fn put_product(&self, product: Product) -> Result<(), AppError>;
    async fn product(&self, id: Uuid) -> Result<Option<Product>, AppError>;

    async fn put_courier(&self, courier: Courier) -> Result<(), AppError>;
    async fn courier(&self, id: Uuid) -> Result<Option<Courier>, AppError>;
    async fn couriers(&self) -> Result<Vec<Courier>, AppError>;
    /// Applies `apply` atomically. If it returns an error the stored courier
    /// is left untouched.
    async fn modify_courier(&self, id: Uuid, apply: CourierUpdate<'_>) -> Result<Courier, AppError>;

    async fn insert_order(&self, order: &Order) -> Result<(), AppError>;
    async fn order(&self, id: Uuid) -> Result<Option<Order>, AppError>;
    async fn orders(&self) -> Result<Vec<Order>, AppError>;
    /// Writes `order` only if the stored revision still equals
    /// `order.revision`; the stored copy gets `revision + 1`.
    async fn replace_order(&self, order: &Order) -> Result<Order, AppError>;

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), AppError>;
    async fn assignments(&self) -> Result<Vec<Assignment>, AppError>;
    async fn assignments_for_order(&self, order_id: Uuid) -> Result<Vec<Assignment>, AppError>;
    /// Moves an assignment from `expected` to `next`; `Conflict` if it was
    /// already resolved by someone else.
    async fn resolve_assignment(
        &self,
        id: Uuid,
        expected: AssignmentResponse,
        next: AssignmentResponse,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AppError>;

    async fn otp(&self, identifier: &str) -> Result<Option<OtpCode>, AppError>;
    /// Stores `code` as the only record for its identifier.
    async fn put_otp(&self, code: &OtpCode) -> Result<(), AppError>;
    /// Conditional on `code.revision`, like [`Store::replace_order`].
    async fn replace_otp(&self, code: &OtpCode) -> Result<OtpCode, AppError>;

    async fn stats(&self) -> Result<StoreStats, AppError>;
}
