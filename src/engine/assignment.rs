use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::outbox::enqueue_events;
use crate::engine::selection::{rank_candidates, Candidate};
use crate::error::AppError;
use crate::models::assignment::{Assignment, AssignmentResponse};
use crate::models::catalog::Shop;
use crate::models::courier::{Courier, CourierStatus};
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::state::AppState;
use crate::store::Store;

/// Courier-side half of dispatch: who is eligible, and the atomic
/// reserve/release of a courier's busy flag. Order state is left to
/// [`crate::engine::lifecycle::OrderMachine`].
pub struct AssignmentEngine {
    store: Arc<dyn Store>,
    config: DispatchConfig,
    metrics: Metrics,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn Store>, config: DispatchConfig, metrics: Metrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Couriers that were already offered this order, whatever they answered.
    pub async fn tried_couriers(&self, order_id: Uuid) -> Result<HashSet<Uuid>, AppError> {
        Ok(self
            .store
            .assignments_for_order(order_id)
            .await?
            .into_iter()
            .map(|assignment| assignment.courier_id)
            .collect())
    }

    /// Remaining candidates for `order`, best first. Empty once the attempt
    /// budget for the order is spent.
    pub async fn candidates(&self, order: &Order, shop: &Shop) -> Result<Vec<Candidate>, AppError> {
        let tried = self.tried_couriers(order.id).await?;
        let budget = self.config.max_attempts.saturating_sub(tried.len());
        if budget == 0 {
            return Ok(Vec::new());
        }

        let couriers = self.store.couriers().await?;
        let mut ranked = rank_candidates(self.config.policy, &shop.location, couriers, &tried);
        ranked.truncate(budget);

        debug!(
            order_id = %order.id,
            policy = %self.config.policy,
            tried = tried.len(),
            candidates = ranked.len(),
            "ranked dispatch candidates"
        );

        Ok(ranked)
    }

    /// Check-and-set `available -> busy`. Fails with `Conflict` when the
    /// courier is busy or offline at the moment of the write.
    pub async fn reserve(&self, courier_id: Uuid, now: DateTime<Utc>) -> Result<Courier, AppError> {
        let courier = self
            .store
            .modify_courier(courier_id, &|courier| {
                if courier.status != CourierStatus::Available {
                    return Err(AppError::Conflict(format!(
                        "courier {} is {:?}",
                        courier.id, courier.status
                    )));
                }
                courier.status = CourierStatus::Busy;
                courier.last_assigned_at = Some(now);
                courier.updated_at = now;
                Ok(())
            })
            .await?;

        self.metrics.couriers_busy.inc();
        Ok(courier)
    }

    /// Returns a busy courier to the pool. Couriers that went offline in the
    /// meantime stay offline.
    pub async fn release(&self, courier_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        let was_busy = AtomicBool::new(false);

        self.store
            .modify_courier(courier_id, &|courier| {
                if courier.status == CourierStatus::Busy {
                    courier.status = CourierStatus::Available;
                    courier.updated_at = now;
                    was_busy.store(true, Ordering::Relaxed);
                }
                Ok(())
            })
            .await?;

        if was_busy.load(Ordering::Relaxed) {
            self.metrics.couriers_busy.dec();
        }
        Ok(())
    }

    pub async fn open_offer(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        distance_km: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Assignment, AppError> {
        let assignment = Assignment {
            id: Uuid::new_v4(),
            order_id,
            courier_id,
            response: AssignmentResponse::Pending,
            distance_km,
            assigned_at: now,
            deadline: now + self.config.response_timeout,
            responded_at: None,
        };

        self.store.insert_assignment(&assignment).await?;
        Ok(assignment)
    }

    pub async fn active_assignment(&self, order_id: Uuid) -> Result<Option<Assignment>, AppError> {
        Ok(self
            .store
            .assignments_for_order(order_id)
            .await?
            .into_iter()
            .find(Assignment::is_active))
    }

    pub async fn resolve(
        &self,
        assignment: &Assignment,
        next: AssignmentResponse,
        now: DateTime<Utc>,
    ) -> Result<Assignment, AppError> {
        self.store
            .resolve_assignment(assignment.id, assignment.response, next, now)
            .await
    }

    pub async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>, AppError> {
        Ok(self
            .store
            .assignments()
            .await?
            .into_iter()
            .filter(|assignment| assignment.is_overdue(now))
            .collect())
    }

    pub fn record_dispatch(&self, outcome: &str, elapsed_secs: f64) {
        self.metrics
            .dispatch_total
            .with_label_values(&[outcome])
            .inc();
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[outcome])
            .observe(elapsed_secs);
    }
}

/// Periodically expires offers nobody answered and re-dispatches their orders.
pub async fn run_expiry_sweeper(state: Arc<AppState>) {
    let period = Duration::from_millis(state.config.dispatch.sweep_interval_ms.max(10));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_ms = period.as_millis() as u64, "assignment expiry sweeper started");

    loop {
        ticker.tick().await;

        match state.orders.expire_overdue(Utc::now()).await {
            Ok(transitions) => {
                for transition in transitions {
                    enqueue_events(&state, transition.events);
                }
            }
            Err(err) => error!(error = %err, "assignment expiry sweep failed"),
        }
    }
}
