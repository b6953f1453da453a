use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};

use crate::models::notification::Notification;
use crate::notify::Notifier;
use crate::state::AppState;

/// Hands transition events to the dispatcher without waiting. The transition
/// that produced them is already committed, so a full or closed outbox drops
/// the event instead of holding up the caller.
pub fn enqueue_events(state: &AppState, events: Vec<Notification>) {
    for event in events {
        let (order_id, kind) = (event.order_id, event.kind);

        // Counted before the send so the dispatcher's decrement never runs first.
        state.metrics.outbox_depth.inc();
        let reason = match state.outbox_tx.try_send(event) {
            Ok(()) => continue,
            Err(TrySendError::Full(_)) => "outbox full",
            Err(TrySendError::Closed(_)) => "outbox closed",
        };

        state.metrics.outbox_depth.dec();
        state.metrics.notifications_failed_total.inc();
        error!(order_id = %order_id, kind = ?kind, reason, "dropping notification");
    }
}

pub async fn run_notification_dispatcher(
    state: Arc<AppState>,
    mut outbox_rx: mpsc::Receiver<Notification>,
    notifier: Arc<dyn Notifier>,
) {
    info!("notification dispatcher started");

    while let Some(event) = outbox_rx.recv().await {
        state.metrics.outbox_depth.dec();

        if let Err(err) = notifier.notify(&event).await {
            state.metrics.notifications_failed_total.inc();
            warn!(
                order_id = %event.order_id,
                kind = ?event.kind,
                error = %err,
                "notification delivery failed"
            );
        }

        // No subscribers is fine.
        let _ = state.events_tx.send(event);
    }

    warn!("notification dispatcher stopped: outbox channel closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::enqueue_events;
    use crate::config::Config;
    use crate::models::notification::{EventKind, Notification, Recipient};
    use crate::models::order::OrderStatus;
    use crate::state::AppState;
    use crate::store::MemoryStore;

    fn event() -> Notification {
        Notification {
            recipient: Recipient::Customer(Uuid::new_v4()),
            kind: EventKind::OrderConfirmed,
            order_id: Uuid::new_v4(),
            status: OrderStatus::Confirmed,
            payload: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn full_outbox_drops_instead_of_waiting() {
        let config = Config {
            outbox_queue_size: 1,
            ..Config::default()
        };
        let (state, mut outbox_rx) = AppState::new(config, Arc::new(MemoryStore::new()), vec![]);

        enqueue_events(&state, vec![event(), event(), event()]);

        assert_eq!(state.metrics.outbox_depth.get(), 1);
        assert_eq!(state.metrics.notifications_failed_total.get(), 2);
        assert!(outbox_rx.try_recv().is_ok());
        assert!(outbox_rx.try_recv().is_err());
    }

    #[test]
    fn closed_outbox_counts_a_failure() {
        let (state, outbox_rx) = AppState::new(Config::default(), Arc::new(MemoryStore::new()), vec![]);
        drop(outbox_rx);

        enqueue_events(&state, vec![event()]);

        assert_eq!(state.metrics.outbox_depth.get(), 0);
        assert_eq!(state.metrics.notifications_failed_total.get(), 1);
    }
}
