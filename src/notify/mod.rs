use async_trait::async_trait;
use tracing::info;

use crate::error::AppError;
use crate::models::notification::Notification;

/// Delivers one outbox entry to its recipient (push, chat bot, email...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Notification) -> Result<(), AppError>;
}

/// Writes notifications to the log. Used when no push channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Notification) -> Result<(), AppError> {
        info!(
            recipient = ?event.recipient,
            kind = ?event.kind,
            order_id = %event.order_id,
            status = %event.status,
            "notification"
        );
        Ok(())
    }
}
