use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::engine::assignment::AssignmentEngine;
use crate::engine::lifecycle::OrderMachine;
use crate::models::notification::Notification;
use crate::observability::metrics::Metrics;
use crate::otp::channel::CodeSender;
use crate::otp::OtpService;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orders: OrderMachine,
    pub otp: OtpService,
    pub outbox_tx: mpsc::Sender<Notification>,
    pub events_tx: broadcast::Sender<Notification>,
    pub metrics: Metrics,
    pub config: Config,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        senders: Vec<Arc<dyn CodeSender>>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_queue_size.max(1));
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size.max(1));
        let metrics = Metrics::new();

        let engine = AssignmentEngine::new(store.clone(), config.dispatch.clone(), metrics.clone());
        let orders = OrderMachine::new(store.clone(), engine, config.delivery_fee, metrics.clone());
        let otp = OtpService::new(
            store.clone(),
            senders,
            config.otp.clone(),
            !config.is_production(),
            metrics.clone(),
        );

        (
            Self {
                store,
                orders,
                otp,
                outbox_tx,
                events_tx,
                metrics,
                config,
            },
            outbox_rx,
        )
    }
}
