use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use order_dispatch::api;
use order_dispatch::config::Config;
use order_dispatch::engine::assignment::run_expiry_sweeper;
use order_dispatch::engine::outbox::run_notification_dispatcher;
use order_dispatch::error::AppError;
use order_dispatch::notify::LogNotifier;
use order_dispatch::otp::channel::{CodeSender, EskizSms, TelegramGateway};
use order_dispatch::state::AppState;
use order_dispatch::store::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let senders = code_senders(&config)?;
    if senders.is_empty() {
        warn!("no OTP delivery channel configured; codes can only be read via the testing endpoint");
    }

    let (app_state, outbox_rx) = AppState::new(config.clone(), Arc::new(MemoryStore::new()), senders);
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_notification_dispatcher(
        shared_state.clone(),
        outbox_rx,
        Arc::new(LogNotifier),
    ));
    tokio::spawn(run_expiry_sweeper(shared_state.clone()));

    let app = api::rest::router(shared_state);

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    info!(
        http_port = config.http_port,
        environment = ?config.environment,
        policy = %config.dispatch.policy,
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn code_senders(config: &Config) -> Result<Vec<Arc<dyn CodeSender>>, AppError> {
    let gateways = &config.gateways;
    let mut senders: Vec<Arc<dyn CodeSender>> = Vec::new();

    if let Some(token) = &gateways.telegram_token {
        senders.push(Arc::new(TelegramGateway::new(token.clone())?));
    }

    if let (Some(email), Some(password)) = (&gateways.eskiz_email, &gateways.eskiz_password) {
        senders.push(Arc::new(EskizSms::new(
            email.clone(),
            password.clone(),
            gateways.eskiz_sender.clone(),
        )?));
    }

    Ok(senders)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
