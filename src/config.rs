use std::env;
use std::str::FromStr;

use chrono::Duration;

use crate::engine::selection::SelectionPolicy;
use crate::error::AppError;
use crate::models::otp::OtpChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub length: usize,
    pub ttl: Duration,
    pub max_attempts: u32,
    pub resend_cooldown: Duration,
    pub default_channel: OtpChannel,
    pub country_code: String,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            length: 4,
            ttl: Duration::seconds(120),
            max_attempts: 3,
            resend_cooldown: Duration::seconds(60),
            default_channel: OtpChannel::Sms,
            country_code: "998".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub policy: SelectionPolicy,
    pub response_timeout: Duration,
    pub max_attempts: usize,
    pub sweep_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::Availability,
            response_timeout: Duration::seconds(60),
            max_attempts: 5,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub telegram_token: Option<String>,
    pub eskiz_email: Option<String>,
    pub eskiz_password: Option<String>,
    pub eskiz_sender: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub environment: Environment,
    pub cors_origins: Vec<String>,
    pub event_buffer_size: usize,
    pub outbox_queue_size: usize,
    pub delivery_fee: u64,
    pub otp: OtpConfig,
    pub dispatch: DispatchConfig,
    pub gateways: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            environment: Environment::Development,
            cors_origins: vec!["http://localhost:3000".to_string()],
            event_buffer_size: 1024,
            outbox_queue_size: 1024,
            delivery_fee: 15_000,
            otp: OtpConfig::default(),
            dispatch: DispatchConfig::default(),
            gateways: GatewayConfig {
                eskiz_sender: "4546".to_string(),
                ..GatewayConfig::default()
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let otp = OtpConfig {
            length: parse_or_default("OTP_LENGTH", defaults.otp.length)?,
            ttl: Duration::seconds(parse_or_default("OTP_TTL_SECONDS", 120)?),
            max_attempts: parse_or_default("OTP_MAX_ATTEMPTS", defaults.otp.max_attempts)?,
            resend_cooldown: Duration::seconds(parse_or_default(
                "OTP_RESEND_COOLDOWN_SECONDS",
                60,
            )?),
            default_channel: parse_or_default("OTP_DEFAULT_CHANNEL", defaults.otp.default_channel)?,
            country_code: env::var("OTP_COUNTRY_CODE").unwrap_or(defaults.otp.country_code),
        };

        if !(4..=8).contains(&otp.length) {
            return Err(AppError::Internal(format!(
                "invalid OTP_LENGTH: {} (expected 4..=8)",
                otp.length
            )));
        }

        let dispatch = DispatchConfig {
            policy: parse_or_default("DISPATCH_POLICY", defaults.dispatch.policy)?,
            response_timeout: Duration::seconds(parse_or_default(
                "DISPATCH_RESPONSE_TIMEOUT_SECONDS",
                60,
            )?),
            max_attempts: parse_or_default("DISPATCH_MAX_ATTEMPTS", defaults.dispatch.max_attempts)?,
            sweep_interval_ms: parse_or_default(
                "DISPATCH_SWEEP_INTERVAL_MS",
                defaults.dispatch.sweep_interval_ms,
            )?,
        };

        let gateways = GatewayConfig {
            telegram_token: non_empty("TELEGRAM_GATEWAY_TOKEN"),
            eskiz_email: non_empty("ESKIZ_EMAIL"),
            eskiz_password: non_empty("ESKIZ_PASSWORD"),
            eskiz_sender: env::var("ESKIZ_SENDER").unwrap_or(defaults.gateways.eskiz_sender),
        };

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.cors_origins);

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env::var("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            environment: parse_or_default("APP_ENV", defaults.environment)?,
            cors_origins,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            outbox_queue_size: parse_or_default("OUTBOX_QUEUE_SIZE", defaults.outbox_queue_size)?,
            delivery_fee: parse_or_default("DELIVERY_FEE", defaults.delivery_fee)?,
            otp,
            dispatch,
            gateways,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
