use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::otp::OtpChannel;

const TELEGRAM_GATEWAY_URL: &str = "https://gatewayapi.telegram.org";
const ESKIZ_URL: &str = "https://notify.eskiz.uz/api";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can put a one-time code in front of the user.
#[async_trait]
pub trait CodeSender: Send + Sync {
    fn channel(&self) -> OtpChannel;

    async fn send_code(&self, identifier: &str, code: &str, ttl_secs: i64) -> Result<(), AppError>;
}

fn http_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))
}

fn delivery(context: &str, err: reqwest::Error) -> AppError {
    AppError::Delivery(format!("{context}: {err}"))
}

/// Telegram Gateway verification messages, addressed by phone number.
pub struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct VerificationRequest<'a> {
    phone_number: &'a str,
    code: &'a str,
    code_length: usize,
    ttl: i64,
}

#[derive(Deserialize)]
struct GatewayResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramGateway {
    pub fn new(token: String) -> Result<Self, AppError> {
        Self::with_base_url(token, TELEGRAM_GATEWAY_URL)
    }

    pub fn with_base_url(token: String, base_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl CodeSender for TelegramGateway {
    fn channel(&self) -> OtpChannel {
        OtpChannel::Telegram
    }

    async fn send_code(&self, identifier: &str, code: &str, ttl_secs: i64) -> Result<(), AppError> {
        let request = VerificationRequest {
            phone_number: identifier,
            code,
            code_length: code.len(),
            ttl: ttl_secs,
        };

        let response = self
            .client
            .post(format!("{}/sendVerificationMessage", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|err| delivery("telegram gateway unreachable", err))?;

        let status = response.status();
        let body: GatewayResponse = response
            .json()
            .await
            .map_err(|err| delivery("unreadable telegram gateway response", err))?;

        if !body.ok {
            let reason = body
                .description
                .or(body.error)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(AppError::Delivery(format!("telegram gateway: {reason}")));
        }

        debug!("verification message accepted by telegram gateway");
        Ok(())
    }
}

/// Eskiz SMS. Logs in with email/password and reuses the bearer token until
/// the API answers 401.
pub struct EskizSms {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    sender: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct LoginResponse {
    data: LoginData,
}

#[derive(Deserialize)]
struct LoginData {
    token: String,
}

impl EskizSms {
    pub fn new(email: String, password: String, sender: String) -> Result<Self, AppError> {
        Self::with_base_url(email, password, sender, ESKIZ_URL)
    }

    pub fn with_base_url(
        email: String,
        password: String,
        sender: String,
        base_url: &str,
    ) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
            password,
            sender,
            token: Mutex::new(None),
        })
    }

    async fn token(&self) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .client
            .post(format!("{}/auth/login", self.base_url))
            .form(&[("email", self.email.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|err| delivery("eskiz unreachable", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Delivery(format!("eskiz login failed {status}: {body}")));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|err| delivery("unreadable eskiz login response", err))?;

        info!("eskiz token refreshed");
        *cached = Some(login.data.token.clone());
        Ok(login.data.token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn post_sms(&self, token: &str, phone: &str, message: &str) -> Result<StatusCode, AppError> {
        let response = self
            .client
            .post(format!("{}/message/sms/send", self.base_url))
            .bearer_auth(token)
            .form(&[
                ("mobile_phone", phone),
                ("message", message),
                ("from", self.sender.as_str()),
            ])
            .send()
            .await
            .map_err(|err| delivery("eskiz unreachable", err))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(status);
        }

        let body = response.text().await.unwrap_or_default();
        Err(AppError::Delivery(format!("eskiz rejected sms {status}: {body}")))
    }
}

#[async_trait]
impl CodeSender for EskizSms {
    fn channel(&self) -> OtpChannel {
        OtpChannel::Sms
    }

    async fn send_code(&self, identifier: &str, code: &str, ttl_secs: i64) -> Result<(), AppError> {
        let phone = identifier.trim_start_matches('+');
        let minutes = (ttl_secs + 59) / 60;
        let message = format!("Verification code: {code}. Valid for {minutes} min.");

        let token = self.token().await?;
        if self.post_sms(&token, phone, &message).await? != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        // Token revoked or expired: log in again and retry once.
        self.forget_token().await;
        let token = self.token().await?;
        match self.post_sms(&token, phone, &message).await? {
            StatusCode::UNAUTHORIZED => Err(AppError::Delivery(
                "eskiz rejected freshly issued token".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
