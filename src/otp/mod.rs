//! One-time passcodes for phone sign-in.
//!
//! A code is persisted before any delivery attempt, so a code that no channel
//! managed to deliver can still be read back outside production.

pub mod channel;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OtpConfig;
use crate::error::AppError;
use crate::models::otp::{OtpChannel, OtpCode};
use crate::observability::metrics::Metrics;
use crate::store::Store;

use self::channel::CodeSender;

#[derive(Debug, Clone, Serialize)]
pub struct IssuedCode {
    pub identifier: String,
    pub channel: OtpChannel,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedCode {
    pub identifier: String,
    pub verified_at: DateTime<Utc>,
}

pub struct OtpService {
    store: Arc<dyn Store>,
    senders: Vec<Arc<dyn CodeSender>>,
    config: OtpConfig,
    expose_codes: bool,
    metrics: Metrics,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn Store>,
        senders: Vec<Arc<dyn CodeSender>>,
        config: OtpConfig,
        expose_codes: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            senders,
            config,
            expose_codes,
            metrics,
        }
    }

    pub async fn issue(
        &self,
        identifier: &str,
        preferred: Option<OtpChannel>,
    ) -> Result<IssuedCode, AppError> {
        self.issue_at(identifier, preferred, Utc::now()).await
    }

    pub async fn verify(&self, identifier: &str, code: &str) -> Result<VerifiedCode, AppError> {
        let result = self.verify_at(identifier, code, Utc::now()).await;
        let outcome = match &result {
            Ok(_) => "verified",
            Err(err) => err.kind(),
        };
        self.metrics
            .otp_verifications_total
            .with_label_values(&[outcome])
            .inc();
        result
    }

    /// The pending code for `identifier`, or `None` in production.
    pub async fn code_for_testing(&self, identifier: &str) -> Result<Option<String>, AppError> {
        if !self.expose_codes {
            return Ok(None);
        }

        let identifier = normalize_identifier(identifier, &self.config.country_code)?;
        Ok(self
            .store
            .otp(&identifier)
            .await?
            .filter(|record| !record.consumed)
            .map(|record| record.code))
    }

    async fn issue_at(
        &self,
        identifier: &str,
        preferred: Option<OtpChannel>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, AppError> {
        let identifier = normalize_identifier(identifier, &self.config.country_code)?;

        if let Some(previous) = self.store.otp(&identifier).await? {
            let elapsed = now - previous.issued_at;
            if previous.channel.is_some() && elapsed < self.config.resend_cooldown {
                let wait = self.config.resend_cooldown - elapsed;
                return Err(AppError::RateLimited {
                    retry_after_secs: wait.num_seconds().max(1),
                });
            }
        }

        let record = OtpCode {
            id: Uuid::new_v4(),
            identifier: identifier.clone(),
            code: generate_code(self.config.length),
            channel: None,
            issued_at: now,
            expires_at: now + self.config.ttl,
            consumed: false,
            attempts: 0,
            revision: 0,
        };
        self.store.put_otp(&record).await?;

        let preferred = preferred.unwrap_or(self.config.default_channel);
        let channels = std::iter::once(preferred)
            .chain(OtpChannel::ALL.into_iter().filter(|channel| *channel != preferred));

        let ttl_secs = self.config.ttl.num_seconds();
        let mut failures = Vec::new();

        for wanted in channels {
            let Some(sender) = self.senders.iter().find(|sender| sender.channel() == wanted) else {
                continue;
            };

            match sender.send_code(&identifier, &record.code, ttl_secs).await {
                Ok(()) => {
                    self.record_delivery(&record, wanted).await?;
                    self.metrics
                        .otp_issued_total
                        .with_label_values(&[wanted.as_str()])
                        .inc();
                    info!(channel = %wanted, fallback = wanted != preferred, "otp code delivered");
                    return Ok(IssuedCode {
                        identifier,
                        channel: wanted,
                        expires_at: record.expires_at,
                    });
                }
                Err(err) => {
                    warn!(channel = %wanted, error = %err, "otp delivery failed");
                    failures.push(format!("{wanted}: {err}"));
                }
            }
        }

        if failures.is_empty() {
            return Err(AppError::Delivery("no delivery channel is configured".to_string()));
        }
        Err(AppError::Delivery(failures.join("; ")))
    }

    /// Marks `issued` as delivered through `channel`. A verify may bump the
    /// revision in between; the write is retried on top of it. Once the code
    /// was superseded there is nothing left to mark.
    async fn record_delivery(&self, issued: &OtpCode, channel: OtpChannel) -> Result<(), AppError> {
        for _ in 0..3 {
            let Some(mut current) = self.store.otp(&issued.identifier).await? else {
                return Ok(());
            };
            if current.id != issued.id {
                return Ok(());
            }

            current.channel = Some(channel);
            match self.store.replace_otp(&current).await {
                Err(AppError::Conflict(_)) => continue,
                result => return result.map(|_| ()),
            }
        }

        warn!(channel = %channel, "otp record kept changing, delivery channel not recorded");
        Ok(())
    }

    async fn verify_at(
        &self,
        identifier: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedCode, AppError> {
        let identifier = normalize_identifier(identifier, &self.config.country_code)?;

        let mut record = self
            .store
            .otp(&identifier)
            .await?
            .filter(|record| !record.consumed)
            .ok_or_else(|| AppError::NotFound("no pending code, request a new one".to_string()))?;

        if record.is_expired(now) {
            return Err(AppError::Expired("code has expired, request a new one".to_string()));
        }
        if record.attempts >= self.config.max_attempts {
            return Err(AppError::TooManyAttempts);
        }

        if !codes_match(&record.code, code.trim()) {
            record.attempts += 1;
            let stored = self.store.replace_otp(&record).await?;
            return Err(AppError::Mismatch {
                remaining: self.config.max_attempts.saturating_sub(stored.attempts),
            });
        }

        record.consumed = true;
        self.store.replace_otp(&record).await?;

        info!("otp code verified");
        Ok(VerifiedCode {
            identifier,
            verified_at: now,
        })
    }
}

/// Canonical `+<digits>` form of a phone number. Bare national numbers get
/// `country_code` prepended.
pub fn normalize_identifier(raw: &str, country_code: &str) -> Result<String, AppError> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    let normalized = if compact.starts_with('+') {
        compact
    } else if compact.len() == 9 {
        format!("+{country_code}{compact}")
    } else if compact.starts_with(country_code) {
        format!("+{compact}")
    } else {
        compact
    };

    let digits = &normalized[normalized.starts_with('+') as usize..];
    let valid = normalized.starts_with('+')
        && (9..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit());

    if valid {
        Ok(normalized)
    } else {
        Err(AppError::Validation(format!("`{raw}` is not a valid phone number")))
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn codes_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}
