use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::otp::OtpChannel;
use crate::otp::{IssuedCode, VerifiedCode};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/otp/send", post(send_code))
        .route("/auth/otp/verify", post(verify_code))
        .route("/auth/otp/testing/:identifier", get(testing_code))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendCodeRequest {
    pub identifier: String,
    pub channel: Option<OtpChannel>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCodeRequest {
    pub identifier: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct TestingCodeResponse {
    pub identifier: String,
    pub code: String,
}

async fn send_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendCodeRequest>,
) -> Result<Json<IssuedCode>, AppError> {
    Ok(Json(state.otp.issue(&payload.identifier, payload.channel).await?))
}

async fn verify_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyCodeRequest>,
) -> Result<Json<VerifiedCode>, AppError> {
    Ok(Json(state.otp.verify(&payload.identifier, &payload.code).await?))
}

async fn testing_code(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
) -> Result<Json<TestingCodeResponse>, AppError> {
    let code = state
        .otp
        .code_for_testing(&identifier)
        .await?
        .ok_or_else(|| AppError::NotFound("no code available".to_string()))?;

    Ok(Json(TestingCodeResponse { identifier, code }))
}
