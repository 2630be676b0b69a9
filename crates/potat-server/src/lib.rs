#![warn(missing_docs)]

//! # potat-server
//!
//! HTTP surface for the PotatEval sandbox service: a single authenticated
//! `POST /eval` route in front of the admission queue.
//!
//! Guest failures never surface here as errors (the runner folds them
//! into the result string), so the only failure paths are the bearer check
//! (HTTP 418) and queue overflow or other host faults (HTTP 500).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use potat_sandbox::AdmissionQueue;

/// Reply on a failed bearer check.
const AUTH_REJECTION: &str = "not today my little bish xqcL";

/// Width of the fixed comparison buffers. Only the first five bytes of the
/// secret participate in the check; this preserves the upstream behavior.
const AUTH_BUFFER_LEN: usize = 5;

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    /// Admission queue feeding the single isolate consumer.
    pub queue: Arc<AdmissionQueue>,
    /// Static bearer secret.
    pub auth_secret: Arc<String>,
}

/// Body of `POST /eval`.
#[derive(Debug, Deserialize)]
pub struct EvalRequest {
    /// Snippet to evaluate.
    pub code: String,
    /// Message context; missing or partial fields are tolerated.
    #[serde(default)]
    pub msg: Value,
}

/// JSON envelope returned for every request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalEnvelope {
    /// Stringified result; exactly one element on success, empty otherwise.
    pub data: Vec<String>,
    /// Mirrors the HTTP status.
    pub status_code: u16,
    /// Wall-clock handler duration in milliseconds, four decimal places.
    pub duration: f64,
    /// Present only on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorBody>>,
}

/// One entry in the envelope's error list.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub message: String,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new().route("/eval", post(eval)).with_state(state)
}

async fn eval(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EvalRequest>,
) -> (StatusCode, Json<EvalEnvelope>) {
    let started = Instant::now();

    let token = bearer_token(&headers).unwrap_or_default();
    if !token_matches(token, &state.auth_secret) {
        tracing::warn!("auth rejected");
        return respond(
            StatusCode::IM_A_TEAPOT,
            Vec::new(),
            Some(AUTH_REJECTION.to_string()),
            started,
        );
    }

    tracing::info!(code_len = request.code.len(), "eval request admitted");
    match state.queue.submit(request.code, request.msg).await {
        Ok(result) => respond(StatusCode::OK, vec![result], None, started),
        Err(err) => {
            tracing::error!(error = %err, "eval request failed");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                Vec::new(),
                Some("Internal server error".to_string()),
                started,
            )
        }
    }
}

fn respond(
    status: StatusCode,
    data: Vec<String>,
    error: Option<String>,
    started: Instant,
) -> (StatusCode, Json<EvalEnvelope>) {
    let duration = round4(started.elapsed().as_secs_f64() * 1000.0);
    (
        status,
        Json(EvalEnvelope {
            data,
            status_code: status.as_u16(),
            duration,
            errors: error.map(|message| vec![ErrorBody { message }]),
        }),
    )
}

fn round4(ms: f64) -> f64 {
    (ms * 10_000.0).round() / 10_000.0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Fixed-width branch-free comparison. Both sides are zero-padded or
/// truncated to [`AUTH_BUFFER_LEN`] bytes before the scan, so the timing
/// does not depend on where a mismatch occurs.
fn token_matches(token: &str, secret: &str) -> bool {
    let mut provided = [0u8; AUTH_BUFFER_LEN];
    let mut expected = [0u8; AUTH_BUFFER_LEN];
    for (dst, src) in provided.iter_mut().zip(token.bytes()) {
        *dst = src;
    }
    for (dst, src) in expected.iter_mut().zip(secret.bytes()) {
        *dst = src;
    }
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
