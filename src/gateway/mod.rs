//! HTTP gateway: credit endpoints plus the billed headshot endpoint.
//!
//! Thin axum layer over [`CreditStore`], [`SharedRateLimiter`] and the
//! configured [`HeadshotGenerator`]. Handlers identify the caller via the
//! `x-user-id` header (JSON `user_id` accepted as a fallback on POSTs) and
//! return `(StatusCode, Json)` pairs; credit errors map through one helper
//! so every endpoint reports them the same way.

use crate::config::Config;
use crate::credits::{CreditError, CreditStore, LedgerRecord};
use crate::generation::{HeadshotGenerator, ReplicateGenerator, DEFAULT_PROMPT};
use crate::security::SharedRateLimiter;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;

/// Maximum accepted request body (source images arrive as data URLs).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Whole-request deadline; generation polls can take minutes.
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub credits: Arc<CreditStore>,
    pub rate_limiter: Arc<SharedRateLimiter>,
    /// `None` when no generation provider is configured; `/headshots`
    /// answers 503 in that case while credit endpoints keep working.
    pub generator: Option<Arc<dyn HeadshotGenerator>>,
    pub cost_per_generation: i64,
}

/// Start the gateway and serve until the process is stopped.
pub async fn run_gateway(host: &str, port: u16, config: &Config) -> Result<()> {
    let credits = Arc::new(
        CreditStore::open(&config.storage.db_path).context("opening credit store")?,
    );

    let rate_limit = if config.rate_limit.enabled {
        config.rate_limit.limit
    } else {
        0
    };
    let rate_limiter = Arc::new(
        SharedRateLimiter::open(&config.storage.db_path, rate_limit, config.rate_limit.window_secs)
            .context("opening rate limiter")?,
    );

    let generator: Option<Arc<dyn HeadshotGenerator>> = match config.replicate_token() {
        Some(token) => Some(Arc::new(ReplicateGenerator::new(
            &token,
            &config.generation.model_version,
        )?)),
        None => {
            tracing::warn!(
                "no Replicate API token configured — /headshots will answer 503"
            );
            None
        }
    };

    let state = AppState {
        credits,
        rate_limiter,
        generator,
        cost_per_generation: config.credits.cost_per_generation,
    };

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("gateway listening on {addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Build the router; separated from [`run_gateway`] so tests can drive it
/// without a socket.
pub fn router(state: AppState) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-user-id"),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/credits", get(handle_credits_get))
        .route("/credits/use", post(handle_credits_use))
        .route("/credits/reset", post(handle_credits_reset))
        .route("/headshots", post(handle_headshot))
        .with_state(state)
        .layer(cors)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(tower_http::timeout::TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

type JsonResponse = (StatusCode, Json<serde_json::Value>);

/// Caller identity: `x-user-id` header, else the request body's `user_id`.
fn user_id_from(headers: &HeaderMap, body_user_id: Option<&str>) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            body_user_id
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        })
}

fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

fn missing_user_response() -> JsonResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "Missing user id (x-user-id header or user_id field)"})),
    )
}

fn balance_body(record: &LedgerRecord) -> serde_json::Value {
    serde_json::json!({
        "user_id": record.user_id,
        "current_credits": record.current_credits,
        "last_credit_award_time": record.last_credit_award_time.to_rfc3339(),
        "daily_credit_reset_time": record.daily_credit_reset_time.to_rfc3339(),
        "daily_recovered_credits": record.daily_recovered_credits,
    })
}

fn credit_error_response(err: CreditError) -> JsonResponse {
    match err {
        CreditError::InsufficientCredits {
            required,
            available,
        } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Not enough credits. Need {required}, have {available}"),
                "required": required,
                "available": available,
            })),
        ),
        CreditError::InvalidAmount(msg) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": msg})),
        ),
        CreditError::NotFound(user_id) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("No credit record for user {user_id}")})),
        ),
        CreditError::Persistence(e) => {
            tracing::error!("credit store error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
        }
    }
}

// ══════════════════════════════════════════════════════════════════
// HANDLERS
// ══════════════════════════════════════════════════════════════════

/// GET /health — always public.
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "generation_enabled": state.generator.is_some(),
    }))
}

/// GET /credits — current balance, recovering pending credits first.
async fn handle_credits_get(State(state): State<AppState>, headers: HeaderMap) -> JsonResponse {
    let Some(user_id) = user_id_from(&headers, None) else {
        return missing_user_response();
    };

    match state.credits.balance(&user_id) {
        Ok(record) => (StatusCode::OK, Json(balance_body(&record))),
        Err(e) => credit_error_response(e),
    }
}

#[derive(serde::Deserialize, Default)]
struct UseCreditsBody {
    user_id: Option<String>,
    /// Credits to spend; must be a positive integer.
    amount: Option<i64>,
}

/// POST /credits/use — deduct credits, recovering first.
async fn handle_credits_use(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UseCreditsBody>, axum::extract::rejection::JsonRejection>,
) -> JsonResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("Invalid request body: {rejection}")})),
            );
        }
    };

    let Some(user_id) = user_id_from(&headers, body.user_id.as_deref()) else {
        return missing_user_response();
    };
    // Absent amount means "bill one generation" at the configured cost.
    let amount = body.amount.unwrap_or(state.cost_per_generation);

    match state.credits.deduct(&user_id, amount) {
        Ok(record) => {
            tracing::info!(user_id = %user_id, amount, credits_left = record.current_credits, "credits deducted");
            (StatusCode::OK, Json(balance_body(&record)))
        }
        Err(e) => credit_error_response(e),
    }
}

#[derive(serde::Deserialize, Default)]
struct ResetCreditsBody {
    user_id: Option<String>,
}

/// POST /credits/reset — restore the user to the daily baseline.
async fn handle_credits_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ResetCreditsBody>, axum::extract::rejection::JsonRejection>,
) -> JsonResponse {
    // Body is optional here; an absent or malformed one means header-only.
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let Some(user_id) = user_id_from(&headers, body.user_id.as_deref()) else {
        return missing_user_response();
    };

    match state.credits.reset(&user_id) {
        Ok(record) => {
            tracing::info!(user_id = %user_id, "credits reset to baseline");
            (StatusCode::OK, Json(balance_body(&record)))
        }
        Err(e) => credit_error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct HeadshotBody {
    user_id: Option<String>,
    /// Source image: URL or base64 data URL.
    image: String,
    /// Optional prompt override; the stock studio prompt otherwise.
    prompt: Option<String>,
}

/// POST /headshots — rate-limit, check funds, generate, then bill.
///
/// Deduction happens only after the provider reports success, so a failed
/// generation never costs the user anything.
async fn handle_headshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<HeadshotBody>, axum::extract::rejection::JsonRejection>,
) -> JsonResponse {
    let client_key = client_key_from_headers(&headers);
    match state.rate_limiter.check(&client_key) {
        Ok(decision) if !decision.allowed => {
            tracing::warn!("/headshots rate limit exceeded for key: {client_key}");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "Too many generation requests. Please retry later.",
                    "retry_after": decision.retry_after_secs,
                })),
            );
        }
        Ok(_) => {}
        // Fail open: a broken limiter should not take generation down.
        Err(e) => tracing::warn!("rate limiter check failed, allowing request: {e}"),
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("Invalid request body: {rejection}")})),
            );
        }
    };

    let Some(user_id) = user_id_from(&headers, body.user_id.as_deref()) else {
        return missing_user_response();
    };

    let Some(generator) = state.generator.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Image generation is not configured"})),
        );
    };

    // Funds check before starting the (slow, externally billed) generation.
    let cost = state.cost_per_generation;
    match state.credits.balance(&user_id) {
        Ok(record) if record.current_credits < cost => {
            return (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": format!(
                        "Not enough credits. Need {cost}, have {}",
                        record.current_credits
                    ),
                    "required": cost,
                    "available": record.current_credits,
                })),
            );
        }
        Ok(_) => {}
        Err(e) => return credit_error_response(e),
    }

    let prompt = body.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    let generated = match generator.generate(&body.image, prompt).await {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(user_id = %user_id, "headshot generation failed: {e:#}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": "Image generation failed"})),
            );
        }
    };

    // Bill only after success. A concurrent spend may have drained the
    // balance in the meantime; the conditional deduct catches that.
    match state.credits.deduct(&user_id, cost) {
        Ok(record) => {
            tracing::info!(
                user_id = %user_id,
                credits_left = record.current_credits,
                "headshot generated"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "image_url": generated.image_url,
                    "credits_left": record.current_credits,
                })),
            )
        }
        Err(CreditError::InsufficientCredits {
            required,
            available,
        }) => {
            tracing::warn!(
                user_id = %user_id,
                "balance drained during generation; result delivered without billing"
            );
            (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": format!("Not enough credits. Need {required}, have {available}"),
                    "required": required,
                    "available": available,
                })),
            )
        }
        Err(e) => credit_error_response(e),
    }
}

// ══════════════════════════════════════════════════════════════════
// TESTS
// ══════════════════════════════════════════════════════════════════
