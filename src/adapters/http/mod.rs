//! HTTP adapter: thin axum surface over the pipeline.
//!
//! Handlers translate JSON into pipeline calls and map domain errors to
//! transport codes; no metric or privacy logic lives here. Pipeline work
//! runs on the blocking pool because every top-level operation takes the
//! single-writer lock.
//!
//! | Route | Notes |
//! |-------|-------|
//! | `POST /event` | rate limited, 202 with accepted count |
//! | `GET /dau/{day}` | DP daily release |
//! | `GET /mau?end&window` | DP rolling-window release |
//! | `GET /budget/{metric}?day` | accountant snapshot, read-only |
//! | `GET /healthz` | liveness, unauthenticated |
//! | `GET /metrics` | Prometheus text, unauthenticated |

pub mod auth;
pub mod metrics;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crate::adapters::noise::ChaChaNoiseFactory;
use crate::adapters::sqlite::SqliteLedger;
use crate::application::pipeline::Pipeline;
use crate::domain::event::{Event, Metric};
use crate::CountveilError;

use self::metrics::HttpMetrics;
use self::rate_limit::{RateLimitConfig, RateLimiter};

/// The concrete pipeline served over HTTP.
pub type EnginePipeline = Pipeline<SqliteLedger, ChaChaNoiseFactory>;

/// Shared state behind every handler.
pub struct ApiState {
    pub pipeline: Arc<EnginePipeline>,
    pub api_key: Option<String>,
    pub metrics: HttpMetrics,
    pub limiter: RateLimiter,
}

impl ApiState {
    /// # Errors
    /// Returns an error if the metric families fail to register.
    pub fn new(
        pipeline: Arc<EnginePipeline>,
        api_key: Option<String>,
    ) -> Result<Self, metrics::MetricsError> {
        Ok(Self {
            pipeline,
            api_key,
            metrics: HttpMetrics::new()?,
            limiter: RateLimiter::new(RateLimitConfig::default()),
        })
    }

    /// As [`Self::new`] with a custom limiter, used by tests.
    ///
    /// # Errors
    /// Returns an error if the metric families fail to register.
    pub fn with_limiter(
        pipeline: Arc<EnginePipeline>,
        api_key: Option<String>,
        limiter: RateLimiter,
    ) -> Result<Self, metrics::MetricsError> {
        Ok(Self {
            pipeline,
            api_key,
            metrics: HttpMetrics::new()?,
            limiter,
        })
    }
}

/// Transport-level error with its JSON body.
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    fn internal(context: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "internal", "message": context}),
        )
    }
}

impl From<CountveilError> for ApiError {
    fn from(error: CountveilError) -> Self {
        match error {
            CountveilError::Validation(message) => Self::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "validation_error", "message": message}),
            ),
            CountveilError::Unauthorized => Self::new(
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "unauthorized",
                    "hint": "Provide the X-API-Key header with the configured SERVICE_API_KEY value.",
                }),
            ),
            CountveilError::RateLimited { retry_after_secs } => {
                let mut rejected = Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    json!({"error": "rate_limit_exceeded", "message": "Too many requests"}),
                );
                rejected.retry_after = Some(retry_after_secs);
                rejected
            }
            CountveilError::BudgetExhausted(payload) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "budget_exhausted",
                    "metric": payload.metric,
                    "cap": payload.cap,
                    "spent": payload.spent,
                    "remaining": payload.remaining,
                    "reset_month": payload.reset_month,
                    "budget": payload.snapshot,
                }),
            ),
            CountveilError::Conflict(message) => Self::new(
                StatusCode::CONFLICT,
                json!({"error": "conflict", "message": message}),
            ),
            other => {
                tracing::error!(error = %other, "Request failed");
                Self::internal("operation failed")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Build the service router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/event", post(post_event))
        .route("/dau/:day", get(get_dau))
        .route("/mau", get(get_mau))
        .route("/budget/:metric", get(get_budget))
        .route("/healthz", get(healthz))
        .route("/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .with_state(state)
}

async fn track_metrics(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let handler = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());
    let method = request.method().as_str().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    state.metrics.observe(
        &handler,
        &method,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    auth::require_api_key(headers, state.api_key.as_deref())
        .map_err(|()| CountveilError::Unauthorized.into())
}

/// Rate-limit key: API key prefix, forwarded address, else a shared
/// bucket for direct local callers.
fn client_key(headers: &HeaderMap) -> String {
    if let Some(key) = headers
        .get(auth::API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let prefix: String = key.chars().take(8).collect();
        return format!("key:{prefix}");
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return format!("ip:{}", forwarded.trim());
    }
    "local".to_string()
}

async fn run_blocking<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|_| ApiError::internal("worker task failed"))?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    #[serde(default)]
    event: Option<Event>,
    #[serde(default)]
    events: Option<Vec<Event>>,
}

async fn post_event(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    if let Err(retry_after_secs) = state.limiter.try_acquire(&client_key(&headers)) {
        return Err(CountveilError::RateLimited { retry_after_secs }.into());
    }

    let events: Vec<Event> = match (body.event, body.events) {
        (Some(_), Some(_)) => {
            return Err(CountveilError::Validation(
                "provide either 'event' or 'events', not both".to_string(),
            )
            .into());
        }
        (Some(single), None) => vec![single],
        (None, Some(many)) => many,
        (None, None) => {
            return Err(
                CountveilError::Validation("provide at least one event".to_string()).into(),
            );
        }
    };
    if events.is_empty() {
        return Err(CountveilError::Validation("provide at least one event".to_string()).into());
    }

    let pipeline = Arc::clone(&state.pipeline);
    let accepted = run_blocking(move || pipeline.ingest(&events)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"accepted": accepted}))).into_response())
}

async fn get_dau(
    State(state): State<Arc<ApiState>>,
    Path(day): Path<NaiveDate>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let pipeline = Arc::clone(&state.pipeline);
    let output = run_blocking(move || pipeline.release_dau(day)).await?;
    Ok(Json(output).into_response())
}

#[derive(Debug, Deserialize)]
struct MauParams {
    end: NaiveDate,
    window: Option<u32>,
}

async fn get_mau(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<MauParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let pipeline = Arc::clone(&state.pipeline);
    let output = run_blocking(move || pipeline.release_mau(params.end, params.window)).await?;
    Ok(Json(output).into_response())
}

#[derive(Debug, Deserialize)]
struct BudgetParams {
    day: NaiveDate,
}

async fn get_budget(
    State(state): State<Arc<ApiState>>,
    Path(metric): Path<String>,
    Query(params): Query<BudgetParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let metric: Metric = metric
        .parse()
        .map_err(CountveilError::Validation)?;
    let pipeline = Arc::clone(&state.pipeline);
    let snapshot = run_blocking(move || pipeline.budget_snapshot(metric, params.day)).await?;
    Ok(Json(snapshot).into_response())
}

async fn healthz(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    let pipeline = Arc::clone(&state.pipeline);
    run_blocking(move || pipeline.health()).await?;
    Ok(Json(json!({"status": "ok"})).into_response())
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    let text = state
        .metrics
        .encode_text()
        .map_err(|e| ApiError::internal(&e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}
