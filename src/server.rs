//! HTTP surface: routing, request-ID tagging, the rate-limit/auth gate,
//! JSON envelopes and the status endpoints.
//!
//! Handlers take the raw body as a string and parse explicitly so bad
//! content types and bad JSON map onto the documented 415/400 envelopes
//! instead of whatever the extractor would produce.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::metrics::{HealthStatus, Metrics};
use crate::player::PlayerStore;
use crate::ratelimit::{authorize, RateDecision, RateLimiter};
use crate::registry::SolverRegistry;
use crate::resolvers::{
    ClearCacheRequest, DecryptRequest, RequestContext, Resolvers, ResolveRequest, StsRequest,
    ValidateRequest,
};
use crate::worker::WorkerPool;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: Config,
    pub resolvers: Resolvers,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire the whole pipeline together. Must run inside the tokio runtime
    /// (the worker pool spawns its workers immediately).
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .build()?;

        let store = Arc::new(PlayerStore::new(
            &config.player_cache_dir,
            config.player_cache_retention,
            http,
            Arc::clone(&metrics),
        )?);

        let pool = WorkerPool::spawn(
            config.worker_concurrency,
            config.worker_queue_capacity,
            config.worker_timeout,
            config.worker_max_retries,
            Arc::clone(&metrics),
        );

        let registry = SolverRegistry::new(store, pool, &config, Arc::clone(&metrics));
        let resolvers = Resolvers::new(registry, Arc::clone(&metrics));
        let limiter = RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window);

        Ok(Arc::new(Self {
            config,
            resolvers,
            limiter,
            metrics,
        }))
    }

    /// Periodic housekeeping: cache expiry sweeps, rate-limit bucket sweep,
    /// RSS sampling.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let registry = self.resolvers.registry();
        let mut handles = vec![
            registry.preprocessed.spawn_sweeper(),
            registry.solvers.spawn_sweeper(),
            registry.sts.spawn_sweeper(),
            self.limiter.spawn_sweeper(),
        ];

        let metrics = Arc::clone(&self.metrics);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                metrics.sample_memory();
            }
        }));
        handles
    }
}

// ---------------------------------------------------------------------------
// Router & server loop
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/decrypt_signature", post(post_decrypt))
        .route("/get_sts", post(post_sts))
        .route("/resolve_url", post(post_resolve))
        .route("/batch_decrypt", post(post_batch))
        .route("/validate_signature", post(post_validate))
        .route("/clear_cache", post(post_clear_cache))
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/info", get(get_info))
        .route("/", get(get_docs))
        .route("/docs", get(get_docs))
        .fallback(unknown_endpoint)
        .with_state(state)
}

/// Serve until the shutdown signal flips.
pub async fn run(
    state: Arc<AppState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

fn begin_request(headers: &HeaderMap) -> RequestContext {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    RequestContext {
        request_id,
        started_at: Instant::now(),
    }
}

/// Rate-limit and auth gate for the core endpoints. Status endpoints never
/// pass through here.
fn gate(state: &AppState, addr: &SocketAddr, path: &str, headers: &HeaderMap) -> Result<()> {
    match state.limiter.check(&addr.ip().to_string(), path) {
        RateDecision::Allowed { .. } => {}
        RateDecision::Limited { retry_after } => {
            state.metrics.rate_limited_total.inc();
            return Err(ServiceError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
    }

    if state.config.auth_enabled() {
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !authorize(header, &state.config.api_token) {
            return Err(ServiceError::Unauthorized);
        }
    }

    Ok(())
}

/// Parse the body as JSON, mapping a wrong content type to 415 and broken
/// JSON to a 400 with a stable code.
fn parse_json(headers: &HeaderMap, body: &str) -> Result<Value> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(ServiceError::UnsupportedMediaType);
    }
    serde_json::from_str(body)
        .map_err(|e| ServiceError::validation("INVALID_JSON", format!("invalid JSON body: {e}")))
}

fn parse_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &str) -> Result<T> {
    let value = parse_json(headers, body)?;
    serde_json::from_value(value)
        .map_err(|e| ServiceError::validation("INVALID_REQUEST", e.to_string()))
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

fn request_id_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(&ctx.request_id),
    );
    headers
}

fn success_response(
    state: &AppState,
    ctx: &RequestContext,
    path: &'static str,
    mut data: Value,
    extra_headers: Option<HeaderMap>,
) -> Response {
    let elapsed = ctx.started_at.elapsed();
    if let Some(obj) = data.as_object_mut() {
        obj.insert("success".into(), json!(true));
        obj.insert("timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
        obj.insert(
            "processing_time_ms".into(),
            json!(elapsed.as_millis() as u64),
        );
    }

    state.metrics.responses_total.with(&[path, "200"]).inc();
    state.metrics.request_duration.with(&[path]).observe(elapsed);
    state.metrics.record_outcome(false);

    let mut headers = extra_headers.unwrap_or_default();
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(&ctx.request_id),
    );
    (StatusCode::OK, headers, axum::Json(data)).into_response()
}

fn error_response(
    state: &AppState,
    ctx: &RequestContext,
    path: &'static str,
    error: ServiceError,
) -> Response {
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let now = chrono::Utc::now().to_rfc3339();
    let body = json!({
        "success": false,
        "error": {
            "error": error.to_string(),
            "code": error.code(),
            "timestamp": now,
            "request_id": ctx.request_id,
        },
        "timestamp": now,
    });

    let elapsed = ctx.started_at.elapsed();
    state.metrics.errors_total.with(&[error.kind()]).inc();
    state
        .metrics
        .responses_total
        .with(&[path, status.as_str()])
        .inc();
    state.metrics.request_duration.with(&[path]).observe(elapsed);
    state.metrics.record_outcome(true);

    if status.is_server_error() {
        tracing::error!("[http] {} {} -> {}: {}", path, ctx.request_id, status, error);
    } else {
        tracing::debug!("[http] {} {} -> {}: {}", path, ctx.request_id, status, error);
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(&ctx.request_id),
    );
    if let ServiceError::RateLimited { retry_after_secs } = &error {
        headers.insert(header::RETRY_AFTER, header_value(&retry_after_secs.to_string()));
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            header_value(&state.limiter.max_requests().to_string()),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from_static("0"),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            header_value(&retry_after_secs.to_string()),
        );
    }

    (status, headers, axum::Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// POST /decrypt_signature
// ---------------------------------------------------------------------------

async fn post_decrypt(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/decrypt_signature";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }
    let req: DecryptRequest = match parse_body(&headers, &body) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };

    match state.resolvers.decrypt(&req).await {
        Ok(out) => success_response(
            &state,
            &ctx,
            PATH,
            json!({
                "decrypted_signature": out.decrypted_signature,
                "decrypted_n_sig": out.decrypted_n_sig,
            }),
            None,
        ),
        Err(e) => error_response(&state, &ctx, PATH, e),
    }
}

// ---------------------------------------------------------------------------
// POST /get_sts
// ---------------------------------------------------------------------------

async fn post_sts(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/get_sts";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }
    let req: StsRequest = match parse_body(&headers, &body) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };

    match state.resolvers.sts(&req).await {
        Ok(out) => {
            let mut extra = HeaderMap::new();
            extra.insert(
                HeaderName::from_static("x-cache-hit"),
                HeaderValue::from_static(if out.cache_hit { "true" } else { "false" }),
            );
            success_response(&state, &ctx, PATH, json!({ "sts": out.sts }), Some(extra))
        }
        Err(e) => error_response(&state, &ctx, PATH, e),
    }
}

// ---------------------------------------------------------------------------
// POST /resolve_url
// ---------------------------------------------------------------------------

async fn post_resolve(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/resolve_url";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }
    let req: ResolveRequest = match parse_body(&headers, &body) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };

    match state.resolvers.resolve(&req).await {
        Ok(url) => success_response(&state, &ctx, PATH, json!({ "resolved_url": url }), None),
        Err(e) => error_response(&state, &ctx, PATH, e),
    }
}

// ---------------------------------------------------------------------------
// POST /batch_decrypt
// ---------------------------------------------------------------------------

async fn post_batch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/batch_decrypt";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }

    let value = match parse_json(&headers, &body) {
        Ok(v) => v,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };
    let Some(signatures) = value.get("signatures") else {
        return error_response(
            &state,
            &ctx,
            PATH,
            ServiceError::validation("MISSING_FIELD", "signatures is required"),
        );
    };
    if !signatures.is_array() {
        return error_response(
            &state,
            &ctx,
            PATH,
            ServiceError::validation("INVALID_REQUEST", "signatures must be an array"),
        );
    }
    let items: Vec<DecryptRequest> = match serde_json::from_value(signatures.clone()) {
        Ok(items) => items,
        Err(e) => {
            return error_response(
                &state,
                &ctx,
                PATH,
                ServiceError::validation("INVALID_REQUEST", e.to_string()),
            );
        }
    };

    let (results, summary) = state.resolvers.batch(&items).await;
    success_response(
        &state,
        &ctx,
        PATH,
        json!({ "results": results, "summary": summary }),
        None,
    )
}

// ---------------------------------------------------------------------------
// POST /validate_signature
// ---------------------------------------------------------------------------

async fn post_validate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/validate_signature";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }
    let req: ValidateRequest = match parse_body(&headers, &body) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };

    let out = state.resolvers.validate(&req);
    let data = serde_json::to_value(out).unwrap_or_else(|_| json!({}));
    success_response(&state, &ctx, PATH, data, None)
}

// ---------------------------------------------------------------------------
// POST /clear_cache
// ---------------------------------------------------------------------------

async fn post_clear_cache(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    const PATH: &str = "/clear_cache";
    let ctx = begin_request(&headers);
    state.metrics.requests_total.with(&[PATH]).inc();

    if let Err(e) = gate(&state, &addr, PATH, &headers) {
        return error_response(&state, &ctx, PATH, e);
    }
    let req: ClearCacheRequest = match parse_body(&headers, &body) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &ctx, PATH, e),
    };

    match state.resolvers.clear_cache(&req) {
        Ok(out) => {
            let data = serde_json::to_value(out).unwrap_or_else(|_| json!({}));
            success_response(&state, &ctx, PATH, data, None)
        }
        Err(e) => error_response(&state, &ctx, PATH, e),
    }
}

// ---------------------------------------------------------------------------
// GET /health, /status, /metrics, /info, docs
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    let health = state.metrics.health_status();
    let status = if health == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": health.as_str(),
        "uptime_seconds": state.metrics.uptime().as_secs(),
        "error_rate": state.metrics.error_rate(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (status, request_id_headers(&ctx), axum::Json(body)).into_response()
}

async fn get_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    let registry = state.resolvers.registry();
    let store = registry.player_store();
    let body = json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": state.metrics.health_status().as_str(),
        "uptime_seconds": state.metrics.uptime().as_secs(),
        "caches": [
            registry.preprocessed.stats(),
            registry.solvers.stats(),
            registry.sts.stats(),
        ],
        "player_store": {
            "files": store.file_count(),
            "directory": store.dir().display().to_string(),
        },
        "worker_pool": {
            "concurrency": state.config.worker_concurrency,
            "active": state.metrics.workers_active.get(),
            "idle": state.metrics.workers_idle.get(),
        },
        "rate_limiter": {
            "buckets": state.limiter.bucket_count(),
            "max_requests": state.limiter.max_requests(),
            "window_ms": state.limiter.window().as_millis() as u64,
        },
        "memory_rss_bytes": state.metrics.memory_rss_bytes.get(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (request_id_headers(&ctx), axum::Json(body)).into_response()
}

async fn get_metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    state.metrics.sample_memory();
    let text = state.metrics.render();
    let mut out = request_id_headers(&ctx);
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    (StatusCode::OK, out, text).into_response()
}

async fn get_info(headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    let body = json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "endpoints": {
            "POST /decrypt_signature": "decrypt a signature and/or n parameter",
            "POST /get_sts": "extract the player's signature timestamp",
            "POST /resolve_url": "rewrite a stream URL with decrypted tokens",
            "POST /batch_decrypt": "decrypt many signatures in one call",
            "POST /validate_signature": "cheap signature shape check",
            "POST /clear_cache": "drop one or all caches",
            "GET /health": "health classification",
            "GET /status": "cache, worker and limiter snapshot",
            "GET /metrics": "Prometheus text metrics",
        },
    });
    (request_id_headers(&ctx), axum::Json(body)).into_response()
}

async fn get_docs(headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    (request_id_headers(&ctx), Html(DOCS_HTML)).into_response()
}

async fn unknown_endpoint(headers: HeaderMap) -> Response {
    let ctx = begin_request(&headers);
    let now = chrono::Utc::now().to_rfc3339();
    let body = json!({
        "success": false,
        "error": {
            "error": "unknown endpoint",
            "code": "NOT_FOUND",
            "timestamp": now,
            "request_id": ctx.request_id,
        },
        "timestamp": now,
    });
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(&ctx.request_id),
    );
    (StatusCode::NOT_FOUND, headers, axum::Json(body)).into_response()
}

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>ytsig</title></head>
<body>
<h1>ytsig &mdash; player signature resolver</h1>
<p>POST JSON to the endpoints below. Every response carries
<code>success</code>, <code>timestamp</code>, <code>processing_time_ms</code>
and an <code>X-Request-ID</code> header.</p>
<ul>
<li><code>POST /decrypt_signature</code> &mdash; {player_url, encrypted_signature?, n_param?}</li>
<li><code>POST /get_sts</code> &mdash; {player_url}</li>
<li><code>POST /resolve_url</code> &mdash; {stream_url, player_url, encrypted_signature?, signature_key?, n_param?}</li>
<li><code>POST /batch_decrypt</code> &mdash; {signatures: [...]}</li>
<li><code>POST /validate_signature</code> &mdash; {encrypted_signature, player_url}</li>
<li><code>POST /clear_cache</code> &mdash; {cache_type?, clear_all?}</li>
<li><code>GET /health</code>, <code>GET /status</code>, <code>GET /metrics</code>, <code>GET /info</code></li>
</ul>
</body>
</html>
"#;
