//! Keypool Gateway
//!
//! Single-binary OpenAI-compatible gateway that:
//! 1. Registers upstream credentials with daily quotas
//! 2. Routes chat requests to named handlers (rotating pools, tiered
//!    pools, canned responders) selected by the request's `model`
//! 3. Runs configured request transforms before dispatch
//! 4. Synthesizes SSE streaming from non-streaming upstream calls

mod config;
mod connectors;
mod metrics;
mod pipeline;
mod stream;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::connectors::{HttpQueryApi, QueryApi, ReaderFetcher};
use crate::pipeline::{Pipeline, PipelineError, WebSummary};
use key_pool::{CannedResponder, RotationPool, TieredPool};
use key_registry::Registry;
use provider::{BackendError, ChatBackend, ChatRequest, Handler, HandlerError, HttpBackend};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cheap per-process counters surfaced by /health; Prometheus series are
/// recorded separately in the metrics module.
#[derive(Clone)]
struct GatewayMetrics {
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
}

impl GatewayMetrics {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    registry: Arc<Registry>,
    pool_count: usize,
    metrics: GatewayMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer enforces `max_connections`; excess requests
/// queue rather than fail.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Register every configured credential, preserving declaration order so
/// generated `key_<n>` aliases are stable across restarts.
fn build_registry(config: &Config) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    for cred in &config.credentials {
        let secret = cred.secret.clone().expect("secret resolved at config load");
        registry.register(
            cred.url.clone(),
            secret,
            cred.model.clone(),
            cred.limit,
            cred.alias.clone(),
        );
    }
    registry
}

/// Construct the named handlers: one rotation or tiered pool per `[[pools]]`
/// entry, one canned responder per `[[responders]]` entry.
fn build_handlers(
    config: &Config,
    registry: &Arc<Registry>,
    backend: &Arc<dyn ChatBackend>,
) -> HashMap<String, Arc<dyn Handler>> {
    let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();

    for pool in &config.pools {
        if pool.tiers.is_empty() {
            let handler = RotationPool::new(
                pool.name.clone(),
                &pool.aliases,
                Arc::clone(registry),
                Arc::clone(backend),
            );
            handlers.insert(pool.name.clone(), Arc::new(handler));
        } else {
            let tiers: Vec<(Arc<dyn Handler>, f64)> = pool
                .tiers
                .iter()
                .enumerate()
                .map(|(i, tier)| {
                    let inner = RotationPool::new(
                        format!("{}/tier{}", pool.name, i),
                        &tier.aliases,
                        Arc::clone(registry),
                        Arc::clone(backend),
                    );
                    (Arc::new(inner) as Arc<dyn Handler>, tier.temperature)
                })
                .collect();
            let handler = TieredPool::new(pool.name.clone(), tiers);
            handlers.insert(pool.name.clone(), Arc::new(handler));
        }
    }

    for responder in &config.responders {
        let handler = CannedResponder::new(responder.name.clone(), responder.replies.clone());
        handlers.insert(responder.name.clone(), Arc::new(handler));
    }

    handlers
}

fn build_pipeline(
    config: &Config,
    handlers: HashMap<String, Arc<dyn Handler>>,
    client: &reqwest::Client,
    timeout: Duration,
) -> Pipeline {
    let ws = &config.pipeline.web_summary;
    let web_summary = ws.enable.then(|| {
        let summary_handler = ws
            .summary_handler
            .as_ref()
            .and_then(|name| handlers.get(name).map(Arc::clone));
        let headers: Vec<(String, String)> = ws
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        WebSummary {
            fetcher: Arc::new(ReaderFetcher::new(
                client.clone(),
                ws.reader_url.clone(),
                headers,
                timeout,
            )),
            summary_handler,
            inter_request_delay: Duration::from_millis(ws.inter_request_delay_ms),
        }
    });

    let hook_rules = if config.pipeline.hook.enable {
        config.pipeline.hook.rules.clone()
    } else {
        Vec::new()
    };

    let query_apis: Vec<Arc<dyn QueryApi>> = if config.pipeline.query_apis.enable {
        config
            .pipeline
            .query_apis
            .apis
            .iter()
            .map(|api| {
                Arc::new(HttpQueryApi::new(client.clone(), api.clone(), timeout))
                    as Arc<dyn QueryApi>
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut pipeline = Pipeline::new(handlers, config.server.default_handler.clone())
        .with_timestamp(config.pipeline.add_timestamp)
        .with_hook_rules(hook_rules)
        .with_query_apis(query_apis);
    if let Some(ws) = web_summary {
        pipeline = pipeline.with_web_summary(ws);
    }
    pipeline
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting keypool-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        credentials = config.credentials.len(),
        pools = config.pools.len(),
        responders = config.responders.len(),
        default_handler = %config.server.default_handler,
        "configuration loaded"
    );

    let timeout = Duration::from_secs(config.server.timeout_secs);
    let client = reqwest::Client::new();

    let registry = build_registry(&config);
    let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::new(client.clone(), timeout));
    let handlers = build_handlers(&config, &registry, &backend);
    let pipeline = build_pipeline(&config, handlers, &client, timeout);

    spawn_daily_reset(Arc::clone(&registry));

    let app_state = AppState {
        pipeline: Arc::new(pipeline),
        registry,
        pool_count: config.pools.len(),
        metrics: GatewayMetrics::new(),
        prometheus: prometheus_handle,
    };

    let listen_addr = config.server.listen_addr;
    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT caps how long a slow client can block process exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// POST /v1/chat/completions — run the pipeline and render the result as
/// either a JSON completion or a synthesized SSE stream.
async fn chat_handler(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<ChatRequest>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();
    let wants_stream = request.stream;

    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match state.pipeline.process(request).await {
        Ok(completion) => {
            if wants_stream {
                stream::sse_response(&completion).into_response()
            } else {
                axum::Json(completion).into_response()
            }
        }
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            dispatch_error_response(e, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        "/v1/chat/completions",
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Map pipeline failures onto OpenAI-style error bodies.
fn dispatch_error_response(err: PipelineError, request_id: &str) -> Response {
    let (status, error_type, kind) = match &err {
        PipelineError::InvalidRequest(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_request")
        }
        PipelineError::Handler(HandlerError::NoAvailableCredential(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "no_available_credential",
            "pool_exhausted",
        ),
        PipelineError::Handler(HandlerError::Backend(BackendError::Timeout(_))) => {
            (StatusCode::GATEWAY_TIMEOUT, "upstream_error", "timeout")
        }
        PipelineError::Handler(HandlerError::Backend(BackendError::Status { .. })) => {
            (StatusCode::BAD_GATEWAY, "upstream_error", "upstream_status")
        }
        PipelineError::Handler(HandlerError::Backend(BackendError::Transport(_))) => {
            (StatusCode::BAD_GATEWAY, "upstream_error", "transport")
        }
        PipelineError::Handler(HandlerError::Backend(BackendError::Decode(_))) => {
            (StatusCode::BAD_GATEWAY, "upstream_error", "decode")
        }
    };

    warn!(request_id, error = %err, "request failed");
    metrics::record_dispatch_error(kind);

    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": err.to_string(),
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /v1/models — the configured handler names, OpenAI list shape.
async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<serde_json::Value> = state
        .pipeline
        .handler_names()
        .into_iter()
        .map(|name| {
            serde_json::json!({
                "id": name,
                "object": "model",
                "owned_by": "keypool-gateway",
            })
        })
        .collect();
    axum::Json(serde_json::json!({ "object": "list", "data": data }))
}

/// GET /health — status, uptime, request counters, and the credential
/// inventory (aliases, usage, quotas; never secrets).
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    // Pools configured but nothing registered means every pool-backed
    // request will fail; responders alone still count as serving.
    let degraded = state.pool_count > 0 && state.registry.is_empty();
    let (status_code, status) = if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "handlers": state.pipeline.handler_names(),
        "credentials": state.registry.inventory(),
    });
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Clear every credential's usage counter at each local midnight.
fn spawn_daily_reset(registry: Arc<Registry>) {
    tokio::spawn(async move {
        loop {
            let wait = duration_until_midnight(Local::now());
            tokio::time::sleep(wait).await;
            registry.reset_all_usage();
            info!("daily usage counters reset");
            // Sleep resolution can land a hair before midnight; re-arm
            // strictly inside the new day.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

fn duration_until_midnight(now: DateTime<Local>) -> Duration {
    let next_day = now.date_naive() + chrono::Days::new(1);
    let midnight = next_day.and_hms_opt(0, 0, 0).expect("valid midnight");
    match midnight.and_local_timezone(Local) {
        chrono::LocalResult::Single(next) | chrono::LocalResult::Ambiguous(next, _) => {
            (next - now).to_std().unwrap_or(Duration::from_secs(1))
        }
        // DST gap swallowed midnight; check again in an hour.
        chrono::LocalResult::None => Duration::from_secs(3600),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
