mod classify;
mod config;
mod credentials;
mod http;
mod invoker;
mod memory;
mod metrics;
mod models;
mod monitor;
mod notify;
mod pipeline;
mod ports;
mod queue;
mod retry;
mod security;
mod status;
mod supabase;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use config::ScrapeSettings;
use eyre::WrapErr;
use memory::{MemoryBackend, SimulatedAutomation};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ScrapingJob};
use notify::{Notification, NotificationFeed};
use pipeline::{Backends, ScrapePipeline};
use ports::{BackendError, JobStore};
use queue::{EnqueueOutcome, QueueError, QueueSnapshot, ScrapeQueue};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use status::{ScrapingState, StatusBoard};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use supabase::SupabaseClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target: "scrape.api", "server crashed: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let settings = ScrapeSettings::from_env();
    let backends = match SupabaseClient::from_env() {
        Some(client) => {
            info!(target: "scrape.api", "using hosted backend");
            Backends::supabase(client)
        }
        None => {
            warn!(
                target: "scrape.api",
                "SUPABASE_URL or service key missing; starting in demo mode"
            );
            let backend = MemoryBackend::demo();
            let automation = SimulatedAutomation::new(backend.clone(), settings.simulated_step);
            Backends::memory(backend, automation)
        }
    };

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let (state, worker) = AppState::build(
        backends,
        &settings,
        prometheus_handle,
        std::env::var("METRICS_KEY").ok(),
    );
    let app = build_router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target: "scrape.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;

    // the router owned the last queue handle; let queued providers finish
    if tokio::time::timeout(Duration::from_secs(30), worker)
        .await
        .is_err()
    {
        warn!(target: "scrape.api", "queue still busy at shutdown, exiting anyway");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target: "scrape.api", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target: "scrape.api", "shutdown requested");
}

#[derive(Clone)]
struct AppState {
    queue: ScrapeQueue,
    board: StatusBoard,
    jobs: Arc<dyn JobStore>,
    feed: NotificationFeed,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

impl AppState {
    fn build(
        backends: Backends,
        settings: &ScrapeSettings,
        prometheus_handle: PrometheusHandle,
        metrics_key: Option<String>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let board = StatusBoard::new();
        let feed = NotificationFeed::new(config::notification_history_from_env());
        let jobs = backends.jobs.clone();
        let pipeline = ScrapePipeline::new(backends, settings, board.clone(), Arc::new(feed.clone()));
        let (queue, worker) = ScrapeQueue::spawn(Arc::new(pipeline));
        let state = Self {
            queue,
            board,
            jobs,
            feed,
            prometheus_handle,
            metrics_key,
        };
        (state, worker)
    }
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route(
            "/providers/{id}/scrape",
            get(get_scrape_state).post(enqueue_scrape),
        )
        .route("/queue", get(get_queue))
        .route("/jobs/{id}", get(get_job))
        .route("/notifications", get(list_notifications))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

/// Liveness probe. No auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "utility-scrape-api",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Queue a scrape for a provider.
///
/// - Method: `POST`
/// - Path: `/providers/{id}/scrape`
/// - Auth: `Authorization: Bearer <key>` or `X-Scrape-Key: <key>`
/// - Response: `202` with `{provider_id, queued: true, position}`, or `200`
///   with `queued: false` when the provider was already waiting or running.
async fn enqueue_scrape(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(provider_id): Path<String>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), AppError> {
    crate::metrics::inc_requests("/providers/{id}/scrape");
    info!(
        target: "scrape.api",
        landlord_id = %context.landlord_id,
        api_key = %context.api_key_id,
        provider_id = %provider_id,
        "scrape requested"
    );
    let outcome = state.queue.enqueue(provider_id).await?;
    let status = if outcome.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ProviderScrapeView {
    provider_id: String,
    #[serde(flatten)]
    state: ScrapingState,
    latest_job: Option<ScrapingJob>,
}

/// Transient scraping state for a provider plus its newest job row.
async fn get_scrape_state(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> Result<Json<ProviderScrapeView>, AppError> {
    crate::metrics::inc_requests("/providers/{id}/scrape:get");
    let scraping = state.board.get(&provider_id).await;
    let latest_job = state.jobs.latest_job_for_provider(&provider_id).await?;
    Ok(Json(ProviderScrapeView {
        provider_id,
        state: scraping,
        latest_job,
    }))
}

async fn get_queue(State(state): State<AppState>) -> Result<Json<QueueSnapshot>, AppError> {
    crate::metrics::inc_requests("/queue");
    Ok(Json(state.queue.snapshot().await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ScrapingJob>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    match state.jobs.fetch_job(&job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(AppError::NotFound("job_not_found", job_id)),
    }
}

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    provider_id: Option<String>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
) -> Json<Vec<Notification>> {
    crate::metrics::inc_requests("/notifications");
    let notifications = match query.provider_id {
        Some(provider_id) => state.feed.for_provider(&provider_id),
        None => state.feed.recent(),
    };
    Json(notifications)
}

#[derive(Debug)]
enum AppError {
    NotFound(&'static str, String),
    Queue(QueueError),
    Backend(BackendError),
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl From<BackendError> for AppError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::NotFound(code, detail) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: code.to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::Queue(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError {
                    error: "queue_unavailable".to_string(),
                    detail: Some(err.to_string()),
                },
            ),
            AppError::Backend(err) => {
                error!(target: "scrape.api", error = %err, "backing store request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: "backend_error".to_string(),
                        detail: Some(err.to_string()),
                    },
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
