use crate::config::ProxyConfig;
use crate::error::{AppError, AppResult};
use crate::store::ObservationStore;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, OnceLock};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub http: reqwest::Client,
    pub store: Arc<ObservationStore>,
    pub metrics: PrometheusHandle,
}

// The prometheus recorder is process-global; remember the install outcome so
// repeated state loads (tests build many) share one handle.
static RECORDER: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

pub fn load_state() -> AppResult<AppState> {
    let config = ProxyConfig::load().map_err(|err| {
        AppError::new(axum::http::StatusCode::BAD_REQUEST, "config_invalid", err)
    })?;
    load_state_with_config(config)
}

pub fn load_state_with_config(config: ProxyConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("periscope/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;
    let store = Arc::new(ObservationStore::new(&config.monitor));
    Ok(AppState {
        config: Arc::new(config),
        http,
        store,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    let outcome = RECORDER.get_or_init(|| {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .install_recorder()
            .map_err(|err| err.to_string())
    });
    outcome.clone().map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_unavailable",
            format!("prometheus recorder install failed: {err}"),
        )
        .with_type("api_error")
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.config.metrics_path.clone();
    Router::<AppState>::new()
        .route("/", get(crate::handlers::service_info))
        .route("/health", get(crate::handlers::health))
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::count_tokens),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .nest("/api/monitor", build_monitor_router())
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_monitor_router() -> Router<AppState> {
    Router::new()
        .route("/requests", get(crate::monitor::list_requests))
        .route("/requests/{id}", get(crate::monitor::get_request))
        .route("/stats", get(crate::monitor::get_stats))
        .route("/stream", get(crate::monitor::stream_events))
        .route("/clear", post(crate::monitor::clear))
        .route("/export", get(crate::monitor::export))
        .layer(CorsLayer::permissive())
}
