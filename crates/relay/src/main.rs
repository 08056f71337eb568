mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod metrics;
mod realtime;
mod store;
mod validation;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    auth::jwt::JwtAccessTokenService,
    config::{LogFormat, RelayConfig},
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::RelayMetrics,
    realtime::{HubHandle, RealtimeRouterState},
    store::CanvasStore,
    validation::MAX_REST_BODY_BYTES,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("EASEL_RELAY_JWT_SECRET is not set, using the development secret");
    }
    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret, config.token_ttl_secs)
            .context("invalid relay JWT configuration")?,
    );
    let store = CanvasStore::from_config(config.database_url.as_deref())
        .await
        .context("failed to initialize canvas store")?;

    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));
    let hub = realtime::spawn_hub(store.clone());
    let app = build_router(store, jwt_service, hub, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_router(
    store: CanvasStore,
    jwt_service: Arc<JwtAccessTokenService>,
    hub: HubHandle,
    cors_origins: Option<&str>,
) -> Router {
    let realtime_state = RealtimeRouterState {
        hub: hub.clone(),
        store: store.clone(),
        jwt_service: Arc::clone(&jwt_service),
    };

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .with_state(hub)
            .merge(realtime::router(realtime_state))
            .merge(api::router(store, jwt_service)),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz(State(hub): State<HubHandle>) -> Response {
    match hub.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "realtime": {
                "connections": stats.connections,
                "cached_canvases": stats.cached_canvases,
            },
        }))
        .into_response(),
        Err(error) => {
            error!(%error, "realtime hub unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "degraded" }))).into_response()
        }
    }
}

async fn metrics_text() -> Response {
    let body = metrics::global_metrics()
        .map(|metrics| metrics.render_prometheus())
        .unwrap_or_default();
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
