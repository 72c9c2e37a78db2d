use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::proxy::stream::StreamProxy;
use crate::proxy::upstream::UpstreamClient;
use crate::store::SlugStore;
use crate::token_manager::TokenManager;
use crate::vault::TokenSealer;
use crate::{api, jobs, proxy, AppState};

/// Token manager wired to the configured identity provider, sealing the
/// cached token when a master key is set.
pub fn build_token_manager(
    cfg: &Config,
    links: SlugStore,
    metrics: ProxyMetrics,
) -> anyhow::Result<TokenManager> {
    let credentials = cfg.oauth()?.clone();
    let mut tokens = TokenManager::new(&cfg.token_endpoint, credentials, links)?
        .with_metrics(metrics);
    if let Some(key) = cfg.master_key.as_deref() {
        tokens = tokens.with_sealer(TokenSealer::new(key)?);
    }
    Ok(tokens)
}

/// Connects the store and assembles everything the router needs.
pub async fn build_state(cfg: Config) -> anyhow::Result<Arc<AppState>> {
    tracing::info!("Opening link store...");
    let links = SlugStore::connect(&cfg.database_url)
        .await
        .context("failed to open link store")?;

    let metrics = ProxyMetrics::new()?;
    let tokens = Arc::new(build_token_manager(&cfg, links.clone(), metrics.clone())?);
    let upstream = UpstreamClient::new(&cfg.files_base_url)?;
    let proxy = StreamProxy::new(
        links.clone(),
        tokens.clone(),
        upstream,
        metrics.clone(),
        cfg.chunk_size,
    );

    Ok(Arc::new(AppState {
        config: cfg,
        links,
        tokens,
        proxy,
        metrics,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/v/:slug",
            get(proxy::handler::stream_handler).head(proxy::handler::stream_handler),
        )
        .route(
            "/v/:slug/:file_name",
            get(proxy::handler::stream_handler).head(proxy::handler::stream_handler),
        )
        // Link management — nested under /api/v1
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // Players embed links from arbitrary pages
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
                .allow_headers([RANGE])
                .expose_headers([CONTENT_RANGE, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE]),
        )
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware))
}

pub async fn run(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    jobs::cleanup::spawn(
        state.links.clone(),
        state.config.link_retention,
        state.config.sweep_interval,
    );
    tracing::info!(
        retention_secs = state.config.link_retention.as_secs(),
        interval_secs = state.config.sweep_interval.as_secs(),
        "Background link sweep started"
    );

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("reelgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.links.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: hardens every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    // Slugs are capabilities; keep them out of Referer
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}
