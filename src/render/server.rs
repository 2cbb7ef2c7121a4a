use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::api::{self, AppState, SharedState};
use super::services::build_services;
use super::worker::{Dispatcher, WorkerPool};
use crate::config::{ServerConfig, Settings};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Per-client sliding-window request limiter.
#[derive(Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    state: Arc<Mutex<LimiterState>>,
}

#[derive(Default)]
struct LimiterState {
    hits: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl LimiterState {
    /// Forget clients with no hits inside the window, at most once per window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        if self
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < window)
        {
            return;
        }
        self.hits.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|&newest| now.duration_since(newest) <= window)
        });
        self.last_sweep = Some(now);
    }
}

impl RateLimiter {
    pub fn new(limit_per_min: u32) -> Self {
        Self::with_window(limit_per_min as usize, RATE_WINDOW)
    }

    pub fn with_window(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    /// Record a request from `client` at `now`; false when over the limit.
    pub fn check(&self, client: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sweep(now, self.window);
        let recent = state.hits.entry(client.to_string()).or_default();
        while let Some(&oldest) = recent.front() {
            if now.duration_since(oldest) > self.window {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.len() >= self.limit {
            return false;
        }
        recent.push_back(now);
        true
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).hits.len()
    }
}

async fn rate_limit(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    if !limiter.enabled() || request.uri().path().starts_with("/health") {
        return next.run(request).await;
    }
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if !limiter.check(&client, Instant::now()) {
        info!(client = %client, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Rate limit exceeded"})),
        )
            .into_response();
    }
    next.run(request).await
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o).with_context(|| format!("Invalid CORS origin '{}'", o)))
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

/// Build the full application router with middleware.
pub fn build_router(state: SharedState, config: &ServerConfig) -> Result<Router> {
    let limiter = RateLimiter::new(config.rate_limit_per_min);
    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    });

    Ok(api::api_router()
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit))
        .layer(cors_layer(&config.cors_origins)?)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid)))
}

/// Start the HTTP server and, in queue mode, the render workers.
pub async fn start_server(settings: Settings) -> Result<()> {
    let services = build_services(&settings).await?;

    let (dispatcher, pool) = if settings.render.use_queue {
        let pool = WorkerPool::start(
            services.pipeline.clone(),
            settings.render.workers,
            settings.render.queue_capacity,
        );
        (pool.dispatcher(), Some(pool))
    } else {
        (Dispatcher::Background(services.pipeline.clone()), None)
    };

    let state = Arc::new(AppState {
        pipeline: services.pipeline,
        assistant: services.assistant,
        cache: services.cache,
        dispatcher,
        default_quality: settings.render.default_quality,
    });
    let app = build_router(state, &settings.server)?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "renderforge listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
