//! Gateway server: shared state, router, auth and lifecycle.

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::Router;
use coachcast_channels::TelegramChannel;
use coachcast_core::CoachcastConfig;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::types::ChannelKind;
use coachcast_scheduler::SchedulerEngine;
use coachcast_store::DeliveryStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::routes;

/// Shared state for all handlers.
pub struct AppState {
    pub config: CoachcastConfig,
    pub store: Arc<DeliveryStore>,
    pub engine: Arc<SchedulerEngine>,
    /// Set when a Telegram bot is configured; used to confirm chat links.
    pub telegram: Option<Arc<TelegramChannel>>,
    pub channels: Vec<ChannelKind>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: CoachcastConfig,
        store: Arc<DeliveryStore>,
        engine: Arc<SchedulerEngine>,
        channels: Vec<ChannelKind>,
    ) -> Self {
        let telegram = config
            .channels
            .telegram
            .as_ref()
            .filter(|t| t.enabled && !t.bot_token.is_empty())
            .map(|t| Arc::new(TelegramChannel::new(t.clone())));
        Self { config, store, engine, telegram, channels, start_time: Instant::now() }
    }
}

/// Reject `/api/*` calls without the configured bearer token.
async fn require_token(State(state): State<Arc<AppState>>, request: Request, next: Next) -> std::result::Result<Response, ApiError> {
    if let Some(token) = &state.config.gateway.api_token {
        let provided = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            None => return Err(ApiError::Unauthorized("missing bearer token".into())),
            Some(p) if p != token => return Err(ApiError::Unauthorized("invalid bearer token".into())),
            Some(_) => {}
        }
    }
    Ok(next.run(request).await)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/info", get(routes::system_info))
        .route("/api/queue/stats", get(routes::queue_stats))
        .route("/api/queue/jobs", get(routes::list_jobs))
        .route("/api/queue/jobs/{id}", get(routes::get_job))
        .route("/api/queue/jobs/{id}/retry", post(routes::retry_job))
        .route("/api/queue/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/scheduler/tick", post(routes::run_tick))
        .route("/api/subscribers", post(routes::create_subscriber))
        .route("/api/subscribers/{id}", get(routes::get_subscriber))
        .route("/api/subscribers/{id}/pause", post(routes::pause_subscriber))
        .route("/api/subscribers/{id}/resume", post(routes::resume_subscriber))
        .route("/api/subscribers/{id}/content/{date}", put(routes::put_content))
        .route("/api/subscribers/{id}/library", get(routes::library))
        .route("/api/subscribers/{id}/inbox", get(routes::inbox))
        .route("/api/inbox/{id}/read", post(routes::mark_inbox_read))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/webhooks/telegram", post(routes::telegram_webhook))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until `shutdown` flips to true.
pub async fn start(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoachcastError::Gateway(format!("Failed to bind {addr}: {e}")))?;
    tracing::info!("🌐 Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| CoachcastError::Gateway(format!("Server error: {e}")))?;

    tracing::info!("Gateway stopped");
    Ok(())
}
