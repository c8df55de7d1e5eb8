//! API route handlers for the gateway.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{NaiveDate, Utc};
use coachcast_channels::parse_link_update;
use coachcast_core::types::{DailyContent, DeliveryStatus, Subscriber};
use coachcast_scheduler::timezone::parse_timezone;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "coachcast-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed();
    Json(serde_json::json!({
        "name": state.config.app.name,
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": uptime.as_secs(),
        "channels": state.channels,
        "scheduler": {
            "tick_interval_secs": state.config.scheduler.tick_interval_secs,
            "default_timezone": state.config.app.default_timezone,
        },
        "gateway": {
            "host": state.config.gateway.host,
            "port": state.config.gateway.port,
            "auth": state.config.gateway.api_token.is_some(),
        }
    }))
}

// ── Queue ──────────────────────────────────────────────

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.store.queue_stats()?;
    Ok(Json(serde_json::json!({
        "pending": stats.pending,
        "processing": stats.processing,
        "delivered": stats.delivered,
        "failed": stats.failed,
        "cancelled": stats.cancelled,
        "total": stats.total(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<DeliveryStatus>().map_err(|_| ApiError::bad_request(format!("unknown status '{s}'"))))
        .transpose()?;
    let jobs = state.store.list_jobs(status, query.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::json!({ "count": jobs.len(), "jobs": jobs })))
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .store
        .get_job(&id)?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    let attempts = state.store.list_attempts(&id)?;
    Ok(Json(serde_json::json!({ "job": job, "attempts": attempts })))
}

pub async fn retry_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    if state.store.retry_failed(&id, Utc::now())? {
        tracing::info!("Job {id} requeued by API");
        return Ok(Json(serde_json::json!({ "ok": true, "status": "pending" })));
    }
    match state.store.get_job(&id)? {
        Some(job) => Err(ApiError::bad_request(format!("job is {}, only failed jobs can be retried", job.status))),
        None => Err(ApiError::not_found(format!("job {id}"))),
    }
}

pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    if state.store.cancel(&id)? {
        return Ok(Json(serde_json::json!({ "ok": true, "status": "cancelled" })));
    }
    match state.store.get_job(&id)? {
        Some(job) => Err(ApiError::bad_request(format!("job is already {}", job.status))),
        None => Err(ApiError::not_found(format!("job {id}"))),
    }
}

pub async fn run_tick(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let report = state.engine.tick(Utc::now()).await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| ApiError::Internal(e.to_string()))?))
}

// ── Subscribers ────────────────────────────────────────

pub async fn create_subscriber(
    State(state): State<Arc<AppState>>,
    Json(mut subscriber): Json<Subscriber>,
) -> ApiResult<(StatusCode, Json<Subscriber>)> {
    if subscriber.id.trim().is_empty() {
        return Err(ApiError::bad_request("id must not be empty"));
    }
    parse_timezone(&subscriber.timezone)?;
    // Addresses left out of an update keep their stored values; the Telegram
    // chat id in particular is only ever set by the bot webhook.
    if let Some(existing) = state.store.get_subscriber(&subscriber.id)? {
        subscriber.email = subscriber.email.or(existing.email);
        subscriber.phone = subscriber.phone.or(existing.phone);
        subscriber.telegram_chat_id = subscriber.telegram_chat_id.or(existing.telegram_chat_id);
        subscriber.push_token = subscriber.push_token.or(existing.push_token);
        subscriber.created_at = existing.created_at;
    }
    state.store.upsert_subscriber(&subscriber)?;
    tracing::info!("Subscriber {} saved ({} channels)", subscriber.id, subscriber.channels.len());
    Ok((StatusCode::CREATED, Json(subscriber)))
}

pub async fn get_subscriber(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscriber>> {
    state
        .store
        .get_subscriber(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("subscriber {id}")))
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub until: NaiveDate,
}

pub async fn pause_subscriber(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PauseRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.set_paused_until(&id, Some(body.until))? {
        return Err(ApiError::not_found(format!("subscriber {id}")));
    }
    Ok(Json(serde_json::json!({ "ok": true, "paused_until": body.until })))
}

pub async fn resume_subscriber(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.set_paused_until(&id, None)? {
        return Err(ApiError::not_found(format!("subscriber {id}")));
    }
    Ok(Json(serde_json::json!({ "ok": true, "paused_until": null })))
}

// ── Content & inbox ────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub title: String,
    pub script: String,
    #[serde(default)]
    pub audio_url: Option<String>,
}

pub async fn put_content(
    State(state): State<Arc<AppState>>,
    Path((id, date)): Path<(String, String)>,
    Json(body): Json<ContentRequest>,
) -> ApiResult<Json<DailyContent>> {
    let date: NaiveDate = date
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid date '{date}', expected YYYY-MM-DD")))?;
    if state.store.get_subscriber(&id)?.is_none() {
        return Err(ApiError::not_found(format!("subscriber {id}")));
    }
    let mut content = DailyContent::new(id, date, body.title, body.script);
    content.audio_url = body.audio_url;
    state.store.put_content(&content)?;
    Ok(Json(content))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub unread: bool,
}

pub async fn library(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let items = state.store.list_content(&id, query.limit.unwrap_or(30).min(365))?;
    Ok(Json(serde_json::json!({ "subscriber_id": id, "items": items })))
}

pub async fn inbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let items = state.store.list_inbox(&id, query.unread, query.limit.unwrap_or(50).min(500))?;
    let unread = state.store.unread_count(&id)?;
    Ok(Json(serde_json::json!({ "subscriber_id": id, "unread": unread, "items": items })))
}

pub async fn mark_inbox_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.mark_read(id)? {
        return Err(ApiError::not_found(format!("inbox item {id}")));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ── Telegram ───────────────────────────────────────────

/// Bot webhook. `/start <subscriber_id>` links the chat to that subscriber.
pub async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(telegram) = state.telegram.as_ref() else {
        return Err(ApiError::not_found("telegram is not configured"));
    };
    if let Some(secret) = telegram.webhook_secret() {
        let provided = headers.get(TELEGRAM_SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(secret) {
            return Err(ApiError::Unauthorized("invalid webhook secret".into()));
        }
    }

    let Some(link) = parse_link_update(&update) else {
        return Ok(Json(serde_json::json!({ "ok": true, "linked": false })));
    };

    let linked = state.store.set_telegram_chat_id(&link.subscriber_id, &link.chat_id)?;
    if linked {
        tracing::info!("Telegram chat linked for {}", link.subscriber_id);
        let text = format!("You're all set! Your daily {} sessions will arrive here.", state.config.app.name);
        if let Err(e) = telegram.send_text(&link.chat_id, &text).await {
            tracing::warn!("Telegram link confirmation failed: {e}");
        }
    } else {
        tracing::warn!("Telegram /start for unknown subscriber {}", link.subscriber_id);
    }
    Ok(Json(serde_json::json!({ "ok": true, "linked": linked })))
}
