//! Telegram Bot API channel: `sendMessage`, plus `sendAudio` for the session audio.
//!
//! Subscribers link their chat by opening `t.me/<bot>?start=<subscriber_id>`;
//! the resulting `/start <id>` update arrives on the gateway webhook.

use async_trait::async_trait;
use coachcast_core::config::TelegramConfig;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
use serde::Deserialize;

use crate::http;
use crate::render::{telegram_html, truncate_chars};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// A chat that sent `/start <subscriber_id>` to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub chat_id: String,
    pub subscriber_id: String,
}

/// Extract a link request from a webhook update, if it carries one.
pub fn parse_link_update(update: &serde_json::Value) -> Option<LinkRequest> {
    let message = &update["message"];
    let text = message["text"].as_str()?.trim();
    let rest = text.strip_prefix("/start")?;
    // `/start@BotName payload` in groups
    let rest = match rest.strip_prefix('@') {
        Some(with_bot) => with_bot.split_once(' ').map(|(_, p)| p).unwrap_or(""),
        None => rest,
    };
    let subscriber_id = rest.trim();
    if subscriber_id.is_empty() {
        return None;
    }
    let chat_id = match &message["chat"]["id"] {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    Some(LinkRequest { chat_id, subscriber_id: subscriber_id.to_string() })
}

pub struct TelegramChannel {
    config: TelegramConfig,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.into())
            .trim_end_matches('/')
            .to_string();
        Self { config, api_base, client: http::client() }
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.webhook_secret.as_deref()
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.config.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error("telegram", e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: ApiResponse = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(_) => return Err(http::status_error("telegram", status, &text, None)),
        };

        if parsed.ok {
            return Ok(parsed.result.unwrap_or(serde_json::Value::Null));
        }

        let description = parsed.description.unwrap_or_default();
        let code = parsed.error_code.unwrap_or(status.as_u16());
        let retry_after = parsed.parameters.and_then(|p| p.retry_after);
        Err(classify_telegram_error(code, &description, retry_after))
    }

    /// Plain message to a chat (used for link confirmations).
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        self.call(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": truncate_chars(text, MAX_MESSAGE_CHARS) }),
        )
        .await?;
        Ok(())
    }
}

fn classify_telegram_error(code: u16, description: &str, retry_after: Option<u64>) -> CoachcastError {
    match code {
        429 => CoachcastError::rate_limited(format!("telegram: {description}"), retry_after),
        // Bot blocked, user deactivated.
        403 => CoachcastError::rejected(format!("telegram 403: {description}")),
        400 if description.contains("chat not found") => {
            CoachcastError::InvalidRecipient(format!("telegram: {description}"))
        }
        c if c >= 500 => CoachcastError::channel(format!("telegram {c}: {description}")),
        c => CoachcastError::rejected(format!("telegram {c}: {description}")),
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Telegram }

    fn name(&self) -> &str { "telegram" }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let chat_id = subscriber
            .address_for(ChannelKind::Telegram)
            .ok_or_else(|| CoachcastError::InvalidRecipient(format!("{} has not linked Telegram", subscriber.id)))?;

        let result = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": chat_id,
                    "text": telegram_html(notification, MAX_MESSAGE_CHARS),
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }),
            )
            .await?;

        if self.config.send_audio {
            if let Some(audio) = &notification.audio_url {
                // The text already landed; a failed audio upload must not trigger a resend.
                if let Err(e) = self
                    .call(
                        "sendAudio",
                        serde_json::json!({ "chat_id": chat_id, "audio": audio, "title": notification.title }),
                    )
                    .await
                {
                    tracing::warn!("Telegram audio for {} failed: {e}", subscriber.id);
                }
            }
        }

        let message_id = result["message_id"].as_i64().map(|id| id.to_string());
        Ok(DeliveryReceipt { provider_message_id: message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::NaiveTime;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn bot_api(
        State(calls): State<Calls>,
        Path((_token, method)): Path<(String, String)>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        calls.lock().await.push((method.clone(), body.clone()));
        let reply = match body["chat_id"].as_str().unwrap_or_default() {
            "blocked" => serde_json::json!({
                "ok": false, "error_code": 403, "description": "Forbidden: bot was blocked by the user"
            }),
            "busy" => serde_json::json!({
                "ok": false, "error_code": 429, "description": "Too Many Requests: retry after 17",
                "parameters": {"retry_after": 17}
            }),
            _ if method == "sendAudio" => serde_json::json!({
                "ok": false, "error_code": 400, "description": "Bad Request: wrong file identifier"
            }),
            _ => serde_json::json!({"ok": true, "result": {"message_id": 42}}),
        };
        Json(reply)
    }

    async fn setup(send_audio: bool) -> (TelegramChannel, Calls) {
        let calls: Calls = Arc::default();
        // The bot API path is `/bot<token>/<method>`; the mock token is "bottest".
        let router = Router::new()
            .route("/{token}/{method}", post(bot_api))
            .with_state(calls.clone());
        let base = mock::serve(router).await;
        let channel = TelegramChannel::new(TelegramConfig {
            bot_token: "test".into(),
            webhook_secret: None,
            send_audio,
            api_base: Some(base),
            enabled: true,
        });
        (channel, calls)
    }

    fn subscriber(chat: Option<&str>) -> Subscriber {
        let mut s = Subscriber::new("u1", "Lee", "UTC", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        s.telegram_chat_id = chat.map(String::from);
        s
    }

    fn notification() -> Notification {
        Notification {
            subscriber_id: "u1".into(),
            title: "Coachcast: Rest".into(),
            body: "Slow down today.".into(),
            audio_url: Some("https://blob.example.com/rest.mp3".into()),
            link: Some("https://coach.example.com/library/2026-03-10".into()),
        }
    }

    #[tokio::test]
    async fn test_send_message_then_audio() {
        let (channel, calls) = setup(true).await;
        let receipt = channel.deliver(&subscriber(Some("1001")), &notification()).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("42"));

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sendMessage");
        assert_eq!(calls[0].1["parse_mode"], "HTML");
        assert!(calls[0].1["text"].as_str().unwrap().starts_with("<b>Coachcast: Rest</b>"));
        // The audio call fails in the mock, but delivery still succeeds.
        assert_eq!(calls[1].0, "sendAudio");
    }

    #[tokio::test]
    async fn test_audio_disabled() {
        let (channel, calls) = setup(false).await;
        channel.deliver(&subscriber(Some("1001")), &notification()).await.unwrap();
        assert_eq!(calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_and_rate_limited() {
        let (channel, _) = setup(false).await;

        let err = channel.deliver(&subscriber(Some("blocked")), &notification()).await.unwrap_err();
        assert!(matches!(err, CoachcastError::ChannelRejected(_)));

        let err = channel.deliver(&subscriber(Some("busy")), &notification()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(17));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unlinked_subscriber() {
        let (channel, calls) = setup(false).await;
        assert!(!channel.can_reach(&subscriber(None)));
        assert!(channel.deliver(&subscriber(None), &notification()).await.is_err());
        assert!(calls.lock().await.is_empty());
    }

    #[test]
    fn test_parse_link_update() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {"chat": {"id": 123456789}, "text": "/start sub_42"}
        });
        assert_eq!(
            parse_link_update(&update),
            Some(LinkRequest { chat_id: "123456789".into(), subscriber_id: "sub_42".into() })
        );

        let with_bot = serde_json::json!({"message": {"chat": {"id": -5}, "text": "/start@CoachBot abc"}});
        assert_eq!(parse_link_update(&with_bot).unwrap().subscriber_id, "abc");

        let bare = serde_json::json!({"message": {"chat": {"id": 1}, "text": "/start"}});
        assert!(parse_link_update(&bare).is_none());

        let other = serde_json::json!({"message": {"chat": {"id": 1}, "text": "hello"}});
        assert!(parse_link_update(&other).is_none());
    }

    #[test]
    fn test_classify_chat_not_found() {
        let err = classify_telegram_error(400, "Bad Request: chat not found", None);
        assert!(matches!(err, CoachcastError::InvalidRecipient(_)));
        assert!(classify_telegram_error(502, "Bad Gateway", None).is_retryable());
    }
}
