//! Push notifications through a relay service.
//!
//! The relay owns VAPID keys and payload encryption; we post a JSON envelope
//! addressed to the subscriber's push token.

use async_trait::async_trait;
use coachcast_core::config::PushConfig;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
use serde::Serialize;

use crate::http;
use crate::render::truncate_chars;

const MAX_PUSH_BODY_CHARS: usize = 240;

#[derive(Debug, Serialize)]
struct PushEnvelope<'a> {
    to: &'a str,
    title: &'a str,
    body: String,
    data: PushData<'a>,
}

#[derive(Debug, Serialize)]
struct PushData<'a> {
    subscriber_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_url: Option<&'a str>,
}

pub struct PushChannel {
    config: PushConfig,
    client: reqwest::Client,
}

impl PushChannel {
    pub fn new(config: PushConfig) -> Self {
        Self { config, client: http::client() }
    }
}

#[async_trait]
impl DeliveryChannel for PushChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Push }

    fn name(&self) -> &str { "push-relay" }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let token = subscriber
            .address_for(ChannelKind::Push)
            .ok_or_else(|| CoachcastError::InvalidRecipient(format!("{} has no push subscription", subscriber.id)))?;

        let envelope = PushEnvelope {
            to: token,
            title: &notification.title,
            body: truncate_chars(&notification.body, MAX_PUSH_BODY_CHARS),
            data: PushData {
                subscriber_id: &subscriber.id,
                link: notification.link.as_deref(),
                audio_url: notification.audio_url.as_deref(),
            },
        };

        let mut request = self.client.post(&self.config.endpoint).json(&envelope);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| http::transport_error("push", e))?;

        let status = response.status();
        if status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let id = body["id"].as_str().map(String::from);
            return Ok(DeliveryReceipt { provider_message_id: id });
        }

        let retry_after = http::retry_after_header(response.headers());
        let text = response.text().await.unwrap_or_default();
        match status.as_u16() {
            // The browser dropped the subscription.
            404 | 410 => Err(CoachcastError::InvalidRecipient(format!("push subscription expired: {text}"))),
            _ => Err(http::status_error("push", status, &text, retry_after)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::NaiveTime;

    async fn relay(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> (StatusCode, Json<serde_json::Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer relay-token") {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "auth"})));
        }
        if body["to"] == "gone" {
            return (StatusCode::GONE, Json(serde_json::json!({"error": "expired"})));
        }
        assert!(body["body"].as_str().unwrap().chars().count() <= MAX_PUSH_BODY_CHARS);
        (StatusCode::OK, Json(serde_json::json!({"id": "push-1", "echo": body})))
    }

    async fn channel(token: Option<&str>) -> PushChannel {
        let base = mock::serve(Router::new().route("/send", post(relay))).await;
        PushChannel::new(PushConfig {
            endpoint: format!("{base}/send"),
            token: token.map(String::from),
            enabled: true,
        })
    }

    fn subscriber(token: &str) -> Subscriber {
        let mut s = Subscriber::new("u1", "Kai", "UTC", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        s.push_token = Some(token.into());
        s
    }

    fn notification() -> Notification {
        Notification {
            subscriber_id: "u1".into(),
            title: "Coachcast: Energy".into(),
            body: "word ".repeat(100),
            audio_url: None,
            link: Some("https://coach.example.com/library/2026-03-10".into()),
        }
    }

    #[tokio::test]
    async fn test_push_delivery() {
        let channel = channel(Some("relay-token")).await;
        let receipt = channel.deliver(&subscriber("tok-1"), &notification()).await.unwrap();
        assert_eq!(receipt.provider_message_id.as_deref(), Some("push-1"));
    }

    #[tokio::test]
    async fn test_expired_subscription_is_permanent() {
        let channel = channel(Some("relay-token")).await;
        let err = channel.deliver(&subscriber("gone"), &notification()).await.unwrap_err();
        assert!(matches!(err, CoachcastError::InvalidRecipient(_)));
    }

    #[tokio::test]
    async fn test_bad_relay_token_is_rejected() {
        let channel = channel(None).await;
        let err = channel.deliver(&subscriber("tok-1"), &notification()).await.unwrap_err();
        assert!(matches!(err, CoachcastError::ChannelRejected(_)));
    }
}
