//! Twilio Programmable Messaging: SMS and WhatsApp share one Messages API client.

use async_trait::async_trait;
use coachcast_core::config::TwilioConfig;
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
use serde::Deserialize;
use std::sync::Arc;

use crate::http;
use crate::render::{plain_text, truncate_chars};

const DEFAULT_API_BASE: &str = "https://api.twilio.com";
/// Twilio concatenates segments up to this many characters.
const MAX_BODY_CHARS: usize = 1600;

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: Option<String>,
}

/// Thin client over `POST /2010-04-01/Accounts/{sid}/Messages.json`.
pub struct TwilioClient {
    account_sid: String,
    auth_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TwilioClient {
    pub fn new(config: &TwilioConfig) -> Self {
        Self {
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.into())
                .trim_end_matches('/')
                .to_string(),
            client: http::client(),
        }
    }

    /// Send one message, returning the message SID.
    pub async fn send_message(&self, from: &str, to: &str, body: &str, media_url: Option<&str>) -> Result<String> {
        let url = format!("{}/2010-04-01/Accounts/{}/Messages.json", self.api_base, self.account_sid);
        let mut form: Vec<(&str, &str)> = vec![("To", to), ("From", from), ("Body", body)];
        if let Some(media) = media_url {
            form.push(("MediaUrl", media));
        }

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| http::transport_error("twilio", e))?;

        let status = response.status();
        if status.is_success() {
            let message: MessageResource = response
                .json()
                .await
                .map_err(|e| CoachcastError::channel(format!("Invalid Twilio response: {e}")))?;
            tracing::debug!("Twilio accepted {} ({:?})", message.sid, message.status);
            return Ok(message.sid);
        }

        let retry_after = http::retry_after_header(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(classify_twilio_error(status, &text, retry_after))
    }
}

/// Twilio error codes that name a recipient problem rather than a request problem.
fn classify_twilio_error(status: reqwest::StatusCode, text: &str, retry_after: Option<u64>) -> CoachcastError {
    let parsed: Option<TwilioErrorBody> = serde_json::from_str(text).ok();
    let code = parsed.as_ref().and_then(|b| b.code);
    let message = parsed
        .and_then(|b| b.message)
        .unwrap_or_else(|| text.to_string());

    match code {
        // Invalid 'To' number, not a mobile number, unreachable destination.
        Some(21211) | Some(21614) | Some(21408) => {
            CoachcastError::InvalidRecipient(format!("twilio {}: {message}", code.unwrap_or_default()))
        }
        // Recipient replied STOP.
        Some(21610) => CoachcastError::rejected(format!("twilio 21610: recipient unsubscribed ({message})")),
        // WhatsApp session window closed; needs an approved template.
        Some(63016) => CoachcastError::rejected(format!("twilio 63016: {message}")),
        _ => http::status_error("twilio", status, &message, retry_after),
    }
}

fn with_whatsapp_prefix(number: &str) -> String {
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{number}")
    }
}

/// SMS through Twilio.
pub struct SmsChannel {
    twilio: Arc<TwilioClient>,
    from: String,
}

impl SmsChannel {
    pub fn new(twilio: Arc<TwilioClient>, from: impl Into<String>) -> Self {
        Self { twilio, from: from.into() }
    }
}

#[async_trait]
impl DeliveryChannel for SmsChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Sms }

    fn name(&self) -> &str { "twilio-sms" }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let to = subscriber
            .address_for(ChannelKind::Sms)
            .ok_or_else(|| CoachcastError::InvalidRecipient(format!("{} has no phone number", subscriber.id)))?;
        let body = truncate_chars(&plain_text(notification), MAX_BODY_CHARS);
        let sid = self.twilio.send_message(&self.from, to, &body, None).await?;
        Ok(DeliveryReceipt::with_id(sid))
    }
}

/// WhatsApp through Twilio; attaches the audio as media when available.
pub struct WhatsAppChannel {
    twilio: Arc<TwilioClient>,
    from: String,
}

impl WhatsAppChannel {
    pub fn new(twilio: Arc<TwilioClient>, from: impl Into<String>) -> Self {
        Self { twilio, from: with_whatsapp_prefix(&from.into()) }
    }
}

#[async_trait]
impl DeliveryChannel for WhatsAppChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Whatsapp }

    fn name(&self) -> &str { "twilio-whatsapp" }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let phone = subscriber
            .address_for(ChannelKind::Whatsapp)
            .ok_or_else(|| CoachcastError::InvalidRecipient(format!("{} has no phone number", subscriber.id)))?;
        let to = with_whatsapp_prefix(phone);
        let body = truncate_chars(&plain_text(notification), MAX_BODY_CHARS);
        let sid = self
            .twilio
            .send_message(&self.from, &to, &body, notification.audio_url.as_deref())
            .await?;
        Ok(DeliveryReceipt::with_id(sid))
    }
}
