//! Email channel: Resend or SendGrid over HTTP, or plain SMTP via lettre.

use async_trait::async_trait;
use coachcast_core::config::{EmailConfig, EmailProvider};
use coachcast_core::error::{CoachcastError, Result};
use coachcast_core::traits::DeliveryChannel;
use coachcast_core::types::{ChannelKind, DeliveryReceipt, Notification, Subscriber};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::http;
use crate::render::{email_html, plain_text};

const RESEND_API: &str = "https://api.resend.com";
const SENDGRID_API: &str = "https://api.sendgrid.com";

/// A rendered email ready for any provider.
struct Outgoing<'a> {
    to: &'a str,
    subject: &'a str,
    text: String,
    html: String,
}

pub struct EmailChannel {
    config: EmailConfig,
    client: reqwest::Client,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let smtp = match config.provider {
            EmailProvider::Smtp => Some(build_smtp(&config)?),
            _ => None,
        };
        Ok(Self { config, client: http::client(), smtp })
    }

    fn from_header(&self) -> String {
        match &self.config.from_name {
            Some(name) => format!("{name} <{}>", self.config.from),
            None => self.config.from.clone(),
        }
    }

    fn api_base(&self, default: &str) -> String {
        self.config
            .api_base
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    async fn send_resend(&self, mail: &Outgoing<'_>) -> Result<DeliveryReceipt> {
        let body = serde_json::json!({
            "from": self.from_header(),
            "to": [mail.to],
            "subject": mail.subject,
            "text": mail.text,
            "html": mail.html,
        });
        let response = self
            .client
            .post(format!("{}/emails", self.api_base(RESEND_API)))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error("resend", e))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await.unwrap_or_default();
            return Ok(DeliveryReceipt { provider_message_id: json["id"].as_str().map(String::from) });
        }
        let retry_after = http::retry_after_header(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(http::status_error("resend", status, &text, retry_after))
    }

    async fn send_sendgrid(&self, mail: &Outgoing<'_>) -> Result<DeliveryReceipt> {
        let mut from = serde_json::json!({ "email": self.config.from });
        if let Some(name) = &self.config.from_name {
            from["name"] = serde_json::Value::String(name.clone());
        }
        let body = serde_json::json!({
            "personalizations": [{ "to": [{ "email": mail.to }] }],
            "from": from,
            "subject": mail.subject,
            "content": [
                { "type": "text/plain", "value": mail.text },
                { "type": "text/html", "value": mail.html },
            ],
        });
        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.api_base(SENDGRID_API)))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error("sendgrid", e))?;

        let status = response.status();
        if status.is_success() {
            let id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            return Ok(DeliveryReceipt { provider_message_id: id });
        }
        let retry_after = http::retry_after_header(response.headers());
        let text = response.text().await.unwrap_or_default();
        Err(http::status_error("sendgrid", status, &text, retry_after))
    }

    async fn send_smtp(&self, mail: &Outgoing<'_>) -> Result<DeliveryReceipt> {
        let transport = self
            .smtp
            .as_ref()
            .ok_or_else(|| CoachcastError::ChannelNotConfigured("smtp transport".into()))?;

        let from: Mailbox = self
            .from_header()
            .parse()
            .map_err(|e| CoachcastError::config(format!("Invalid sender address: {e}")))?;
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|e| CoachcastError::InvalidRecipient(format!("{}: {e}", mail.to)))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject)
            .multipart(MultiPart::alternative_plain_html(mail.text.clone(), mail.html.clone()))
            .map_err(|e| CoachcastError::channel(format!("Build email: {e}")))?;

        let response = transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                CoachcastError::rejected(format!("smtp: {e}"))
            } else {
                CoachcastError::channel(format!("smtp: {e}"))
            }
        })?;
        let id = response.message().next().map(String::from);
        Ok(DeliveryReceipt { provider_message_id: id })
    }
}

fn build_smtp(config: &EmailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let host = config
        .smtp_host
        .as_deref()
        .ok_or_else(|| CoachcastError::config("channels.email.smtp_host is required for smtp"))?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        .map_err(|e| CoachcastError::config(format!("SMTP relay {host}: {e}")))?
        .port(config.smtp_port);
    if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn kind(&self) -> ChannelKind { ChannelKind::Email }

    fn name(&self) -> &str {
        match self.config.provider {
            EmailProvider::Resend => "resend",
            EmailProvider::Sendgrid => "sendgrid",
            EmailProvider::Smtp => "smtp",
        }
    }

    async fn deliver(&self, subscriber: &Subscriber, notification: &Notification) -> Result<DeliveryReceipt> {
        let to = subscriber
            .address_for(ChannelKind::Email)
            .ok_or_else(|| CoachcastError::InvalidRecipient(format!("{} has no email address", subscriber.id)))?;
        let mail = Outgoing {
            to,
            subject: &notification.title,
            text: plain_text(notification),
            html: email_html(notification),
        };

        match self.config.provider {
            EmailProvider::Resend => self.send_resend(&mail).await,
            EmailProvider::Sendgrid => self.send_sendgrid(&mail).await,
            EmailProvider::Smtp => self.send_smtp(&mail).await,
        }
    }
}
