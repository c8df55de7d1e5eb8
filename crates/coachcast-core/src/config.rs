//! Configuration: `~/.coachcast/config.toml` plus environment overrides for secrets.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoachcastError, Result};
use crate::types::QuietHours;

const SECS_PER_DAY: u64 = 86_400;
const MINS_PER_DAY: u64 = 1_440;
const MAX_RETENTION_DAYS: u64 = 3_650;
const MAX_RETRY_DELAY_SECS: u64 = 7 * SECS_PER_DAY;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoachcastConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Default quiet window; a subscriber's own window takes precedence.
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Public web app URL, used for library links in notifications.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Fallback for subscribers whose timezone does not parse.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

fn default_app_name() -> String { "Coachcast".into() }
fn default_base_url() -> String { "http://localhost:3000".into() }
fn default_timezone() -> String { "UTC".into() }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            base_url: default_base_url(),
            default_timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.coachcast/coachcast.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Cron loop and queue worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Enqueue jobs this far ahead of their delivery instant.
    #[serde(default)]
    pub lookahead_secs: u64,
    /// Deliveries missed by more than this are not enqueued.
    #[serde(default = "default_max_lateness")]
    pub max_lateness_mins: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Claims older than this are treated as abandoned and released.
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_secs: u64,
    /// How long to wait for daily content before failing the job.
    #[serde(default = "default_content_wait")]
    pub content_wait_mins: u64,
    #[serde(default = "default_content_retry")]
    pub content_retry_secs: u64,
    #[serde(default = "default_purge_after")]
    pub purge_after_days: u64,
}

fn default_tick_interval() -> u64 { 60 }
fn default_max_lateness() -> u64 { 180 }
fn default_batch_size() -> usize { 50 }
fn default_concurrency() -> usize { 8 }
fn default_processing_timeout() -> u64 { 600 }
fn default_content_wait() -> u64 { 120 }
fn default_content_retry() -> u64 { 300 }
fn default_purge_after() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            lookahead_secs: 0,
            max_lateness_mins: default_max_lateness(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            processing_timeout_secs: default_processing_timeout(),
            content_wait_mins: default_content_wait(),
            content_retry_secs: default_content_retry(),
            purge_after_days: default_purge_after(),
        }
    }
}

/// Per-channel retry counter and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_channel: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Down-jitter fraction, 0.0..=1.0.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 60 }
fn default_max_delay() -> u64 { 3600 }
fn default_jitter() -> f64 { 0.2 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_channel: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub twilio: Option<TwilioConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub push: Option<PushConfig>,
    #[serde(default)]
    pub in_app: InAppConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    #[default]
    Resend,
    Sendgrid,
    Smtp,
}

impl std::fmt::Display for EmailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailProvider::Resend => write!(f, "resend"),
            EmailProvider::Sendgrid => write!(f, "sendgrid"),
            EmailProvider::Smtp => write!(f, "smtp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub provider: EmailProvider,
    /// API key for Resend / SendGrid.
    #[serde(default)]
    pub api_key: String,
    pub from: String,
    #[serde(default)]
    pub from_name: Option<String>,
    /// Override the provider API root (self-hosted relays, tests).
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_smtp_port() -> u16 { 587 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Sender number for SMS; SMS is disabled when unset.
    #[serde(default)]
    pub sms_from: Option<String>,
    /// Sender number for WhatsApp; WhatsApp is disabled when unset.
    #[serde(default)]
    pub whatsapp_from: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` on webhook calls.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Also send the audio file after the text message.
    #[serde(default = "default_true")]
    pub send_audio: bool,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Push relay. The relay holds VAPID keys and performs web-push encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on `/api/*` when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8787 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
        }
    }
}

impl CoachcastConfig {
    /// Coachcast home directory (`$COACHCAST_HOME` or `~/.coachcast`).
    pub fn home_dir() -> PathBuf {
        if let Ok(home) = std::env::var("COACHCAST_HOME") {
            return PathBuf::from(shellexpand::tilde(&home).to_string());
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".coachcast")
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Load from the default path; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::parse_file(&path)?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CoachcastError::ConfigNotFound(path.display().to_string()));
        }
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoachcastError::config(format!("Invalid config: {e}")))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoachcastError::config(format!("Serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Fill secrets from a lookup, usually the process environment.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("COACHCAST_DB_PATH") {
            self.database.path = path;
        }
        if let Some(token) = lookup("COACHCAST_API_TOKEN") {
            self.gateway.api_token = Some(token);
        }
        if let (Some(email), Some(key)) = (self.channels.email.as_mut(), lookup("COACHCAST_EMAIL_API_KEY")) {
            email.api_key = key;
        }
        if let (Some(twilio), Some(token)) = (self.channels.twilio.as_mut(), lookup("COACHCAST_TWILIO_AUTH_TOKEN")) {
            twilio.auth_token = token;
        }
        if let (Some(telegram), Some(token)) = (self.channels.telegram.as_mut(), lookup("COACHCAST_TELEGRAM_BOT_TOKEN")) {
            telegram.bot_token = token;
        }
        if let (Some(push), Some(token)) = (self.channels.push.as_mut(), lookup("COACHCAST_PUSH_TOKEN")) {
            push.token = Some(token);
        }
    }

    /// Reject settings the scheduler cannot run with.
    /// Reject values the scheduler cannot run with. Durations are bounded so
    /// they always convert to `chrono::Duration`.
    pub fn validate(&self) -> Result<()> {
        if self.app.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(CoachcastError::InvalidTimezone(self.app.default_timezone.clone()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(CoachcastError::config("scheduler.batch_size must be > 0"));
        }
        if self.scheduler.concurrency == 0 {
            return Err(CoachcastError::config("scheduler.concurrency must be > 0"));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(CoachcastError::config("scheduler.tick_interval_secs must be > 0"));
        }
        if self.retry.max_attempts_per_channel == 0 {
            return Err(CoachcastError::config("retry.max_attempts_per_channel must be > 0"));
        }
        let s = &self.scheduler;
        let r = &self.retry;
        for (name, value, max) in [
            ("scheduler.tick_interval_secs", s.tick_interval_secs, SECS_PER_DAY),
            ("scheduler.lookahead_secs", s.lookahead_secs, SECS_PER_DAY),
            ("scheduler.max_lateness_mins", s.max_lateness_mins, MINS_PER_DAY),
            ("scheduler.processing_timeout_secs", s.processing_timeout_secs, SECS_PER_DAY),
            ("scheduler.content_wait_mins", s.content_wait_mins, MINS_PER_DAY),
            ("scheduler.content_retry_secs", s.content_retry_secs, SECS_PER_DAY),
            ("scheduler.purge_after_days", s.purge_after_days, MAX_RETENTION_DAYS),
            ("retry.base_delay_secs", r.base_delay_secs, MAX_RETRY_DELAY_SECS),
            ("retry.max_delay_secs", r.max_delay_secs, MAX_RETRY_DELAY_SECS),
        ] {
            if value > max {
                return Err(CoachcastError::config(format!("{name} must be <= {max}, got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CoachcastError::config("retry.jitter must be within 0.0..=1.0"));
        }
        if let Some(email) = &self.channels.email {
            if email.provider == EmailProvider::Smtp && email.smtp_host.is_none() {
                return Err(CoachcastError::config("channels.email.smtp_host is required for smtp"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoachcastConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.retry.max_attempts_per_channel, 3);
        assert!(config.channels.in_app.enabled);
        assert!(config.channels.email.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = CoachcastConfig::from_toml(
            r#"
            [app]
            base_url = "https://coach.example.com"
            default_timezone = "Europe/Berlin"

            [quiet_hours]
            start = "22:00"
            end = "07:30"

            [channels.twilio]
            account_sid = "AC123"
            sms_from = "+15550001111"

            [channels.email]
            provider = "sendgrid"
            from = "coach@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.app.name, "Coachcast");
        assert_eq!(config.app.default_timezone, "Europe/Berlin");
        let quiet = config.quiet_hours.unwrap();
        assert_eq!(quiet.to_string(), "22:00-07:30");
        let twilio = config.channels.twilio.as_ref().unwrap();
        assert!(twilio.whatsapp_from.is_none());
        assert_eq!(config.channels.email.as_ref().unwrap().provider, EmailProvider::Sendgrid);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CoachcastConfig::default();
        config.gateway.port = 9100;
        config.quiet_hours = QuietHours::parse_range("23:00-06:00");
        config.save_to(&path).unwrap();

        let loaded = CoachcastConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 9100);
        assert_eq!(loaded.quiet_hours, config.quiet_hours);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = CoachcastConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, CoachcastError::ConfigNotFound(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CoachcastConfig::default();
        config.app.default_timezone = "Mars/Olympus".into();
        assert!(matches!(config.validate(), Err(CoachcastError::InvalidTimezone(_))));

        let mut config = CoachcastConfig::default();
        config.retry.max_attempts_per_channel = 0;
        assert!(config.validate().is_err());

        let mut config = CoachcastConfig::default();
        config.scheduler.purge_after_days = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("scheduler.purge_after_days"), "{err}");

        let mut config = CoachcastConfig::default();
        config.retry.max_delay_secs = u64::MAX;
        assert!(config.validate().is_err());
        config.retry.max_delay_secs = 7 * 86_400;
        assert!(config.validate().is_ok());

        let mut config = CoachcastConfig::default();
        config.channels.email = Some(EmailConfig {
            provider: EmailProvider::Smtp,
            api_key: String::new(),
            from: "a@b.c".into(),
            from_name: None,
            api_base: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            enabled: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_only_touch_configured_channels() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("COACHCAST_TELEGRAM_BOT_TOKEN", "123:abc"),
            ("COACHCAST_TWILIO_AUTH_TOKEN", "secret"),
            ("COACHCAST_API_TOKEN", "api"),
        ]);
        let mut config = CoachcastConfig::from_toml(
            r#"
            [channels.telegram]
            send_audio = false
            "#,
        )
        .unwrap();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.channels.telegram.as_ref().unwrap().bot_token, "123:abc");
        assert!(config.channels.twilio.is_none());
        assert_eq!(config.gateway.api_token.as_deref(), Some("api"));
    }
}
