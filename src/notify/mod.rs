//! Replication notifications: log, Slack-style webhook and Telegram sinks.
//!
//! Notifiers are fire-and-forget. A sink that cannot deliver logs the failure
//! and moves on; nothing here can influence replication state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::NotificationConfig;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReplicationOpened,
    ReplicationFailed,
    ReplicationClosed,
    CloseFailed,
    ModifyFailed,
    CircuitStateChanged,
    StalenessWarning,
    AuthenticationFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReplicationOpened => "replication_opened",
            NotificationKind::ReplicationFailed => "replication_failed",
            NotificationKind::ReplicationClosed => "replication_closed",
            NotificationKind::CloseFailed => "close_failed",
            NotificationKind::ModifyFailed => "modify_failed",
            NotificationKind::CircuitStateChanged => "circuit_state_changed",
            NotificationKind::StalenessWarning => "staleness_warning",
            NotificationKind::AuthenticationFailed => "authentication_failed",
        }
    }

    /// Whether an operator should look at this.
    pub fn needs_attention(&self) -> bool {
        !matches!(
            self,
            NotificationKind::ReplicationOpened | NotificationKind::ReplicationClosed
        )
    }
}

/// A single notification event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub source_position_id: Option<String>,
    pub destination_account_id: Option<String>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, detail: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source_position_id: None,
            destination_account_id: None,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    pub fn position(mut self, id: &str) -> Self {
        self.source_position_id = Some(id.to_string());
        self
    }

    pub fn account(mut self, id: &str) -> Self {
        self.destination_account_id = Some(id.to_string());
        self
    }

    /// One-line human readable form used by chat sinks.
    pub fn render(&self) -> String {
        let mut text = format!("[{}]", self.kind.as_str());
        if let Some(p) = &self.source_position_id {
            text.push_str(&format!(" position={}", p));
        }
        if let Some(a) = &self.destination_account_id {
            text.push_str(&format!(" account={}", a));
        }
        text.push(' ');
        text.push_str(&self.detail);
        text.push_str(&format!(
            " (at {}, id {})",
            self.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.id
        ));
        text
    }
}

/// Notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Notification);
}

/// Emits every notification as a tracing event.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Notification) {
        let position = event.source_position_id.as_deref().unwrap_or("-");
        let account = event.destination_account_id.as_deref().unwrap_or("-");

        if event.kind.needs_attention() {
            warn!(
                id = %event.id,
                at = %event.at.to_rfc3339(),
                kind = event.kind.as_str(),
                position = %position,
                account = %account,
                detail = %event.detail,
                "Notification"
            );
        } else {
            info!(
                id = %event.id,
                at = %event.at.to_rfc3339(),
                kind = event.kind.as_str(),
                position = %position,
                account = %account,
                detail = %event.detail,
                "Notification"
            );
        }
    }
}

/// Posts `{"text": ...}` to a Slack-compatible incoming webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: Notification) {
        let http = self.http.clone();
        let url = self.url.clone();
        let payload = serde_json::json!({ "text": event.render() });

        tokio::spawn(async move {
            match http.post(&url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    error!(status = %resp.status(), "Webhook notification rejected");
                }
                Err(e) => error!(error = %e, "Webhook notification failed"),
                Ok(_) => {}
            }
        });
    }
}

/// Sends notifications through the Telegram bot API.
pub struct TelegramNotifier {
    http: Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: Client, token: String, chat_id: String) -> Self {
        Self {
            http,
            token,
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: Notification) {
        let http = self.http.clone();
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let payload = serde_json::json!({ "chat_id": self.chat_id, "text": event.render() });

        tokio::spawn(async move {
            if let Err(e) = http.post(&url).json(&payload).send().await {
                error!(error = %e, "Telegram notification failed");
            }
        });
    }
}

/// Delivers each notification to every configured sink.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    /// Log sink plus whatever remote sinks the config enables.
    pub fn from_config(config: &NotificationConfig) -> anyhow::Result<Self> {
        let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];

        if !config.enabled {
            return Ok(Self::new(sinks));
        }

        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;

        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(WebhookNotifier::new(http.clone(), url.clone())));
        }
        if let (Some(token), Some(chat)) = (&config.telegram_bot_token, &config.telegram_chat_id) {
            sinks.push(Arc::new(TelegramNotifier::new(
                http.clone(),
                token.clone(),
                chat.clone(),
            )));
        }

        Ok(Self::new(sinks))
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: Notification) {
        for sink in &self.sinks {
            sink.notify(event.clone()).await;
        }
    }
}
