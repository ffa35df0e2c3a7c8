//! Storage capacity notifications

use crate::config::{NotificationConfig, TelegramConfig};
use crate::utils::mask_secret;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

/// What tripped the storage breaker
#[derive(Debug, Clone, Copy)]
pub struct ThresholdAlert<'a> {
    /// Volume that crossed the threshold
    pub volume_path: &'a Path,
    /// Current usage fraction
    pub usage_fraction: f64,
    /// Configured threshold fraction
    pub threshold_fraction: f64,
    /// Sentinel that now pauses ingestion
    pub pause_file: &'a Path,
}

impl ThresholdAlert<'_> {
    /// Plain-text operator message
    pub fn message(&self) -> String {
        format!(
            "Storage usage threshold reached.\nVolume: {}\nUsage: {:.2}% (threshold {:.2}%)\nPause sentinel: {}",
            self.volume_path.display(),
            self.usage_fraction * 100.0,
            self.threshold_fraction * 100.0,
            self.pause_file.display()
        )
    }
}

/// Observer told when storage crosses its threshold
#[async_trait]
pub trait StorageNotifier: Send + Sync {
    /// Deliver the alert
    async fn notify_threshold(&self, alert: &ThresholdAlert<'_>) -> Result<()>;

    /// Channel name used in logs
    fn name(&self) -> &'static str;
}

/// Telegram Bot API notifier
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    /// Notifier posting through `client`
    pub fn new(client: reqwest::Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    // reqwest errors embed the request URL, which holds the token
    fn redact(&self, text: &str) -> String {
        text.replace(&self.config.bot_token, &mask_secret(&self.config.bot_token))
    }
}

#[async_trait]
impl StorageNotifier for TelegramNotifier {
    async fn notify_threshold(&self, alert: &ThresholdAlert<'_>) -> Result<()> {
        let mut body = json!({
            "chat_id": self.config.chat_id,
            "text": alert.message(),
            "disable_notification": false,
            "disable_web_page_preview": true,
        });
        if let Some(thread_id) = self.config.thread_id {
            body["message_thread_id"] = json!(thread_id);
        }

        tracing::debug!(
            chat_id = %self.config.chat_id,
            thread_id = ?self.config.thread_id,
            "Sending Telegram storage alert"
        );
        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .timeout(TELEGRAM_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Telegram request failed: {}", self.redact(&e.to_string()))))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "Telegram API returned {}: {}",
                status,
                self.redact(&text)
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

/// Notifier for the configured channel, if any
pub fn notifier_from_config(
    config: &NotificationConfig,
    client: &reqwest::Client,
) -> Option<Arc<dyn StorageNotifier>> {
    let telegram = config.telegram.as_ref()?;
    if telegram.bot_token.trim().is_empty() || telegram.chat_id.trim().is_empty() {
        tracing::warn!("Telegram notifications configured without token or chat id; disabled");
        return None;
    }
    tracing::info!(
        token = %mask_secret(&telegram.bot_token),
        chat_id = %telegram.chat_id,
        "Storage alerts go to Telegram"
    );
    Some(Arc::new(TelegramNotifier::new(client.clone(), telegram.clone())))
}
