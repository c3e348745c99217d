use super::Notifier;
use crate::config::TelegramConfig;
use crate::rate_limiter::RateLimiter;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Telegram Bot API notifier (HTML messages, link previews off)
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: i64,
    rate_limiter: RateLimiter,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Config("telegram.token is required".to_string()))?;
        let chat_id = config
            .chat_id
            .ok_or_else(|| Error::Config("telegram.chat_id is required".to_string()))?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.base_url.trim_end_matches('/'),
                token
            ),
            chat_id,
            rate_limiter: RateLimiter::new(config.messages_per_second, config.burst, timeout)?,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, message: &str) -> Result<()> {
        if let Err(e) = self.rate_limiter.acquire(1).await {
            tracing::error!(error = %e, "Telegram send message rate limited");
            return Err(e);
        }

        let request = SendMessageRequest {
            chat_id: self.chat_id,
            text: message,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        let body: TelegramResponse = response.json().await.map_err(|e| {
            Error::Notification(format!("unreadable telegram response ({}): {}", status, e))
        })?;

        if !status.is_success() || !body.ok {
            let description = body.description.unwrap_or_else(|| status.to_string());
            tracing::error!(status = %status, description = %description, "Telegram send message error");
            return Err(Error::Notification(description));
        }

        Ok(())
    }
}
