//! Telegram Bot API channel

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ChartImage, NotificationChannel};
use crate::error::{DetectorError, Result};

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub token: String,
    /// API root, overridable for tests
    pub api_base: String,
    pub timeout: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends the alert text, then the chart as a photo
pub struct TelegramChannel {
    client: Client,
    bot_url: Url,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(DetectorError::configuration("Telegram bot token is empty"));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DetectorError::delivery(format!("failed to create HTTP client: {}", e)))?;

        let bot_url = Url::parse(&format!(
            "{}/bot{}/",
            config.api_base.trim_end_matches('/'),
            config.token
        ))
        .map_err(|e| DetectorError::configuration(format!("invalid Telegram API base: {}", e)))?;

        Ok(Self { client, bot_url })
    }

    fn method_url(&self, method: &str) -> Result<Url> {
        self.bot_url
            .join(method)
            .map_err(|e| DetectorError::configuration(format!("invalid Telegram method '{}': {}", method, e)))
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("sendMessage")?)
            .form(&[("chat_id", chat_id), ("text", text)])
            .send()
            .await
            .map_err(|e| DetectorError::delivery(format!("sendMessage failed: {}", e)))?;
        check_response("sendMessage", response).await
    }

    async fn send_photo(&self, chat_id: &str, image: ChartImage) -> Result<()> {
        let photo = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str("image/png")
            .map_err(|e| DetectorError::delivery(format!("invalid photo part: {}", e)))?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", photo);

        let response = self
            .client
            .post(self.method_url("sendPhoto")?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DetectorError::delivery(format!("sendPhoto failed: {}", e)))?;
        check_response("sendPhoto", response).await
    }
}

/// Non-2xx statuses and `"ok": false` bodies are delivery failures
async fn check_response(method: &str, response: Response) -> Result<()> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(DetectorError::delivery(format!(
            "{} returned {}: {}",
            method,
            status,
            body.trim()
        )));
    }

    let parsed: ApiResponse = serde_json::from_str(&body).map_err(|e| {
        DetectorError::delivery(format!("{} returned malformed body: {}", method, e))
    })?;
    if !parsed.ok {
        return Err(DetectorError::delivery(format!(
            "{} rejected: {}",
            method,
            parsed.description.unwrap_or_else(|| "no description".to_string())
        )));
    }

    debug!(method = %method, "Telegram request delivered");
    Ok(())
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    async fn send(&self, target: &str, text: &str, image: Option<ChartImage>) -> Result<()> {
        self.send_message(target, text).await?;
        if let Some(image) = image {
            self.send_photo(target, image).await?;
        }
        Ok(())
    }
}
