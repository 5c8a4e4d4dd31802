// ===============================
// src/messenger.rs
// ===============================
//
// Telegram Bot API:
// - connect() memanggil getMe untuk validasi token (gagal => worker gagal start).
// - send()    = sendMessage (parse_mode MarkdownV2), tanpa retry.
//
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("messaging request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("messaging service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("messaging service rejected the call: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, destination: &str, text: &str) -> Result<(), SendError>;

    async fn close(&self) {}
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
    result: Option<serde_json::Value>,
}

impl ApiResponse {
    fn into_result(self) -> Result<Option<serde_json::Value>, SendError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(SendError::Rejected(
                self.description.unwrap_or_else(|| "no description".to_string()),
            ))
        }
    }
}

#[derive(Clone, Debug)]
pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TelegramClient {
    /// Build the client and check the token with `getMe`.
    pub async fn connect(base_url: &str, token: &str, timeout: Duration) -> Result<Self, SendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let client = Self {
            http,
            endpoint: format!("{}/bot{}", base_url.trim_end_matches('/'), token),
        };

        let me = client.call("getMe", &json!({})).await?;
        let username = me
            .as_ref()
            .and_then(|v| v.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        info!(%username, "telegram session established");
        Ok(client)
    }

    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, SendError> {
        let rsp = self
            .http
            .post(format!("{}/{}", self.endpoint, method))
            .json(body)
            .send()
            .await?;

        let status = rsp.status();
        let text = rsp.text().await?;
        match serde_json::from_str::<ApiResponse>(&text) {
            Ok(api) => api.into_result(),
            Err(_) if !status.is_success() => {
                Err(SendError::Status { status: status.as_u16(), body: text })
            }
            Err(e) => Err(SendError::Rejected(format!("unreadable response: {e}"))),
        }
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send(&self, destination: &str, text: &str) -> Result<(), SendError> {
        let body = json!({
            "chat_id": destination,
            "text": text,
            "parse_mode": "MarkdownV2",
        });
        self.call("sendMessage", &body).await.map(|_| ())
    }
}
