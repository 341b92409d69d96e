use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, DATE};
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use super::{BotApi, BotDetails, CreatedBot, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.recall.ai/api/v1";

/// Longest error body kept in a `TransportError::Status`, in characters.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// reqwest client for the Recall.ai bot API.
#[derive(Debug, Clone)]
pub struct RecallClient {
    client: Client,
    base_url: String,
    auth_header: String,
}

#[derive(Deserialize)]
struct CreateBotResponse {
    id: String,
}

impl RecallClient {
    /// `auth_header` is sent verbatim as `Authorization`, e.g. `Token abc123`.
    pub fn new(
        base_url: impl Into<String>,
        auth_header: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: auth_header.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: &'static str,
        url: String,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError> {
        let request = match method {
            "POST" => self.client.post(&url),
            _ => self.client.get(&url),
        };
        let request = request
            .header(AUTHORIZATION, &self.auth_header)
            .header(CONTENT_TYPE, "application/json");
        let request = match body {
            Some(b) => request.json(b),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        debug!(%method, %url, status = status.as_u16(), "bot API response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                method,
                url,
                status: status.as_u16(),
                body: error_body(&body),
            });
        }
        Ok(response)
    }
}

/// Trimmed and capped at `MAX_ERROR_BODY_CHARS`.
fn error_body(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Parse the HTTP `Date` header (IMF-fixdate, e.g. `Wed, 01 May 2024 12:00:00 GMT`).
pub fn server_date(headers: &HeaderMap) -> Result<DateTime<Utc>, TransportError> {
    let raw = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .ok_or(TransportError::MissingDate)?;
    DateTime::parse_from_rfc2822(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| TransportError::MissingDate)
}

#[async_trait::async_trait]
impl BotApi for RecallClient {
    async fn create_bot(&self, body: &serde_json::Value) -> Result<CreatedBot, TransportError> {
        let response = self.send("POST", self.url("/bot"), Some(body)).await?;
        let server_date = server_date(response.headers())?;
        let bytes = response.bytes().await?;
        let created: CreateBotResponse = serde_json::from_slice(&bytes)?;
        Ok(CreatedBot {
            id: created.id,
            server_date,
        })
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotDetails, TransportError> {
        let response = self
            .send("GET", self.url(&format!("/bot/{bot_id}")), None)
            .await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn leave_call(&self, bot_id: &str) -> Result<(), TransportError> {
        let empty = serde_json::json!({});
        self.send("POST", self.url(&format!("/bot/{bot_id}/leave_call")), Some(&empty))
            .await?;
        Ok(())
    }
}
