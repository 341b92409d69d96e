//! Meeting-bot REST API seam.
//!
//! The lifecycle driver only talks to `BotApi`; `recall::RecallClient` is the
//! reqwest-backed implementation and tests substitute an in-process mock.

pub mod recall;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeline::StatusRecord;

pub use recall::RecallClient;

/// Network or decoding failure on any API call. Never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned HTTP {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response is missing a usable Date header")]
    MissingDate,
}

/// Result of `POST /bot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBot {
    pub id: String,
    /// Server clock at response time, from the `Date` header.
    pub server_date: DateTime<Utc>,
}

/// Body of `GET /bot/{id}`; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotDetails {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status_changes: Vec<StatusRecord>,
    #[serde(default)]
    pub video_url: Option<String>,
}

impl BotDetails {
    /// `video_url`, treating an empty string as absent.
    pub fn artifact_url(&self) -> Option<&str> {
        self.video_url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Operations the harness needs from the bot API.
#[async_trait::async_trait]
pub trait BotApi: Send + Sync {
    async fn create_bot(&self, body: &serde_json::Value) -> Result<CreatedBot, TransportError>;

    async fn get_bot(&self, bot_id: &str) -> Result<BotDetails, TransportError>;

    async fn leave_call(&self, bot_id: &str) -> Result<(), TransportError>;
}
