//! Strategy advisory client (Gemini `generateContent`).
//!
//! Consulted periodically for a short commentary on how the reverse follower is
//! doing against the leader. It never fails from the caller's point of view:
//! an unconfigured or unreachable service degrades to a static message.

use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub const UNCONFIGURED_ADVICE: &str =
    "Advisory offline: no API key configured. Set GEMINI_API_KEY and restart to enable strategy commentary.";
pub const UNAVAILABLE_ADVICE: &str =
    "Strategy desk is currently unreachable. Check network connectivity.";
pub const EMPTY_ADVICE: &str = "No analysis available.";

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory service not configured")]
    Unconfigured,

    #[error("advisory service unavailable: {0}")]
    Unavailable(String),
}

/// Client for the text-completion service.
pub struct AdvisoryClient {
    http: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    retry_budget: Duration,
}

impl AdvisoryClient {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_base_url(api_key, GEMINI_URL.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(api_key: Option<String>, base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: DEFAULT_MODEL.to_string(),
            base_url,
            retry_budget: Duration::from_secs(10),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Upper bound on time spent retrying transient failures.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Commentary for the current standings. Always returns displayable text.
    pub async fn advise(&self, leader_pnl: Decimal, follower_pnl: Decimal, price: Decimal) -> String {
        match self.request_advice(leader_pnl, follower_pnl, price).await {
            Ok(text) if text.trim().is_empty() => EMPTY_ADVICE.to_string(),
            Ok(text) => text.trim().to_string(),
            Err(AdvisoryError::Unconfigured) => UNCONFIGURED_ADVICE.to_string(),
            Err(e) => {
                warn!(error = %e, "Advisory request failed");
                UNAVAILABLE_ADVICE.to_string()
            }
        }
    }

    /// Raw request. Transient failures (transport, 429, 5xx) are retried
    /// within the retry budget.
    pub async fn request_advice(
        &self,
        leader_pnl: Decimal,
        follower_pnl: Decimal,
        price: Decimal,
    ) -> Result<String, AdvisoryError> {
        let key = self.api_key.as_deref().ok_or(AdvisoryError::Unconfigured)?;

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": build_prompt(leader_pnl, follower_pnl, price) }] }],
            "generationConfig": { "temperature": 0.7, "maxOutputTokens": 350 }
        });

        debug!(url = %url, "Requesting strategy advice");

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(self.retry_budget),
            ..ExponentialBackoff::default()
        };

        let http = &self.http;
        let url = url.as_str();
        let body = &body;

        let response: GenerateResponse = backoff::future::retry(policy, move || async move {
            let resp = http
                .post(url)
                .header("x-goog-api-key", key)
                .json(body)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(AdvisoryError::Unavailable(e.to_string())))?;

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(backoff::Error::transient(AdvisoryError::Unavailable(
                    status.to_string(),
                )));
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(AdvisoryError::Unavailable(format!(
                    "{} - {}",
                    status, text
                ))));
            }

            resp.json::<GenerateResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(AdvisoryError::Unavailable(e.to_string())))
        })
        .await?;

        Ok(response.text())
    }
}

/// Prompt describing the current standings.
pub fn build_prompt(leader_pnl: Decimal, follower_pnl: Decimal, price: Decimal) -> String {
    format!(
        "Current BTC market context:\n\
         - BTC price: ${:.2}\n\
         - Leader cumulative P&L: ${:.2}\n\
         - Follower (5x reverse copy) cumulative P&L: ${:.2}\n\n\
         Analyse how this reverse copy-trading strategy is performing in the current market. \
         Explain why the follower is gaining or losing relative to the leader. \
         Answer in plain, concise language for a beginner trader, under 150 words.",
        price, leader_pnl, follower_pnl
    )
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect::<String>())
            .unwrap_or_default()
    }
}
