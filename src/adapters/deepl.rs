//! DeepL usage probe.
//!
//! Free-tier secrets (`:fx` suffix) go to the free endpoint, everything
//! else to the pro endpoint. Pro answers carry key-scoped counters and a
//! billing window on top of the account counters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

use super::{
    mask_secret, parse_timestamp, ApiType, ProbeFailure, ProbeResult, UsageProbe, UsageReport,
};

pub const DEFAULT_FREE_BASE_URL: &str = "https://api-free.deepl.com/v2";
pub const DEFAULT_PRO_BASE_URL: &str = "https://api.deepl.com/v2";

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Raw `/usage` response body.
#[derive(Debug, Deserialize)]
struct UsageBody {
    #[serde(default)]
    character_count: Option<i64>,
    #[serde(default)]
    character_limit: Option<i64>,
    #[serde(default)]
    api_key_character_count: Option<i64>,
    #[serde(default)]
    api_key_character_limit: Option<i64>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

pub struct DeepLProbe {
    client: reqwest::Client,
    free_base_url: String,
    pro_base_url: String,
}

impl DeepLProbe {
    /// Build a probe whose every request is bounded by `timeout`.
    pub fn new(free_base_url: &str, pro_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            free_base_url: free_base_url.trim_end_matches('/').to_string(),
            pro_base_url: pro_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn usage_url(&self, api_type: ApiType) -> String {
        let base = match api_type {
            ApiType::Free => &self.free_base_url,
            ApiType::Pro => &self.pro_base_url,
        };
        format!("{}/usage", base)
    }

    async fn fetch(&self, secret: &str, api_type: ApiType) -> Result<UsageReport, ProbeFailure> {
        let resp = self.client
            .get(self.usage_url(api_type))
            .header(AUTHORIZATION, format!("DeepL-Auth-Key {}", secret))
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(parse_error_response(status.as_u16(), &body));
        }

        let parsed: UsageBody = serde_json::from_str(&body)
            .map_err(|e| ProbeFailure::Unexpected(format!("invalid usage response: {}", e)))?;
        Ok(into_report(parsed, api_type))
    }
}

#[async_trait]
impl UsageProbe for DeepLProbe {
    fn provider_id(&self) -> &str { "deepl" }

    async fn probe(&self, secret: &str) -> ProbeResult {
        let api_type = ApiType::from_secret(secret);
        info!(key = %mask_secret(secret), api_type = api_type.as_str(), "Querying usage");

        match self.fetch(secret, api_type).await {
            Ok(report) => {
                info!(
                    key = %mask_secret(secret),
                    count = report.character_count,
                    limit = report.character_limit,
                    "Usage query succeeded"
                );
                ProbeResult::success(report)
            }
            Err(failure) => {
                error!(key = %mask_secret(secret), "Usage query failed: {}", failure);
                ProbeResult::failure(failure)
            }
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ProbeFailure {
    if e.is_timeout() {
        ProbeFailure::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        ProbeFailure::Transport(e.to_string())
    } else {
        ProbeFailure::Unexpected(e.to_string())
    }
}

fn into_report(body: UsageBody, api_type: ApiType) -> UsageReport {
    let mut report = UsageReport {
        api_type,
        character_count: body.character_count.unwrap_or(0).max(0),
        character_limit: body.character_limit.unwrap_or(0).max(0),
        key_character_count: None,
        key_character_limit: None,
        billing_start: None,
        billing_end: None,
    };

    if api_type == ApiType::Pro {
        report.key_character_count = body.api_key_character_count;
        report.key_character_limit = body.api_key_character_limit.map(|l| l.max(0));
        report.billing_start = parse_timestamp(body.start_time.as_deref());
        report.billing_end = parse_timestamp(body.end_time.as_deref());
    }

    report
}

/// Parse a non-2xx body into a classified failure. Prefers the JSON
/// `message` field, falls back to the raw text.
pub(crate) fn parse_error_response(status: u16, body: &str) -> ProbeFailure {
    let body = body.trim();
    let message = if body.is_empty() {
        None
    } else {
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
        let text = parsed["message"].as_str().unwrap_or(body);
        Some(text.chars().take(MAX_ERROR_MESSAGE_CHARS).collect())
    };
    ProbeFailure::HttpStatus { status, message }
}
