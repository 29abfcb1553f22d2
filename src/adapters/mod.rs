//! Usage probe trait, a provider-agnostic interface to a usage-metering
//! endpoint.
//!
//! A probe performs exactly one network call per invocation and never
//! fails outright: transport problems, timeouts and non-2xx answers are
//! folded into a [`ProbeOutcome::Failure`] so the caller always has
//! something to record.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod deepl;

/// Secrets ending with this marker belong to the free tier.
pub const FREE_SUFFIX: &str = ":fx";

// ── Core Types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Free,
    Pro,
}

impl ApiType {
    /// Derive the credential type from its secret. Total and deterministic.
    pub fn from_secret(secret: &str) -> Self {
        if secret.ends_with(FREE_SUFFIX) {
            ApiType::Free
        } else {
            ApiType::Pro
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Free => "free",
            ApiType::Pro => "pro",
        }
    }

    /// Parse the stored column value; anything unknown is treated as pro.
    pub fn from_column(s: &str) -> Self {
        match s {
            "free" => ApiType::Free,
            _ => ApiType::Pro,
        }
    }
}

/// Normalized usage figures from a successful probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub api_type: ApiType,
    pub character_count: i64,
    pub character_limit: i64,
    /// Pro only: usage scoped to this specific key.
    pub key_character_count: Option<i64>,
    pub key_character_limit: Option<i64>,
    /// Pro only: current billing window.
    pub billing_start: Option<DateTime<Utc>>,
    pub billing_end: Option<DateTime<Utc>>,
}

/// Classified cause of a failed probe.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProbeFailure {
    #[error("request timeout")]
    Timeout,
    #[error("network error: {0}")]
    Transport(String),
    #[error("API request failed: HTTP {status}{}", message_suffix(.message))]
    HttpStatus {
        status: u16,
        message: Option<String>,
    },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(" - {}", m),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Success(UsageReport),
    Failure(ProbeFailure),
}

/// One probe invocation: the outcome plus the moment it was checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub checked_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn success(report: UsageReport) -> Self {
        Self { checked_at: Utc::now(), outcome: ProbeOutcome::Success(report) }
    }

    pub fn failure(failure: ProbeFailure) -> Self {
        Self { checked_at: Utc::now(), outcome: ProbeOutcome::Failure(failure) }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success(_))
    }
}

// ── Probe Trait ─────────────────────────────────────────────────────

/// The usage probe trait.
///
/// Implementations must not store or log the secret in full, and must
/// bound every call with a timeout.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    /// Unique provider identifier (e.g., "deepl").
    fn provider_id(&self) -> &str;

    /// Query the usage endpoint once for `secret`.
    async fn probe(&self, secret: &str) -> ProbeResult;
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse an ISO-8601 timestamp into UTC.
///
/// Offsets are converted, a trailing `Z` or a missing offset means UTC.
/// Anything unparseable yields `None` rather than an error.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Mask a secret for logs: "abcd1234efgh5678" → "abcd...5678"
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        let head: String = chars.iter().take(4).collect();
        return format!("{}...", head);
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_api_type_from_suffix() {
        assert_eq!(ApiType::from_secret("abc123:fx"), ApiType::Free);
        assert_eq!(ApiType::from_secret("abc123"), ApiType::Pro);
        assert_eq!(ApiType::from_secret(""), ApiType::Pro);
        assert_eq!(ApiType::from_secret(":fx"), ApiType::Free);
        // Marker must be the suffix, not merely present
        assert_eq!(ApiType::from_secret("abc:fx123"), ApiType::Pro);
        assert_eq!(ApiType::from_secret("abc:FX"), ApiType::Pro);
    }

    #[test]
    fn test_api_type_column_roundtrip() {
        for t in [ApiType::Free, ApiType::Pro] {
            assert_eq!(ApiType::from_column(t.as_str()), t);
        }
    }

    #[test]
    fn test_parse_timestamp_utc_marker() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some("2024-01-01T00:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(Some("2024-01-01T00:00:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("2024-01-01T00:00:00.000Z")), Some(expected));
    }

    #[test]
    fn test_parse_timestamp_offset_normalized() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some("2024-01-01T02:00:00+02:00")), Some(expected));
    }

    #[test]
    fn test_parse_timestamp_malformed_is_none() {
        assert_eq!(parse_timestamp(None), None);
        assert_eq!(parse_timestamp(Some("")), None);
        assert_eq!(parse_timestamp(Some("not a date")), None);
        assert_eq!(parse_timestamp(Some("2024-13-45T99:00:00Z")), None);
    }

    #[test]
    fn test_failure_messages() {
        assert!(ProbeFailure::Timeout.to_string().contains("timeout"));
        assert_eq!(
            ProbeFailure::HttpStatus { status: 403, message: Some("Forbidden".into()) }.to_string(),
            "API request failed: HTTP 403 - Forbidden"
        );
        assert_eq!(
            ProbeFailure::HttpStatus { status: 456, message: None }.to_string(),
            "API request failed: HTTP 456"
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abcd1234efgh5678"), "abcd...5678");
        assert_eq!(mask_secret("short"), "shor...");
        assert!(!mask_secret("0123456789abcdef:fx").contains("456789ab"));
    }
}
