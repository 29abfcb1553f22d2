//! Row types for groups, credentials and usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::{ApiType, ProbeOutcome, ProbeResult};

/// A named collection of credentials sharing one polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    /// Seconds between polls; must be > 0 for the group to be scheduled.
    pub query_interval: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_schedulable(&self) -> bool {
        self.is_active && self.query_interval > 0
    }
}

/// One monitored secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub api_type: ApiType,
    pub group_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub billing_start: Option<DateTime<Utc>>,
    pub billing_end: Option<DateTime<Utc>>,
}

impl Credential {
    /// A pro credential whose billing window has already closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.api_type == ApiType::Pro && self.billing_end.map_or(false, |end| now > end)
    }
}

/// An immutable usage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub credential_id: i64,
    pub checked_at: DateTime<Utc>,
    pub character_count: i64,
    pub character_limit: i64,
    pub key_character_count: Option<i64>,
    pub key_character_limit: Option<i64>,
    pub billing_start: Option<DateTime<Utc>>,
    pub billing_end: Option<DateTime<Utc>>,
    pub is_success: bool,
    pub error_message: Option<String>,
}

impl UsageRecord {
    pub fn usage_percentage(&self) -> f64 {
        usage_percentage(self.character_count, self.character_limit)
    }
}

/// `count / limit * 100`, or 0 when there is no limit.
pub fn usage_percentage(count: i64, limit: i64) -> f64 {
    if limit > 0 {
        count as f64 / limit as f64 * 100.0
    } else {
        0.0
    }
}

/// A usage record that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUsageRecord {
    pub credential_id: i64,
    pub checked_at: DateTime<Utc>,
    pub character_count: i64,
    pub character_limit: i64,
    pub key_character_count: Option<i64>,
    pub key_character_limit: Option<i64>,
    pub billing_start: Option<DateTime<Utc>>,
    pub billing_end: Option<DateTime<Utc>>,
    pub is_success: bool,
    pub error_message: Option<String>,
}

impl NewUsageRecord {
    /// Build the row for a probe result. Failures get zero counters.
    pub fn from_probe(credential_id: i64, result: &ProbeResult) -> Self {
        match &result.outcome {
            ProbeOutcome::Success(report) => Self {
                credential_id,
                checked_at: result.checked_at,
                character_count: report.character_count,
                character_limit: report.character_limit.max(0),
                key_character_count: report.key_character_count,
                key_character_limit: report.key_character_limit,
                billing_start: report.billing_start,
                billing_end: report.billing_end,
                is_success: true,
                error_message: None,
            },
            ProbeOutcome::Failure(failure) => {
                Self::failed(credential_id, result.checked_at, failure.to_string())
            }
        }
    }

    pub fn failed(credential_id: i64, checked_at: DateTime<Utc>, message: String) -> Self {
        Self {
            credential_id,
            checked_at,
            character_count: 0,
            character_limit: 0,
            key_character_count: None,
            key_character_limit: None,
            billing_start: None,
            billing_end: None,
            is_success: false,
            error_message: Some(message),
        }
    }
}

/// Per-credential mutation applied alongside the records of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialCheck {
    pub credential_id: i64,
    pub checked_at: DateTime<Utc>,
    /// `(start, end)` to overwrite the stored billing window with.
    pub billing_window: Option<(DateTime<Utc>, Option<DateTime<Utc>>)>,
}

impl CredentialCheck {
    pub fn from_probe(credential: &Credential, result: &ProbeResult) -> Self {
        let billing_window = match &result.outcome {
            ProbeOutcome::Success(report) if credential.api_type == ApiType::Pro => {
                report.billing_start.map(|start| (start, report.billing_end))
            }
            _ => None,
        };
        Self { credential_id: credential.id, checked_at: result.checked_at, billing_window }
    }
}

/// Everything one group poll writes, committed as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub records: Vec<NewUsageRecord>,
    pub checks: Vec<CredentialCheck>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ProbeFailure, UsageReport};
    use chrono::{Duration, TimeZone};

    fn pro_credential() -> Credential {
        Credential {
            id: 7,
            name: "pro".into(),
            secret: "pro-secret-123".into(),
            api_type: ApiType::Pro,
            group_id: 1,
            is_active: true,
            created_at: Utc::now(),
            last_check: None,
            billing_start: None,
            billing_end: None,
        }
    }

    #[test]
    fn test_usage_percentage_zero_limit() {
        assert_eq!(usage_percentage(0, 0), 0.0);
        assert_eq!(usage_percentage(12345, 0), 0.0);
        assert!((usage_percentage(500, 500_000) - 0.1).abs() < 1e-9);
        assert!(!usage_percentage(1, 0).is_nan());
    }

    #[test]
    fn test_failed_probe_yields_zeroed_row() {
        let result = ProbeResult::failure(ProbeFailure::Timeout);
        let row = NewUsageRecord::from_probe(3, &result);
        assert!(!row.is_success);
        assert_eq!(row.character_count, 0);
        assert_eq!(row.character_limit, 0);
        assert!(row.error_message.unwrap().contains("timeout"));
        assert_eq!(row.checked_at, result.checked_at);
    }

    #[test]
    fn test_pro_check_overwrites_billing_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let result = ProbeResult::success(UsageReport {
            api_type: ApiType::Pro,
            character_count: 10,
            character_limit: 100,
            key_character_count: Some(1),
            key_character_limit: Some(10),
            billing_start: Some(start),
            billing_end: Some(end),
        });

        let check = CredentialCheck::from_probe(&pro_credential(), &result);
        assert_eq!(check.billing_window, Some((start, Some(end))));

        // No start → keep the stored window
        let result = ProbeResult::success(UsageReport {
            api_type: ApiType::Pro,
            character_count: 10,
            character_limit: 100,
            key_character_count: None,
            key_character_limit: None,
            billing_start: None,
            billing_end: Some(end),
        });
        assert_eq!(CredentialCheck::from_probe(&pro_credential(), &result).billing_window, None);
    }

    #[test]
    fn test_is_expired_only_for_pro() {
        let now = Utc::now();
        let mut cred = pro_credential();
        assert!(!cred.is_expired(now));
        cred.billing_end = Some(now - Duration::days(1));
        assert!(cred.is_expired(now));
        cred.api_type = ApiType::Free;
        assert!(!cred.is_expired(now));
    }
}
