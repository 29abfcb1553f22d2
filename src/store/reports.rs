//! Read-side queries for display: latest usage, history, summary.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::models::usage_percentage;
use super::{fmt_ts, row_to_record, Credential, Store, UsageRecord, RECORD_COLUMNS};
use crate::adapters::ApiType;

/// Count / limit pair as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectiveUsage {
    pub character_count: i64,
    pub character_limit: i64,
    pub usage_percentage: f64,
}

impl EffectiveUsage {
    /// Pro credentials report their key-scoped pair when the record has one.
    pub fn of(api_type: ApiType, record: &UsageRecord) -> Self {
        let (count, limit) = match (api_type, record.key_character_count) {
            (ApiType::Pro, Some(count)) => (count, record.key_character_limit.unwrap_or(0)),
            _ => (record.character_count, record.character_limit),
        };
        Self { character_count: count, character_limit: limit, usage_percentage: usage_percentage(count, limit) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: UsageRecord,
    pub usage_percentage: f64,
}

impl From<UsageRecord> for RecordView {
    fn from(record: UsageRecord) -> Self {
        let usage_percentage = record.usage_percentage();
        Self { record, usage_percentage }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestUsage {
    #[serde(flatten)]
    pub record: RecordView,
    pub effective: EffectiveUsage,
}

/// Full description of one credential.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub api_type: ApiType,
    pub group_id: i64,
    pub is_active: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub billing_start_time: Option<DateTime<Utc>>,
    pub billing_end_time: Option<DateTime<Utc>>,
    pub latest_usage: Option<LatestUsage>,
}

/// Per-day rollup of a credential's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsage {
    pub date: String,
    pub max_usage: i64,
    pub records: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub key_id: i64,
    pub key_name: String,
    pub api_key: String,
    pub api_type: ApiType,
    pub group_id: i64,
    pub character_count: i64,
    pub character_limit: i64,
    pub usage_percentage: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub billing_end_time: Option<DateTime<Utc>>,
}

/// Display form of a secret: "first10...last10", or the secret itself
/// when it is too short to hide anything.
pub fn display_secret(secret: &str, show_full: bool) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if show_full || chars.len() <= 20 {
        return secret.to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 10..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Group records (newest first) by calendar day, keeping the peak count.
pub fn daily_rollup(records: &[UsageRecord]) -> Vec<DailyUsage> {
    let mut days: Vec<DailyUsage> = Vec::new();
    for record in records {
        let date = record.checked_at.date_naive().to_string();
        match days.iter_mut().find(|d| d.date == date) {
            Some(day) => {
                day.max_usage = day.max_usage.max(record.character_count);
                day.records += 1;
            }
            None => days.push(DailyUsage { date, max_usage: record.character_count, records: 1 }),
        }
    }
    days
}

impl Store {
    pub fn latest_record(&self, credential_id: i64) -> Result<Option<UsageRecord>> {
        let db = self.conn()?;
        let record = db
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM usage_records WHERE api_key_id = ?1
                     ORDER BY check_time DESC, id DESC LIMIT 1"
                ),
                params![credential_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Records checked at or after `since`, newest first.
    pub fn usage_history(&self, credential_id: i64, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM usage_records WHERE api_key_id = ?1 AND check_time >= ?2
             ORDER BY check_time DESC, id DESC"
        ))?;
        let records = stmt
            .query_map(params![credential_id, fmt_ts(&since)], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn credential_view(&self, id: i64, show_full_key: bool, now: DateTime<Utc>) -> Result<Option<CredentialView>> {
        let Some(cred) = self.get_credential(id)? else {
            return Ok(None);
        };
        let latest = self.latest_record(id)?.map(|record| LatestUsage {
            effective: EffectiveUsage::of(cred.api_type, &record),
            record: record.into(),
        });
        Ok(Some(view_of(cred, latest, show_full_key, now)))
    }

    /// One row per active credential, including never-checked ones.
    pub fn usage_summary(&self, now: DateTime<Utc>) -> Result<Vec<SummaryRow>> {
        let mut rows = Vec::new();
        for cred in self.list_all_active_credentials()? {
            let row = match self.latest_record(cred.id)? {
                Some(record) => {
                    let effective = EffectiveUsage::of(cred.api_type, &record);
                    SummaryRow {
                        key_id: cred.id,
                        key_name: cred.name.clone(),
                        api_key: cred.secret.clone(),
                        api_type: cred.api_type,
                        group_id: cred.group_id,
                        character_count: effective.character_count,
                        character_limit: effective.character_limit,
                        usage_percentage: effective.usage_percentage,
                        last_check: Some(record.checked_at),
                        is_expired: cred.is_expired(now),
                        billing_end_time: cred.billing_end,
                    }
                }
                None => SummaryRow {
                    key_id: cred.id,
                    key_name: cred.name.clone(),
                    api_key: cred.secret.clone(),
                    api_type: cred.api_type,
                    group_id: cred.group_id,
                    character_count: 0,
                    character_limit: 0,
                    usage_percentage: 0.0,
                    last_check: None,
                    is_expired: false,
                    billing_end_time: None,
                },
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

fn view_of(cred: Credential, latest: Option<LatestUsage>, show_full_key: bool, now: DateTime<Utc>) -> CredentialView {
    CredentialView {
        is_expired: cred.is_expired(now),
        api_key: display_secret(&cred.secret, show_full_key),
        id: cred.id,
        name: cred.name,
        api_type: cred.api_type,
        group_id: cred.group_id,
        is_active: cred.is_active,
        created_at: cred.created_at,
        last_check: cred.last_check,
        billing_start_time: cred.billing_start,
        billing_end_time: cred.billing_end,
        latest_usage: latest,
    }
}
