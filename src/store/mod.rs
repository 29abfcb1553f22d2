//! Usage store: groups, credentials and usage history, backed by SQLite.
//!
//! Shared by the request layer and the polling core through one
//! connection behind a mutex. Only the polling core writes usage records
//! and touches `last_check` / billing fields, always through
//! [`Store::commit_poll`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::adapters::ApiType;

pub mod models;
pub mod reports;

pub use models::{
    Credential, CredentialCheck, Group, NewUsageRecord, PollBatch, UsageRecord,
};

/// Minimum accepted secret length after trimming.
const MIN_SECRET_LEN: usize = 10;

/// Longest accepted polling interval: ten years.
pub const MAX_QUERY_INTERVAL_SECS: i64 = 10 * 365 * 24 * 3600;

/// Validation failures surfaced to the request layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("API key must not be empty")]
    EmptySecret,
    #[error("API key is too short (minimum {MIN_SECRET_LEN} characters)")]
    SecretTooShort,
    #[error("API key already exists")]
    DuplicateSecret,
    #[error("Group {0} not found")]
    GroupNotFound(i64),
    #[error("API key {0} not found")]
    CredentialNotFound(i64),
    #[error("Query interval {0} exceeds the maximum of {MAX_QUERY_INTERVAL_SECS} seconds")]
    IntervalTooLong(i64),
}

/// Partial update of a group's editable fields.
#[derive(Debug, Clone, Default)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub query_interval: Option<i64>,
    pub is_active: Option<bool>,
}

/// A group before and after an update.
#[derive(Debug, Clone)]
pub struct GroupChange {
    pub before: Group,
    pub after: Group,
}

impl GroupChange {
    /// Whether the polling cadence needs rebuilding.
    pub fn cadence_changed(&self) -> bool {
        self.before.query_interval != self.after.query_interval
            || self.before.is_active != self.after.is_active
    }
}

/// Non-positive intervals are accepted and simply never scheduled.
pub fn validate_interval(query_interval: i64) -> Result<i64, StoreError> {
    if query_interval > MAX_QUERY_INTERVAL_SECS {
        return Err(StoreError::IntervalTooLong(query_interval));
    }
    Ok(query_interval)
}

/// Trim and check a raw secret, deriving its type.
pub fn validate_secret(raw: &str) -> Result<(String, ApiType), StoreError> {
    let secret = raw.trim();
    if secret.is_empty() {
        return Err(StoreError::EmptySecret);
    }
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(StoreError::SecretTooShort);
    }
    Ok((secret.to_string(), ApiType::from_secret(secret)))
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS api_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        query_interval INTEGER NOT NULL DEFAULT 3600,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        api_key TEXT NOT NULL UNIQUE,
        api_type TEXT NOT NULL,
        group_id INTEGER NOT NULL REFERENCES api_groups(id) ON DELETE CASCADE,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_check TEXT,
        billing_start_time TEXT,
        billing_end_time TEXT
    );

    CREATE TABLE IF NOT EXISTS usage_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        api_key_id INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
        check_time TEXT NOT NULL,
        character_count INTEGER NOT NULL,
        character_limit INTEGER NOT NULL CHECK (character_limit >= 0),
        api_key_character_count INTEGER,
        api_key_character_limit INTEGER,
        start_time TEXT,
        end_time TEXT,
        is_success BOOLEAN NOT NULL DEFAULT 1,
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_api_keys_group ON api_keys(group_id);
    CREATE INDEX IF NOT EXISTS idx_usage_records_key ON usage_records(api_key_id, check_time);
";

const GROUP_COLUMNS: &str = "id, name, query_interval, is_active, created_at";
const CREDENTIAL_COLUMNS: &str = "id, name, api_key, api_type, group_id, is_active, created_at, \
     last_check, billing_start_time, billing_end_time";
pub(crate) const RECORD_COLUMNS: &str = "id, api_key_id, check_time, character_count, character_limit, \
     api_key_character_count, api_key_character_limit, start_time, end_time, is_success, error_message";

/// The usage store backed by SQLite.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db)
    }

    /// A private, throwaway store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.pragma_update(None, "foreign_keys", "ON")?;
        db.execute_batch(SCHEMA).context("Failed to create schema")?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    // ── Groups ──────────────────────────────────────────────────────

    pub fn create_group(&self, name: &str, query_interval: i64, is_active: bool) -> Result<Group> {
        let query_interval = validate_interval(query_interval)?;
        let now = Utc::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO api_groups (name, query_interval, is_active, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, query_interval, is_active, fmt_ts(&now)],
        )?;
        let id = db.last_insert_rowid();
        Ok(Group { id, name: name.to_string(), query_interval, is_active, created_at: parse_ts(&fmt_ts(&now)) })
    }

    pub fn get_group(&self, id: i64) -> Result<Option<Group>> {
        let db = self.conn()?;
        group_by_id(&db, id)
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        self.query_groups(&format!("SELECT {GROUP_COLUMNS} FROM api_groups ORDER BY id"))
    }

    pub fn list_active_groups(&self) -> Result<Vec<Group>> {
        self.query_groups(&format!(
            "SELECT {GROUP_COLUMNS} FROM api_groups WHERE is_active = 1 ORDER BY id"
        ))
    }

    fn query_groups(&self, sql: &str) -> Result<Vec<Group>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let groups = stmt
            .query_map([], row_to_group)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    pub fn count_groups(&self) -> Result<i64> {
        let db = self.conn()?;
        Ok(db.query_row("SELECT COUNT(*) FROM api_groups", [], |row| row.get(0))?)
    }

    /// Create the default group when no group exists at all.
    pub fn ensure_default_group(&self, name: &str, query_interval: i64) -> Result<Option<Group>> {
        if self.count_groups()? > 0 {
            return Ok(None);
        }
        self.create_group(name, query_interval, true).map(Some)
    }

    /// Apply a partial update. The read, the write and the re-read happen
    /// in one transaction, so concurrent updates of different fields never
    /// overwrite each other.
    pub fn update_group(&self, id: i64, update: GroupUpdate) -> Result<GroupChange> {
        if let Some(interval) = update.query_interval {
            validate_interval(interval)?;
        }

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let before = group_by_id(&tx, id)?.ok_or(StoreError::GroupNotFound(id))?;
        tx.execute(
            "UPDATE api_groups SET name = COALESCE(?1, name), query_interval = COALESCE(?2, query_interval), \
             is_active = COALESCE(?3, is_active) WHERE id = ?4",
            params![update.name, update.query_interval, update.is_active, id],
        )?;
        let after = group_by_id(&tx, id)?.ok_or(StoreError::GroupNotFound(id))?;
        tx.commit()?;
        Ok(GroupChange { before, after })
    }

    /// Delete a group; its credentials and their records cascade.
    pub fn delete_group(&self, id: i64) -> Result<Group> {
        let group = self.get_group(id)?.ok_or(StoreError::GroupNotFound(id))?;
        let db = self.conn()?;
        db.execute("DELETE FROM api_groups WHERE id = ?1", params![id])?;
        Ok(group)
    }

    // ── Credentials ─────────────────────────────────────────────────

    pub fn add_credential(&self, group_id: i64, raw_secret: &str, name: Option<&str>) -> Result<Credential> {
        let (secret, api_type) = validate_secret(raw_secret)?;
        if self.get_group(group_id)?.is_none() {
            return Err(StoreError::GroupNotFound(group_id).into());
        }

        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                let tail: String = secret.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect();
                format!("API-{}", tail)
            }
        };

        let now = fmt_ts(&Utc::now());
        let db = self.conn()?;
        let exists: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM api_keys WHERE api_key = ?1)",
            params![secret],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::DuplicateSecret.into());
        }

        db.execute(
            "INSERT INTO api_keys (name, api_key, api_type, group_id, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![name, secret, api_type.as_str(), group_id, now],
        )?;
        let id = db.last_insert_rowid();
        tracing::info!(credential_id = id, group_id = group_id, api_type = api_type.as_str(), "API key added");

        db.query_row(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE id = ?1"),
            params![id],
            row_to_credential,
        )
        .map_err(Into::into)
    }

    pub fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let db = self.conn()?;
        let cred = db
            .query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE id = ?1"),
                params![id],
                row_to_credential,
            )
            .optional()?;
        Ok(cred)
    }

    /// Rename and/or (de)activate a credential.
    pub fn update_credential(&self, id: i64, name: Option<&str>, is_active: Option<bool>) -> Result<Credential> {
        let current = self.get_credential(id)?.ok_or(StoreError::CredentialNotFound(id))?;
        let name = name.unwrap_or(&current.name);
        let is_active = is_active.unwrap_or(current.is_active);

        let db = self.conn()?;
        db.execute(
            "UPDATE api_keys SET name = ?1, is_active = ?2 WHERE id = ?3",
            params![name, is_active, id],
        )?;
        Ok(Credential { name: name.to_string(), is_active, ..current })
    }

    pub fn delete_credential(&self, id: i64) -> Result<bool> {
        let db = self.conn()?;
        let rows = db.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        if rows > 0 {
            tracing::info!(credential_id = id, "API key deleted");
        }
        Ok(rows > 0)
    }

    pub fn list_credentials(&self) -> Result<Vec<Credential>> {
        self.query_credentials(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys ORDER BY id"),
            None,
        )
    }

    pub fn list_all_active_credentials(&self) -> Result<Vec<Credential>> {
        self.query_credentials(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE is_active = 1 ORDER BY id"),
            None,
        )
    }

    /// Active credentials of one group, in insertion order.
    pub fn list_active_credentials(&self, group_id: i64) -> Result<Vec<Credential>> {
        self.query_credentials(
            &format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE group_id = ?1 AND is_active = 1 ORDER BY id"
            ),
            Some(group_id),
        )
    }

    fn query_credentials(&self, sql: &str, group_id: Option<i64>) -> Result<Vec<Credential>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let rows = match group_id {
            Some(gid) => stmt.query_map(params![gid], row_to_credential)?,
            None => stmt.query_map([], row_to_credential)?,
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ── Poll results ────────────────────────────────────────────────

    /// Write one group poll atomically: every record is inserted and
    /// every credential check applied, or nothing is.
    pub fn commit_poll(&self, batch: &PollBatch) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO usage_records (api_key_id, check_time, character_count, character_limit,
                     api_key_character_count, api_key_character_limit, start_time, end_time,
                     is_success, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in &batch.records {
                insert.execute(params![
                    r.credential_id,
                    fmt_ts(&r.checked_at),
                    r.character_count,
                    r.character_limit,
                    r.key_character_count,
                    r.key_character_limit,
                    r.billing_start.as_ref().map(fmt_ts),
                    r.billing_end.as_ref().map(fmt_ts),
                    r.is_success,
                    r.error_message,
                ])?;
            }

            for check in &batch.checks {
                let rows = match &check.billing_window {
                    Some((start, end)) => tx.execute(
                        "UPDATE api_keys SET last_check = ?1, billing_start_time = ?2, billing_end_time = ?3
                         WHERE id = ?4",
                        params![fmt_ts(&check.checked_at), fmt_ts(start), end.as_ref().map(fmt_ts), check.credential_id],
                    )?,
                    None => tx.execute(
                        "UPDATE api_keys SET last_check = ?1 WHERE id = ?2",
                        params![fmt_ts(&check.checked_at), check.credential_id],
                    )?,
                };
                if rows == 0 {
                    return Err(StoreError::CredentialNotFound(check.credential_id).into());
                }
            }
        }
        tx.commit().context("Failed to commit poll results")?;
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn group_by_id(db: &Connection, id: i64) -> Result<Option<Group>> {
    let group = db
        .query_row(
            &format!("SELECT {GROUP_COLUMNS} FROM api_groups WHERE id = ?1"),
            params![id],
            row_to_group,
        )
        .optional()?;
    Ok(group)
}

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        query_interval: row.get(2)?,
        is_active: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
    })
}

fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        name: row.get(1)?,
        secret: row.get(2)?,
        api_type: ApiType::from_column(&row.get::<_, String>(3)?),
        group_id: row.get(4)?,
        is_active: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
        last_check: parse_opt_ts(row.get(7)?),
        billing_start: parse_opt_ts(row.get(8)?),
        billing_end: parse_opt_ts(row.get(9)?),
    })
}

pub(crate) fn row_to_record(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        credential_id: row.get(1)?,
        checked_at: parse_ts(&row.get::<_, String>(2)?),
        character_count: row.get(3)?,
        character_limit: row.get(4)?,
        key_character_count: row.get(5)?,
        key_character_limit: row.get(6)?,
        billing_start: parse_opt_ts(row.get(7)?),
        billing_end: parse_opt_ts(row.get(8)?),
        is_success: row.get(9)?,
        error_message: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_with_group() -> (Store, Group) {
        let store = Store::open_in_memory().unwrap();
        let group = store.create_group("default", 3600, true).unwrap();
        (store, group)
    }

    fn ok_record(credential_id: i64, count: i64) -> NewUsageRecord {
        NewUsageRecord {
            credential_id,
            checked_at: Utc::now(),
            character_count: count,
            character_limit: 500_000,
            key_character_count: None,
            key_character_limit: None,
            billing_start: None,
            billing_end: None,
            is_success: true,
            error_message: None,
        }
    }

    #[test]
    fn test_validate_secret() {
        assert_eq!(validate_secret("   "), Err(StoreError::EmptySecret));
        assert_eq!(validate_secret("abc:fx"), Err(StoreError::SecretTooShort));
        assert_eq!(
            validate_secret("  0123456789:fx \n"),
            Ok(("0123456789:fx".to_string(), ApiType::Free))
        );
        assert_eq!(validate_secret("0123456789").unwrap().1, ApiType::Pro);
    }

    #[test]
    fn test_add_credential_derives_type_and_name() {
        let (store, group) = store_with_group();
        let cred = store.add_credential(group.id, " 0123456789abcdef:fx ", None).unwrap();
        assert_eq!(cred.secret, "0123456789abcdef:fx");
        assert_eq!(cred.api_type, ApiType::Free);
        assert_eq!(cred.name, "API-bcdef:fx");
        assert!(cred.is_active);
        assert_eq!(cred.last_check, None);
    }

    #[test]
    fn test_duplicate_secret_rejected() {
        let (store, group) = store_with_group();
        store.add_credential(group.id, "0123456789abcdef", Some("a")).unwrap();
        let err = store.add_credential(group.id, "0123456789abcdef", Some("b")).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::DuplicateSecret));
    }

    #[test]
    fn test_add_credential_unknown_group() {
        let store = Store::open_in_memory().unwrap();
        let err = store.add_credential(99, "0123456789abcdef", None).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::GroupNotFound(99)));
    }

    #[test]
    fn test_active_credentials_in_insertion_order() {
        let (store, group) = store_with_group();
        let a = store.add_credential(group.id, "aaaaaaaaaaaa", Some("a")).unwrap();
        let b = store.add_credential(group.id, "bbbbbbbbbbbb", Some("b")).unwrap();
        let c = store.add_credential(group.id, "cccccccccccc", Some("c")).unwrap();
        store.update_credential(b.id, None, Some(false)).unwrap();

        let ids: Vec<i64> = store.list_active_credentials(group.id).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn test_ensure_default_group_only_when_empty() {
        let store = Store::open_in_memory().unwrap();
        let created = store.ensure_default_group("Default", 3600).unwrap();
        assert!(created.is_some());
        assert!(store.ensure_default_group("Default", 3600).unwrap().is_none());
        assert_eq!(store.count_groups().unwrap(), 1);
    }

    #[test]
    fn test_update_group_reports_cadence_change() {
        let (store, group) = store_with_group();
        let change = store.update_group(group.id, GroupUpdate { name: Some("renamed".into()), ..Default::default() }).unwrap();
        assert!(!change.cadence_changed());
        assert_eq!(change.after.name, "renamed");

        let change = store.update_group(group.id, GroupUpdate { query_interval: Some(60), ..Default::default() }).unwrap();
        assert!(change.cadence_changed());
        assert_eq!(store.get_group(group.id).unwrap().unwrap().query_interval, 60);

        let change = store.update_group(group.id, GroupUpdate { is_active: Some(false), ..Default::default() }).unwrap();
        assert!(change.cadence_changed());
    }

    #[test]
    fn test_interval_upper_bound() {
        let (store, group) = store_with_group();
        let err = store.create_group("far", i64::MAX, true).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::IntervalTooLong(i64::MAX)));
        assert!(store.create_group("edge", MAX_QUERY_INTERVAL_SECS, true).is_ok());

        let update = GroupUpdate { query_interval: Some(MAX_QUERY_INTERVAL_SECS + 1), ..Default::default() };
        let err = store.update_group(group.id, update).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
        assert_eq!(store.get_group(group.id).unwrap().unwrap().query_interval, 3600);
    }

    #[test]
    fn test_concurrent_updates_of_different_fields_both_land() {
        let (store, group) = store_with_group();
        let store = std::sync::Arc::new(store);

        let intervals = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 1..=200 {
                    store.update_group(group.id, GroupUpdate { query_interval: Some(i), ..Default::default() }).unwrap();
                }
            })
        };
        let names = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 1..=200 {
                    store.update_group(group.id, GroupUpdate { name: Some(format!("n{}", i)), ..Default::default() }).unwrap();
                }
            })
        };
        intervals.join().unwrap();
        names.join().unwrap();

        let group = store.get_group(group.id).unwrap().unwrap();
        assert_eq!(group.query_interval, 200);
        assert_eq!(group.name, "n200");
    }

    #[test]
    fn test_commit_poll_writes_records_and_checks() {
        let (store, group) = store_with_group();
        let cred = store.add_credential(group.id, "pro-secret-0001", None).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let checked_at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        let batch = PollBatch {
            records: vec![ok_record(cred.id, 10)],
            checks: vec![CredentialCheck {
                credential_id: cred.id,
                checked_at,
                billing_window: Some((start, Some(end))),
            }],
        };
        store.commit_poll(&batch).unwrap();

        let cred = store.get_credential(cred.id).unwrap().unwrap();
        assert_eq!(cred.last_check, Some(checked_at));
        assert_eq!(cred.billing_start, Some(start));
        assert_eq!(cred.billing_end, Some(end));
        assert_eq!(store.latest_record(cred.id).unwrap().unwrap().character_count, 10);
    }

    #[test]
    fn test_commit_poll_is_all_or_nothing() {
        let (store, group) = store_with_group();
        let cred = store.add_credential(group.id, "0123456789abcdef", None).unwrap();

        let batch = PollBatch {
            // Second record points at a credential that does not exist
            records: vec![ok_record(cred.id, 1), ok_record(cred.id + 100, 2)],
            checks: vec![],
        };
        assert!(store.commit_poll(&batch).is_err());
        assert!(store.latest_record(cred.id).unwrap().is_none());

        let batch = PollBatch {
            records: vec![ok_record(cred.id, 1)],
            checks: vec![CredentialCheck { credential_id: cred.id + 100, checked_at: Utc::now(), billing_window: None }],
        };
        assert!(store.commit_poll(&batch).is_err());
        assert!(store.latest_record(cred.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_group_cascades() {
        let (store, group) = store_with_group();
        let cred = store.add_credential(group.id, "0123456789abcdef", None).unwrap();
        store.commit_poll(&PollBatch { records: vec![ok_record(cred.id, 5)], checks: vec![] }).unwrap();

        store.delete_group(group.id).unwrap();
        assert!(store.get_credential(cred.id).unwrap().is_none());
        let db = store.conn().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM usage_records", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_group("persisted", 120, true).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let groups = store.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "persisted");
        assert_eq!(groups[0].query_interval, 120);
    }
}
