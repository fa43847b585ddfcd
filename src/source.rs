//! Primary-store access.
//!
//! Reads the full current state of the relational tables into raw
//! records for the synchronizer. The index layer never computes diffs:
//! whatever is read here is the complete truth for each key.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{
    active_rule_key, RawRecord, FIELD_CREATED_AT, FIELD_DETAILS, FIELD_INHERITANCE, FIELD_KEY,
    FIELD_LOGIN, FIELD_MESSAGE, FIELD_PARAMS, FIELD_PARENT_KEY, FIELD_PROFILE_KEY, FIELD_RULE_KEY,
    FIELD_SEVERITY, FIELD_TYPE,
};

/// Read every activity row as a raw record.
///
/// Rows with an unparseable timestamp come back without a `created_at`
/// field; the document model rejects them and backfill reports them as
/// failed keys instead of dropping them silently.
pub async fn fetch_activities(pool: &SqlitePool) -> Result<Vec<(String, RawRecord)>> {
    let rows = sqlx::query(
        "SELECT id, activity_type, created_at, login, message, details_json \
         FROM activities ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        let activity_type: String = row.get("activity_type");
        let created_at: i64 = row.get("created_at");
        let login: Option<String> = row.get("login");
        let message: Option<String> = row.get("message");
        let details_json: String = row.get("details_json");

        let mut record = RawRecord::new()
            .set_str(FIELD_KEY, &id)
            .set_str(FIELD_TYPE, activity_type);
        if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(created_at) {
            record = record.set_ts(FIELD_CREATED_AT, ts);
        }
        if let Some(login) = login {
            record = record.set_str(FIELD_LOGIN, login);
        }
        if let Some(message) = message {
            record = record.set_str(FIELD_MESSAGE, message);
        }
        let details: BTreeMap<String, String> =
            serde_json::from_str(&details_json).unwrap_or_default();
        if !details.is_empty() {
            record = record.set_nested(FIELD_DETAILS, details);
        }

        records.push((id, record));
    }
    Ok(records)
}

/// Read every rule activation, joined with its params.
pub async fn fetch_active_rules(pool: &SqlitePool) -> Result<Vec<(String, RawRecord)>> {
    let param_rows = sqlx::query(
        "SELECT profile_key, rule_key, name, value FROM active_rule_params",
    )
    .fetch_all(pool)
    .await?;

    let mut params: HashMap<(String, String), BTreeMap<String, String>> = HashMap::new();
    for row in &param_rows {
        let profile: String = row.get("profile_key");
        let rule: String = row.get("rule_key");
        let name: String = row.get("name");
        let value: String = row.get("value");
        params.entry((profile, rule)).or_default().insert(name, value);
    }

    let rows = sqlx::query(
        "SELECT profile_key, rule_key, severity, inheritance, parent_key \
         FROM active_rules ORDER BY profile_key, rule_key",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let profile: String = row.get("profile_key");
        let rule: String = row.get("rule_key");
        let severity: String = row.get("severity");
        let inheritance: String = row.get("inheritance");
        let parent_key: Option<String> = row.get("parent_key");

        let key = active_rule_key(&profile, &rule);
        let mut record = RawRecord::new()
            .set_str(FIELD_KEY, &key)
            .set_str(FIELD_PROFILE_KEY, &profile)
            .set_str(FIELD_RULE_KEY, &rule)
            .set_str(FIELD_SEVERITY, severity)
            .set_str(FIELD_INHERITANCE, inheritance);
        if let Some(parent) = parent_key {
            record = record.set_str(FIELD_PARENT_KEY, parent);
        }
        if let Some(rule_params) = params.remove(&(profile, rule)) {
            record = record.set_nested(FIELD_PARAMS, rule_params);
        }

        records.push((key, record));
    }
    Ok(records)
}

/// Append one activity to the primary store, returning its raw record
/// for inline indexing.
pub async fn insert_activity(
    pool: &SqlitePool,
    id: &str,
    activity_type: &str,
    created_at: DateTime<Utc>,
    login: Option<&str>,
    message: Option<&str>,
    details: &BTreeMap<String, String>,
) -> Result<RawRecord> {
    sqlx::query(
        "INSERT INTO activities (id, activity_type, created_at, login, message, details_json) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(activity_type)
    .bind(created_at.timestamp_millis())
    .bind(login)
    .bind(message)
    .bind(serde_json::to_string(details)?)
    .execute(pool)
    .await?;

    let mut record = RawRecord::new()
        .set_str(FIELD_KEY, id)
        .set_str(FIELD_TYPE, activity_type)
        .set_ts(FIELD_CREATED_AT, created_at);
    if let Some(login) = login {
        record = record.set_str(FIELD_LOGIN, login);
    }
    if let Some(message) = message {
        record = record.set_str(FIELD_MESSAGE, message);
    }
    if !details.is_empty() {
        record = record.set_nested(FIELD_DETAILS, details.clone());
    }
    Ok(record)
}
