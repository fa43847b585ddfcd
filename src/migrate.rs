//! Schema migrations.
//!
//! Creates the relational system-of-record tables (activities, active
//! rules, active-rule params) and the `index_documents` table backing
//! the SQLite index store. All statements are idempotent.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Primary store: activity log, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activities (
            id TEXT PRIMARY KEY,
            activity_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            login TEXT,
            message TEXT,
            details_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Primary store: rule activations per quality profile
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS active_rules (
            profile_key TEXT NOT NULL,
            rule_key TEXT NOT NULL,
            severity TEXT NOT NULL,
            inheritance TEXT NOT NULL DEFAULT 'NONE',
            parent_key TEXT,
            PRIMARY KEY (profile_key, rule_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS active_rule_params (
            profile_key TEXT NOT NULL,
            rule_key TEXT NOT NULL,
            name TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (profile_key, rule_key, name),
            FOREIGN KEY (profile_key, rule_key) REFERENCES active_rules(profile_key, rule_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The index: one row per document, JSON payload plus the extracted
    // sort timestamp
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            payload TEXT NOT NULL,
            sort_ts INTEGER,
            PRIMARY KEY (kind, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_documents_sort_ts ON index_documents(kind, sort_ts)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
