//! SQLite-backed [`IndexStore`] implementation.
//!
//! Documents live in the `index_documents` table as a JSON payload plus
//! an extracted `sort_ts` column for range filters and the default sort.
//! The filter tree is rendered once into a parameterized WHERE clause;
//! term and nested-term equality go through `json_extract` with bound
//! paths, so no field name is ever spliced into SQL.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::{IndexError, Result};
use crate::models::{DocKind, Document};
use crate::query::{FilterExpr, SearchOptions, SortField, SortOrder};

use super::{BulkOutcome, IndexStore, ScrollPage, SearchPage};

/// SQLite implementation of the [`IndexStore`] trait.
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============ Filter rendering ============

#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Int(i64),
}

/// JSON path for a payload field, with quoted segments so dots inside
/// detail keys cannot change the path shape.
fn json_path(segments: &[&str]) -> String {
    let mut path = String::from("$");
    for seg in segments {
        path.push_str(&format!(".\"{}\"", seg.replace('"', "")));
    }
    path
}

fn render(expr: &FilterExpr, binds: &mut Vec<Bind>) -> String {
    match expr {
        FilterExpr::MatchAll => "1=1".to_string(),
        FilterExpr::KindIs(kind) => {
            binds.push(Bind::Text(kind.tag().to_string()));
            "kind = ?".to_string()
        }
        FilterExpr::Term { field, value } => {
            binds.push(Bind::Text(json_path(&[field.as_str()])));
            binds.push(Bind::Text(value.clone()));
            "json_extract(payload, ?) = ?".to_string()
        }
        FilterExpr::NestedTerm { field, key, value } => {
            binds.push(Bind::Text(json_path(&[field.as_str(), key.as_str()])));
            binds.push(Bind::Text(value.clone()));
            "json_extract(payload, ?) = ?".to_string()
        }
        FilterExpr::AnyOf(branches) => {
            if branches.is_empty() {
                return "0=1".to_string();
            }
            let parts: Vec<String> = branches.iter().map(|b| render(b, binds)).collect();
            format!("({})", parts.join(" OR "))
        }
        FilterExpr::AllOf(branches) => {
            if branches.is_empty() {
                return "1=1".to_string();
            }
            let parts: Vec<String> = branches.iter().map(|b| render(b, binds)).collect();
            format!("({})", parts.join(" AND "))
        }
        FilterExpr::CreatedAfter(bound) => {
            binds.push(Bind::Int(bound.timestamp_millis()));
            // Strictly greater: the bound itself is excluded.
            "sort_ts > ?".to_string()
        }
        FilterExpr::CreatedBefore(bound) => {
            binds.push(Bind::Int(bound.timestamp_millis()));
            "sort_ts < ?".to_string()
        }
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(s) => query.bind(s),
            Bind::Int(i) => query.bind(i),
        };
    }
    query
}

fn order_clause(options: &SearchOptions) -> &'static str {
    match (options.sort, options.order) {
        // Key tiebreak keeps pagination deterministic.
        (SortField::CreatedAt, SortOrder::Desc) => "sort_ts DESC, key DESC",
        (SortField::CreatedAt, SortOrder::Asc) => "sort_ts ASC, key ASC",
        (SortField::Key, SortOrder::Desc) => "key DESC",
        (SortField::Key, SortOrder::Asc) => "key ASC",
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let key: String = row.get("key");
    let kind_tag: String = row.get("kind");
    let payload: String = row.get("payload");

    let kind = DocKind::parse(&kind_tag).ok_or_else(|| {
        IndexError::malformed(format!("document '{key}' has unknown kind '{kind_tag}'"))
    })?;
    let fields = serde_json::from_str(&payload).map_err(|e| {
        IndexError::malformed(format!("document '{key}' has an undecodable payload: {e}"))
    })?;

    Ok(Document { key, kind, fields })
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(&self, doc: &Document) -> Result<()> {
        let payload = serde_json::to_string(&doc.fields)
            .map_err(|e| IndexError::malformed(format!("unserializable document: {e}")))?;
        let sort_ts = doc.created_at().map(|ts| ts.timestamp_millis());

        sqlx::query(
            r#"
            INSERT INTO index_documents (kind, key, payload, sort_ts)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(kind, key) DO UPDATE SET
                payload = excluded.payload,
                sort_ts = excluded.sort_ts
            "#,
        )
        .bind(doc.kind.tag())
        .bind(&doc.key)
        .bind(&payload)
        .bind(sort_ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn bulk_upsert(&self, docs: &[Document]) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.upsert(doc).await {
                Ok(()) => outcomes.push(BulkOutcome::ok(&doc.key)),
                Err(e) => outcomes.push(BulkOutcome::failed(&doc.key, e.to_string())),
            }
        }
        outcomes
    }

    async fn delete(&self, kind: DocKind, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM index_documents WHERE kind = ? AND key = ?")
            .bind(kind.tag())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(&self, filter: &FilterExpr, options: &SearchOptions) -> Result<SearchPage> {
        options.validate()?;

        let mut binds = Vec::new();
        let clause = render(filter, &mut binds);

        let count_sql = format!("SELECT COUNT(*) FROM index_documents WHERE {clause}");
        let total: i64 = bind_all(sqlx::query(&count_sql), &binds)
            .fetch_one(&self.pool)
            .await?
            .get(0);

        let select_sql = format!(
            "SELECT key, kind, payload FROM index_documents WHERE {clause} \
             ORDER BY {} LIMIT ? OFFSET ?",
            order_clause(options)
        );
        let rows = bind_all(sqlx::query(&select_sql), &binds)
            .bind(options.effective_limit())
            .bind(options.offset)
            .fetch_all(&self.pool)
            .await?;

        let hits = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>>>()?;

        Ok(SearchPage { hits, total })
    }

    async fn scroll_page(
        &self,
        filter: &FilterExpr,
        cursor: Option<&str>,
        batch: i64,
    ) -> Result<ScrollPage> {
        let mut binds = Vec::new();
        let clause = render(filter, &mut binds);

        let sql = match cursor {
            Some(_) => format!(
                "SELECT key, kind, payload FROM index_documents \
                 WHERE {clause} AND key > ? ORDER BY key ASC LIMIT ?"
            ),
            None => format!(
                "SELECT key, kind, payload FROM index_documents \
                 WHERE {clause} ORDER BY key ASC LIMIT ?"
            ),
        };

        let mut query = bind_all(sqlx::query(&sql), &binds);
        if let Some(after) = cursor {
            query = query.bind(after);
        }
        let rows = query.bind(batch.max(0)).fetch_all(&self.pool).await?;

        let docs = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>>>()?;
        let cursor = docs.last().map(|d| d.key.clone());

        Ok(ScrollPage { docs, cursor })
    }
}
