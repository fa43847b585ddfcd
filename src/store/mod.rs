//! Index storage abstraction.
//!
//! The [`IndexStore`] trait defines every operation the synchronizer and
//! the query side need from an index engine, enabling pluggable backends
//! (SQLite, in-memory). Implementations must be `Send + Sync`.
//!
//! Writes are idempotent by contract: `upsert` replaces any document
//! sharing the same key, `delete` of an absent key succeeds trivially.
//! Visibility is eventual; callers needing read-your-write consistency
//! must consult the primary store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DocKind, Document};
use crate::query::{FilterExpr, SearchOptions};

/// One page of raw search hits.
///
/// `total` counts all matching documents ignoring pagination, so callers
/// can make "has more" decisions.
#[derive(Debug)]
pub struct SearchPage {
    pub hits: Vec<Document>,
    pub total: i64,
}

/// One batch of a scroll iteration, with the cursor to resume from.
#[derive(Debug)]
pub struct ScrollPage {
    pub docs: Vec<Document>,
    /// Key of the last document in this batch; `None` when exhausted.
    pub cursor: Option<String>,
}

/// Per-document outcome of a bulk upsert. A failing document must never
/// hide the rest of the batch.
#[derive(Debug)]
pub struct BulkOutcome {
    pub key: String,
    pub error: Option<String>,
}

impl BulkOutcome {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: None,
        }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Abstract index backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](IndexStore::upsert) | Insert-or-replace one document by key |
/// | [`bulk_upsert`](IndexStore::bulk_upsert) | Batched upsert with per-document outcomes |
/// | [`delete`](IndexStore::delete) | Idempotent delete by key |
/// | [`search`](IndexStore::search) | Filtered, sorted, paginated lookup |
/// | [`scroll_page`](IndexStore::scroll_page) | Keyset-cursor batch for bounded-memory iteration |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or fully replace the document stored at `doc.key`.
    async fn upsert(&self, doc: &Document) -> Result<()>;

    /// Upsert a batch, reporting each document's outcome individually.
    async fn bulk_upsert(&self, docs: &[Document]) -> Vec<BulkOutcome>;

    /// Remove a document. Deleting an absent key is not an error.
    async fn delete(&self, kind: DocKind, key: &str) -> Result<()>;

    /// Return one page of matching documents plus the unpaginated total.
    async fn search(&self, filter: &FilterExpr, options: &SearchOptions) -> Result<SearchPage>;

    /// Return the next scroll batch after `cursor`, ordered by key.
    ///
    /// Used only by full re-index; a scroll restarted from scratch sees
    /// the current state again.
    async fn scroll_page(
        &self,
        filter: &FilterExpr,
        cursor: Option<&str>,
        batch: i64,
    ) -> Result<ScrollPage>;
}

/// Drives [`IndexStore::scroll_page`] into a lazy batch sequence without
/// ever holding the full result set in memory.
pub struct Scroller<'a> {
    store: &'a dyn IndexStore,
    filter: FilterExpr,
    cursor: Option<String>,
    batch: i64,
    done: bool,
}

impl<'a> Scroller<'a> {
    pub fn new(store: &'a dyn IndexStore, filter: FilterExpr, batch: i64) -> Self {
        Self {
            store,
            filter,
            cursor: None,
            batch,
            done: false,
        }
    }

    /// Fetch the next batch, or `None` once the scroll is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Document>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .store
            .scroll_page(&self.filter, self.cursor.as_deref(), self.batch)
            .await?;
        if page.docs.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.cursor = page.cursor;
        if self.cursor.is_none() {
            self.done = true;
        }
        Ok(Some(page.docs))
    }
}
