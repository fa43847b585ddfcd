//! In-memory [`IndexStore`] implementation for tests and small setups.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Search is brute-force
//! evaluation of the filter tree over all stored documents.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DocKind, Document};
use crate::query::{FilterExpr, SearchOptions, SortField, SortOrder};

use super::{BulkOutcome, IndexStore, ScrollPage, SearchPage};

/// In-memory index backend.
pub struct MemoryIndexStore {
    docs: RwLock<HashMap<(DocKind, String), Document>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().unwrap().is_empty()
    }

    fn matching(&self, filter: &FilterExpr) -> Vec<Document> {
        self.docs
            .read()
            .unwrap()
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect()
    }
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &Document, b: &Document, sort: SortField) -> Ordering {
    match sort {
        // Key tiebreak keeps pagination deterministic.
        SortField::CreatedAt => a
            .created_at()
            .cmp(&b.created_at())
            .then_with(|| a.key.cmp(&b.key)),
        SortField::Key => a.key.cmp(&b.key),
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn upsert(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert((doc.kind, doc.key.clone()), doc.clone());
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
        let mut docs = self.docs.write().unwrap();
        docs.remove(&(kind, key.to_string()));
        Ok(())
    }

    async fn search(&self, filter: &FilterExpr, options: &SearchOptions) -> Result<SearchPage> {
        options.validate()?;

        let mut hits = self.matching(filter);
        let total = hits.len() as i64;

        hits.sort_by(|a, b| {
            let ord = compare(a, b, options.sort);
            match options.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let offset = options.offset.min(total) as usize;
        let limit = options.effective_limit() as usize;
        let hits = hits.into_iter().skip(offset).take(limit).collect();

        Ok(SearchPage { hits, total })
    }

    async fn scroll_page(
        &self,
        filter: &FilterExpr,
        cursor: Option<&str>,
        batch: i64,
    ) -> Result<ScrollPage> {
        let mut docs = self.matching(filter);
        docs.sort_by(|a, b| a.key.cmp(&b.key));

        if let Some(after) = cursor {
            docs.retain(|d| d.key.as_str() > after);
        }
        docs.truncate(batch.max(0) as usize);

        let cursor = docs.last().map(|d| d.key.clone());
        Ok(ScrollPage { docs, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityDoc, RawRecord, FIELD_CREATED_AT, FIELD_KEY, FIELD_TYPE};
    use crate::query::ActivityQuery;
    use crate::store::Scroller;
    use chrono::{TimeZone, Utc};

    fn activity(key: &str, created_secs: i64) -> Document {
        let record = RawRecord::new()
            .set_str(FIELD_KEY, key)
            .set_str(FIELD_TYPE, "QPROFILE")
            .set_ts(
                FIELD_CREATED_AT,
                Utc.timestamp_opt(created_secs, 0).unwrap(),
            );
        ActivityDoc::from_record(&record).unwrap().to_document()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryIndexStore::new();
        let doc = activity("a1", 100);
        store.upsert(&doc).await.unwrap();
        store.upsert(&doc).await.unwrap();
        assert_eq!(store.len(), 1);

        let page = store
            .search(&ActivityQuery::new().to_filter(), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].key, "a1");
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let store = MemoryIndexStore::new();
        store.upsert(&activity("a1", 100)).await.unwrap();
        store.upsert(&activity("a1", 200)).await.unwrap();

        let page = store
            .search(&ActivityQuery::new().to_filter(), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(
            page.hits[0].created_at().unwrap(),
            Utc.timestamp_opt(200, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn delete_absent_key_succeeds() {
        let store = MemoryIndexStore::new();
        store.delete(DocKind::Activity, "missing").await.unwrap();
        store.upsert(&activity("a1", 100)).await.unwrap();
        store.delete(DocKind::Activity, "a1").await.unwrap();
        store.delete(DocKind::Activity, "a1").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn pagination_has_no_overlap_or_gap() {
        let store = MemoryIndexStore::new();
        for i in 0..5 {
            store.upsert(&activity(&format!("a{i}"), 100 + i)).await.unwrap();
        }
        let filter = ActivityQuery::new().to_filter();

        let first = store
            .search(&filter, &SearchOptions::page(0, 2))
            .await
            .unwrap();
        let second = store
            .search(&filter, &SearchOptions::page(2, 2))
            .await
            .unwrap();

        assert_eq!(first.total, 5);
        assert_eq!(second.total, 5);
        // Default sort: created_at descending.
        let keys: Vec<&str> = first
            .hits
            .iter()
            .chain(second.hits.iter())
            .map(|d| d.key.as_str())
            .collect();
        assert_eq!(keys, vec!["a4", "a3", "a2", "a1"]);
    }

    #[tokio::test]
    async fn search_rejects_negative_offset() {
        let store = MemoryIndexStore::new();
        let err = store
            .search(&ActivityQuery::new().to_filter(), &SearchOptions::page(-1, 2))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn scroll_covers_everything_in_bounded_batches() {
        let store = MemoryIndexStore::new();
        for i in 0..7 {
            store.upsert(&activity(&format!("a{i}"), 100 + i)).await.unwrap();
        }

        let mut scroller = Scroller::new(&store, ActivityQuery::new().to_filter(), 3);
        let mut seen = Vec::new();
        while let Some(batch) = scroller.next_batch().await.unwrap() {
            assert!(batch.len() <= 3);
            seen.extend(batch.into_iter().map(|d| d.key));
        }
        seen.sort();
        let expected: Vec<String> = (0..7).map(|i| format!("a{i}")).collect();
        assert_eq!(seen, expected);
    }
}
