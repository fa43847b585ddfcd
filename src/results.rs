//! Mapping raw index hits back into typed domain results.
//!
//! Malformed hits are skipped and counted, never surfaced as garbage;
//! the skip count rides along on the result so callers can see when the
//! index holds documents the current model cannot read.

use tracing::warn;

use crate::error::Result;
use crate::models::{ActiveRuleDoc, ActivityDoc, Document};
use crate::query::SearchOptions;
use crate::store::SearchPage;

/// A typed, paginated search result.
#[derive(Debug)]
pub struct SearchResult<T> {
    pub hits: Vec<T>,
    /// Matching documents ignoring pagination.
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    /// Hits dropped because they failed required-field validation.
    pub skipped: u64,
}

impl<T> SearchResult<T> {
    /// Whether more matches exist past this page.
    pub fn has_more(&self) -> bool {
        self.offset + self.limit < self.total
    }
}

/// Convert a raw page, applying the same validation rules the document
/// model uses on the write side.
pub fn map_page<T, F>(page: SearchPage, options: &SearchOptions, convert: F) -> SearchResult<T>
where
    F: Fn(&Document) -> Result<T>,
{
    let mut hits = Vec::with_capacity(page.hits.len());
    let mut skipped = 0u64;
    for doc in &page.hits {
        match convert(doc) {
            Ok(typed) => hits.push(typed),
            Err(e) => {
                warn!(key = %doc.key, error = %e, "skipping malformed search hit");
                skipped += 1;
            }
        }
    }
    SearchResult {
        hits,
        total: page.total,
        offset: options.offset,
        limit: options.effective_limit(),
        skipped,
    }
}

pub fn map_activities(page: SearchPage, options: &SearchOptions) -> SearchResult<ActivityDoc> {
    map_page(page, options, ActivityDoc::from_document)
}

pub fn map_active_rules(page: SearchPage, options: &SearchOptions) -> SearchResult<ActiveRuleDoc> {
    map_page(page, options, ActiveRuleDoc::from_document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocKind, FieldValue, RawRecord, FIELD_CREATED_AT, FIELD_KEY, FIELD_TYPE};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn good_activity(key: &str) -> Document {
        let record = RawRecord::new()
            .set_str(FIELD_KEY, key)
            .set_str(FIELD_TYPE, "QPROFILE")
            .set_ts(FIELD_CREATED_AT, Utc.timestamp_opt(1_000, 0).unwrap());
        ActivityDoc::from_record(&record).unwrap().to_document()
    }

    fn broken_activity(key: &str) -> Document {
        // Missing created_at, which the typed view requires.
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_KEY.to_string(), FieldValue::Str(key.to_string()));
        fields.insert(FIELD_TYPE.to_string(), FieldValue::Str("QPROFILE".into()));
        Document {
            key: key.to_string(),
            kind: DocKind::Activity,
            fields,
        }
    }

    #[test]
    fn malformed_hits_are_skipped_and_counted() {
        let page = SearchPage {
            hits: vec![good_activity("a1"), broken_activity("a2"), good_activity("a3")],
            total: 3,
        };
        let result = map_activities(page, &SearchOptions::default());

        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.total, 3);
        let keys: Vec<&str> = result.hits.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, vec!["a1", "a3"]);
    }

    #[test]
    fn pagination_metadata_is_preserved() {
        let page = SearchPage {
            hits: vec![good_activity("a1")],
            total: 12,
        };
        let result = map_activities(page, &SearchOptions::page(4, 0));
        assert_eq!(result.offset, 4);
        assert_eq!(result.limit, crate::query::DEFAULT_PAGE_SIZE);
        assert_eq!(result.total, 12);
    }
}
