//! Write-side synchronization between the primary store and the index.
//!
//! The synchronizer consumes change events carrying an entity's full
//! current state (never a diff), materializes it through the document
//! model, and applies the matching index operation. The primary store
//! and the index are never updated atomically: drift is accepted and
//! repaired by [`Synchronizer::backfill`].
//!
//! Ordering: the index store does no per-key locking, so events for the
//! same key must not be applied out of order. [`SyncHandle::dispatch`]
//! routes events to a worker chosen by key hash, which serializes
//! same-key events while letting distinct keys proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::models::{ActiveRuleDoc, ActivityDoc, DocKind, Document, RawRecord};
use crate::store::IndexStore;

/// What happened to the source record.
#[derive(Debug)]
pub enum ChangeOp {
    /// Insert or update; carries the record's full current state.
    Upsert(RawRecord),
    Delete,
}

/// One change notification from the primary store, in commit order.
#[derive(Debug)]
pub struct ChangeEvent {
    pub kind: DocKind,
    pub key: String,
    pub op: ChangeOp,
}

/// Per-kind synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Failed,
}

/// Aggregate outcome of a backfill run.
///
/// A backfill never aborts on individual failures; malformed records and
/// failed upserts are collected here instead. A cancelled run leaves the
/// chunks already committed in place and reports how far it got.
#[derive(Debug, Default)]
pub struct BackfillReport {
    pub indexed: u64,
    /// Failed keys with the reason each one failed.
    pub failed: Vec<(String, String)>,
    pub chunks_committed: u64,
    pub cancelled: bool,
}

impl BackfillReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

fn materialize(kind: DocKind, record: &RawRecord) -> Result<Document> {
    match kind {
        DocKind::Activity => Ok(ActivityDoc::from_record(record)?.to_document()),
        DocKind::ActiveRule => Ok(ActiveRuleDoc::from_record(record)?.to_document()),
    }
}

/// Applies primary-store changes to an index backend.
pub struct Synchronizer<S: IndexStore> {
    store: Arc<S>,
    states: Mutex<HashMap<DocKind, SyncState>>,
}

impl<S: IndexStore> Synchronizer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self, kind: DocKind) -> SyncState {
        self.states
            .lock()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    fn set_state(&self, kind: DocKind, state: SyncState) {
        self.states.lock().unwrap().insert(kind, state);
    }

    /// Apply one change event synchronously.
    ///
    /// A malformed record fails here so the caller can retry after
    /// fixing the data; it is only during backfill that malformed
    /// records are skipped and counted.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        self.set_state(event.kind, SyncState::Syncing);
        let outcome = match &event.op {
            ChangeOp::Upsert(record) => {
                let doc = materialize(event.kind, record)?;
                if doc.key != event.key {
                    self.set_state(event.kind, SyncState::Failed);
                    return Err(IndexError::malformed(format!(
                        "event key '{}' does not match record key '{}'",
                        event.key, doc.key
                    )));
                }
                self.store.upsert(&doc).await
            }
            ChangeOp::Delete => self.store.delete(event.kind, &event.key).await,
        };
        match outcome {
            Ok(()) => {
                self.set_state(event.kind, SyncState::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(event.kind, SyncState::Failed);
                Err(e)
            }
        }
    }

    /// Re-materialize all records of a kind into the index.
    ///
    /// Records are indexed in bounded-size chunks via bulk upsert.
    /// Cancellation is honored at chunk boundaries only, never
    /// mid-chunk, so a cancelled run is still in a well-defined state.
    pub async fn backfill<I>(
        &self,
        kind: DocKind,
        records: I,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> BackfillReport
    where
        I: IntoIterator<Item = (String, RawRecord)>,
    {
        let chunk_size = chunk_size.max(1);
        let mut report = BackfillReport::default();
        let mut records = records.into_iter();
        self.set_state(kind, SyncState::Syncing);

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // Materialize up to one chunk, skipping malformed records.
            let mut chunk: Vec<Document> = Vec::with_capacity(chunk_size);
            let mut exhausted = true;
            for (key, record) in records.by_ref() {
                match materialize(kind, &record) {
                    Ok(doc) => chunk.push(doc),
                    Err(e) => {
                        warn!(key = %key, error = %e, "skipping malformed record during backfill");
                        report.failed.push((key, e.to_string()));
                    }
                }
                if chunk.len() == chunk_size {
                    exhausted = false;
                    break;
                }
            }
            if chunk.is_empty() {
                if exhausted {
                    break;
                }
                continue;
            }

            for outcome in self.store.bulk_upsert(&chunk).await {
                match outcome.error {
                    None => report.indexed += 1,
                    Some(reason) => {
                        warn!(key = %outcome.key, error = %reason, "chunk entry failed during backfill");
                        report.failed.push((outcome.key, reason));
                    }
                }
            }
            report.chunks_committed += 1;
            debug!(
                kind = kind.tag(),
                chunks = report.chunks_committed,
                indexed = report.indexed,
                "backfill chunk committed"
            );

            if exhausted {
                break;
            }
        }

        let state = if report.failed.is_empty() {
            SyncState::Idle
        } else {
            SyncState::Failed
        };
        self.set_state(kind, state);
        report
    }
}

// ============ Worker routing ============

/// Handle to a pool of sync workers. Dropping the handle (via
/// [`SyncHandle::shutdown`]) closes the queues and drains in-flight
/// events before the workers exit.
///
/// Apply failures inside the workers are asynchronous by nature, so
/// they surface through [`SyncHandle::failures`] rather than through
/// `dispatch`; a nonzero count means the index has drifted and needs a
/// backfill.
pub struct SyncHandle {
    senders: Vec<mpsc::Sender<ChangeEvent>>,
    handles: Vec<JoinHandle<()>>,
    failures: Arc<AtomicU64>,
}

impl SyncHandle {
    /// Route an event to its worker. Events for one key always land on
    /// the same worker queue, preserving their arrival order.
    pub async fn dispatch(&self, event: ChangeEvent) -> Result<()> {
        let mut hasher = DefaultHasher::new();
        event.key.hash(&mut hasher);
        let slot = (hasher.finish() as usize) % self.senders.len();
        self.senders[slot]
            .send(event)
            .await
            .map_err(|_| IndexError::IndexUnavailable("sync workers stopped".to_string()))
    }

    /// Number of dispatched events that failed to apply so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Close the queues, wait for all workers to drain, and return the
    /// final failure count.
    pub async fn shutdown(self) -> u64 {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
        self.failures.load(Ordering::Relaxed)
    }
}

impl<S: IndexStore + 'static> Synchronizer<S> {
    /// Spawn `workers` tokio tasks, each draining its own event queue.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize) -> SyncHandle {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let failures = Arc::new(AtomicU64::new(0));

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<ChangeEvent>(256);
            let sync = Arc::clone(self);
            let failed = Arc::clone(&failures);
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = sync.apply(&event).await {
                        failed.fetch_add(1, Ordering::Relaxed);
                        warn!(worker, key = %event.key, error = %e, "failed to apply change event");
                    }
                }
            }));
        }

        SyncHandle {
            senders,
            handles,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FIELD_CREATED_AT, FIELD_KEY, FIELD_TYPE};
    use crate::query::{ActivityQuery, SearchOptions};
    use crate::store::memory::MemoryIndexStore;
    use chrono::{TimeZone, Utc};

    fn activity_record(key: &str, activity_type: &str) -> RawRecord {
        RawRecord::new()
            .set_str(FIELD_KEY, key)
            .set_str(FIELD_TYPE, activity_type)
            .set_ts(FIELD_CREATED_AT, Utc.timestamp_opt(1_000, 0).unwrap())
    }

    fn upsert_event(key: &str, activity_type: &str) -> ChangeEvent {
        ChangeEvent {
            kind: DocKind::Activity,
            key: key.to_string(),
            op: ChangeOp::Upsert(activity_record(key, activity_type)),
        }
    }

    #[tokio::test]
    async fn apply_upsert_then_delete() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));

        sync.apply(&upsert_event("a1", "QPROFILE")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(sync.state(DocKind::Activity), SyncState::Idle);

        sync.apply(&ChangeEvent {
            kind: DocKind::Activity,
            key: "a1".to_string(),
            op: ChangeOp::Delete,
        })
        .await
        .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn apply_rejects_key_mismatch() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));

        let event = ChangeEvent {
            kind: DocKind::Activity,
            key: "other".to_string(),
            op: ChangeOp::Upsert(activity_record("a1", "QPROFILE")),
        };
        let err = sync.apply(&event).await.unwrap_err();
        assert!(matches!(err, IndexError::MalformedRecord(_)));
        assert_eq!(sync.state(DocKind::Activity), SyncState::Failed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn same_key_events_apply_in_dispatch_order() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Arc::new(Synchronizer::new(Arc::clone(&store)));
        let handle = sync.spawn_workers(4);

        for i in 0..50 {
            let label = format!("v{i}");
            handle.dispatch(upsert_event("a1", &label)).await.unwrap();
        }
        assert_eq!(handle.shutdown().await, 0);

        let page = store
            .search(&ActivityQuery::new().to_filter(), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let last = ActivityDoc::from_document(&page.hits[0]).unwrap();
        assert_eq!(last.activity_type, "v49", "later update must win");
    }

    #[tokio::test]
    async fn worker_failures_are_counted_on_the_handle() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Arc::new(Synchronizer::new(Arc::clone(&store)));
        let handle = sync.spawn_workers(2);

        handle.dispatch(upsert_event("a1", "QPROFILE")).await.unwrap();
        // Record key disagrees with the event key, so apply must fail.
        handle
            .dispatch(ChangeEvent {
                kind: DocKind::Activity,
                key: "other".to_string(),
                op: ChangeOp::Upsert(activity_record("a2", "QPROFILE")),
            })
            .await
            .unwrap();

        assert_eq!(handle.shutdown().await, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn backfill_skips_and_reports_malformed_records() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));

        let mut records = Vec::new();
        for i in 0..100 {
            let key = format!("a{i:03}");
            // Three records miss their creation timestamp.
            let record = if i % 33 == 7 {
                RawRecord::new()
                    .set_str(FIELD_KEY, &key)
                    .set_str(FIELD_TYPE, "QPROFILE")
            } else {
                activity_record(&key, "QPROFILE")
            };
            records.push((key, record));
        }

        let cancel = CancellationToken::new();
        let report = sync
            .backfill(DocKind::Activity, records, 16, &cancel)
            .await;

        assert_eq!(report.indexed, 97);
        assert_eq!(report.failed.len(), 3);
        assert!(!report.cancelled);
        assert_eq!(store.len(), 97);
        assert_eq!(sync.state(DocKind::Activity), SyncState::Failed);

        let failed_keys: Vec<&str> = report.failed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(failed_keys, vec!["a007", "a040", "a073"]);
    }

    #[tokio::test]
    async fn backfill_honors_cancellation_at_chunk_boundary() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));

        let records: Vec<(String, RawRecord)> = (0..40)
            .map(|i| {
                let key = format!("a{i:02}");
                let record = activity_record(&key, "QPROFILE");
                (key, record)
            })
            .collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sync
            .backfill(DocKind::Activity, records, 10, &cancel)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.indexed, 0);
        assert_eq!(report.chunks_committed, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn backfill_is_idempotent_repair() {
        let store = Arc::new(MemoryIndexStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));
        let cancel = CancellationToken::new();

        let records: Vec<(String, RawRecord)> = (0..10)
            .map(|i| {
                let key = format!("a{i}");
                (key.clone(), activity_record(&key, "QPROFILE"))
            })
            .collect();

        let first = sync
            .backfill(DocKind::Activity, records.clone(), 4, &cancel)
            .await;
        let second = sync
            .backfill(DocKind::Activity, records, 4, &cancel)
            .await;

        assert!(first.is_clean());
        assert!(second.is_clean());
        assert_eq!(store.len(), 10, "re-running a backfill must not duplicate");
    }
}
