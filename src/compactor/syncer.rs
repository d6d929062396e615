//! Bucket metadata synchronization and garbage collection

use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::errors::{CompactError, CompactResult};
use super::telemetry;
use super::MARK_DELETION_DEADLINE;
use crate::block::{
    mark_for_deletion, BlockId, BlockMeta, DeduplicateFilter, DeletionMarkFilter, MetaFetcher,
};
use crate::Error;

const DELETION_REASON_OUTDATED: &str = "outdated block";

type SyncOutcome = Result<(), String>;

#[derive(Default)]
struct SyncState {
    blocks: HashMap<BlockId, BlockMeta>,
    partial: HashMap<BlockId, String>,
}

/// Keeps an in-memory snapshot of the bucket's compactable blocks in sync
/// with the metadata fetcher, and retires blocks whose data is covered by a
/// higher-compaction-level block.
pub struct MetaSyncer {
    bucket: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn MetaFetcher>,
    duplicate_filter: Arc<dyn DeduplicateFilter>,
    deletion_mark_filter: Arc<dyn DeletionMarkFilter>,
    sync_timeout: Option<Duration>,
    state: std::sync::Mutex<SyncState>,
    // One in-flight fetch at most; followers wait on its broadcast. A single
    // slot stands in for a keyed single-flight map on purpose: there is only
    // ever one fetch to coalesce.
    inflight: tokio::sync::Mutex<Option<watch::Receiver<Option<SyncOutcome>>>>,
}

impl MetaSyncer {
    pub fn new(
        bucket: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn MetaFetcher>,
        duplicate_filter: Arc<dyn DeduplicateFilter>,
        deletion_mark_filter: Arc<dyn DeletionMarkFilter>,
        sync_timeout: Option<Duration>,
    ) -> Self {
        Self {
            bucket,
            fetcher,
            duplicate_filter,
            deletion_mark_filter,
            sync_timeout,
            state: std::sync::Mutex::new(SyncState::default()),
            inflight: tokio::sync::Mutex::new(None),
        }
    }

    /// Synchronizes the in-memory snapshot with the bucket. Concurrent calls
    /// share a single underlying fetch and all receive its result. Failures
    /// are retryable and leave the previous snapshot installed.
    pub async fn sync_metas(&self, cancel: &CancellationToken) -> CompactResult<()> {
        let slot = self.inflight.lock().await;
        if let Some(mut rx) = slot.clone() {
            drop(slot);
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome.map_err(|msg| CompactError::retry(Error::Sync(msg)));
                }
                if rx.changed().await.is_err() {
                    return Err(CompactError::retry(Error::Sync(
                        "in-flight sync abandoned".to_string(),
                    )));
                }
            }
        }

        let mut slot = slot;
        let (tx, rx) = watch::channel(None);
        *slot = Some(rx);
        // The slot is released before fetching so followers can subscribe
        // while the fetch is in flight.
        drop(slot);

        let outcome = self.fetch_and_install(cancel).await;
        *self.inflight.lock().await = None;
        let shared: SyncOutcome = outcome.as_ref().map(|_| ()).map_err(|e| e.to_string());
        let _ = tx.send(Some(shared));
        outcome
    }

    async fn fetch_and_install(&self, cancel: &CancellationToken) -> CompactResult<()> {
        let fetch = self.fetcher.fetch(cancel);
        let fetched = match self.sync_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| Error::Timeout)
                .and_then(|r| r),
            None => fetch.await,
        };

        match fetched {
            Ok(view) => {
                let mut state = self.state.lock().unwrap();
                state.blocks = view.metas;
                state.partial = view.partial;
                Ok(())
            }
            Err(e) => Err(CompactError::retry(Error::Sync(e.to_string()))),
        }
    }

    /// Copy of the blocks from the last successful sync.
    pub fn metas(&self) -> HashMap<BlockId, BlockMeta> {
        self.state.lock().unwrap().blocks.clone()
    }

    /// Copy of the partial-block error map from the last sync.
    pub fn partial(&self) -> HashMap<BlockId, String> {
        self.state.lock().unwrap().partial.clone()
    }

    /// Marks every duplicate block not already carrying a deletion marker,
    /// then drops it from the snapshot so the next grouping pass does not
    /// re-see it. The duplicate filter must have been refreshed by the most
    /// recent sync.
    pub async fn garbage_collect(&self, cancel: &CancellationToken) -> CompactResult<()> {
        let begin = Instant::now();

        let deletion_marks = self.deletion_mark_filter.deletion_marks();
        let garbage: Vec<BlockId> = self
            .duplicate_filter
            .duplicate_ids()
            .into_iter()
            .filter(|id| !deletion_marks.contains_key(id))
            .collect();

        for id in garbage {
            if cancel.is_cancelled() {
                return Err(CompactError::Other(Error::Cancelled));
            }

            info!(block = %id, "marking outdated block for deletion");
            // Fresh deadline detached from the caller so shutdown cannot
            // leave a half-marked block.
            let marked = tokio::time::timeout(
                MARK_DELETION_DEADLINE,
                mark_for_deletion(self.bucket.as_ref(), id, DELETION_REASON_OUTDATED),
            )
            .await
            .map_err(|_| Error::Timeout)
            .and_then(|r| r);
            if let Err(e) = marked {
                telemetry::record_garbage_collection_failure();
                return Err(CompactError::retry(Error::Compaction(format!(
                    "mark block {id} for deletion: {e}"
                ))));
            }
            telemetry::record_block_marked_for_deletion(DELETION_REASON_OUTDATED);

            self.state.lock().unwrap().blocks.remove(&id);
            telemetry::record_garbage_collected_block();
        }

        telemetry::record_garbage_collection(begin.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testutil::raw_meta;
    use crate::block::{
        read_marker, DeletionMark, FetchedMetas, MarkerReadError, DELETION_MARK_FILENAME,
    };
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        view: FetchedMetas,
        fail: bool,
    }

    #[async_trait]
    impl MetaFetcher for CountingFetcher {
        async fn fetch(&self, _cancel: &CancellationToken) -> crate::Result<FetchedMetas> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Internal("bucket listing failed".to_string()));
            }
            Ok(self.view.clone())
        }
    }

    struct StaticFilters {
        duplicates: Vec<BlockId>,
        marked: HashMap<BlockId, DeletionMark>,
    }

    impl DeduplicateFilter for StaticFilters {
        fn duplicate_ids(&self) -> Vec<BlockId> {
            self.duplicates.clone()
        }
    }

    impl DeletionMarkFilter for StaticFilters {
        fn deletion_marks(&self) -> HashMap<BlockId, DeletionMark> {
            self.marked.clone()
        }
    }

    fn syncer_with(
        fetcher: Arc<CountingFetcher>,
        filters: Arc<StaticFilters>,
        bucket: Arc<dyn ObjectStore>,
    ) -> Arc<MetaSyncer> {
        Arc::new(MetaSyncer::new(
            bucket,
            fetcher,
            Arc::clone(&filters) as Arc<dyn DeduplicateFilter>,
            filters as Arc<dyn DeletionMarkFilter>,
            Some(Duration::from_secs(5)),
        ))
    }

    fn no_filters() -> Arc<StaticFilters> {
        Arc::new(StaticFilters {
            duplicates: Vec::new(),
            marked: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_concurrent_syncs_share_one_fetch() {
        let meta = raw_meta(0, 1000, 10);
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
            view: FetchedMetas {
                metas: HashMap::from([(meta.id, meta)]),
                partial: HashMap::new(),
            },
            fail: false,
        });
        let syncer = syncer_with(Arc::clone(&fetcher), no_filters(), Arc::new(InMemory::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&syncer);
            handles.push(tokio::spawn(async move {
                s.sync_metas(&CancellationToken::new()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(syncer.metas().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_is_retryable_and_keeps_old_snapshot() {
        let meta = raw_meta(0, 1000, 10);
        let ok_fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            view: FetchedMetas {
                metas: HashMap::from([(meta.id, meta)]),
                partial: HashMap::new(),
            },
            fail: false,
        });
        let syncer = syncer_with(Arc::clone(&ok_fetcher), no_filters(), Arc::new(InMemory::new()));
        syncer.sync_metas(&CancellationToken::new()).await.unwrap();
        assert_eq!(syncer.metas().len(), 1);

        let failing = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            view: FetchedMetas::default(),
            fail: true,
        });
        let syncer2 = Arc::new(MetaSyncer::new(
            Arc::new(InMemory::new()),
            Arc::clone(&failing) as Arc<dyn MetaFetcher>,
            no_filters() as Arc<dyn DeduplicateFilter>,
            no_filters() as Arc<dyn DeletionMarkFilter>,
            None,
        ));
        let err = syncer2
            .sync_metas(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retry());
        assert!(syncer2.metas().is_empty());
    }

    #[tokio::test]
    async fn test_gc_marks_only_unmarked_duplicates() {
        let dup = raw_meta(0, 1000, 10);
        let already = raw_meta(1000, 2000, 10);
        let keep = raw_meta(2000, 3000, 10);

        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            view: FetchedMetas {
                metas: HashMap::from([
                    (dup.id, dup.clone()),
                    (already.id, already.clone()),
                    (keep.id, keep.clone()),
                ]),
                partial: HashMap::new(),
            },
            fail: false,
        });
        let filters = Arc::new(StaticFilters {
            duplicates: vec![dup.id, already.id],
            marked: HashMap::from([(
                already.id,
                DeletionMark {
                    id: already.id,
                    deletion_time: 0,
                    reason: DELETION_REASON_OUTDATED.to_string(),
                    version: 1,
                },
            )]),
        });
        let syncer = syncer_with(fetcher, filters, Arc::clone(&bucket));
        let cancel = CancellationToken::new();
        syncer.sync_metas(&cancel).await.unwrap();
        syncer.garbage_collect(&cancel).await.unwrap();

        // The unmarked duplicate got a marker and left the snapshot.
        let mark: DeletionMark = read_marker(bucket.as_ref(), dup.id, DELETION_MARK_FILENAME)
            .await
            .unwrap();
        assert_eq!(mark.reason, DELETION_REASON_OUTDATED);
        assert!(!syncer.metas().contains_key(&dup.id));

        // The already-marked duplicate was not re-marked; the non-duplicate
        // is untouched and still visible.
        let err = read_marker::<DeletionMark>(bucket.as_ref(), already.id, DELETION_MARK_FILENAME)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkerReadError::NotFound));
        let err = read_marker::<DeletionMark>(bucket.as_ref(), keep.id, DELETION_MARK_FILENAME)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkerReadError::NotFound));
        assert!(syncer.metas().contains_key(&keep.id));
    }

    #[tokio::test]
    async fn test_sync_timeout_is_retryable() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
            view: FetchedMetas::default(),
            fail: false,
        });
        let syncer = Arc::new(MetaSyncer::new(
            Arc::new(InMemory::new()),
            fetcher as Arc<dyn MetaFetcher>,
            no_filters() as Arc<dyn DeduplicateFilter>,
            no_filters() as Arc<dyn DeletionMarkFilter>,
            Some(Duration::from_millis(20)),
        ));
        let err = syncer
            .sync_metas(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retry());
    }
}
