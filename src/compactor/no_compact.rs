//! Gathering of operator-placed no-compact markers

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::block::{
    read_marker, BlockId, BlockMeta, MarkerReadError, MetadataFilter, NoCompactMark,
    NO_COMPACT_MARK_FILENAME,
};
use crate::{Error, Result};

/// A metadata filter that passes every meta through while collecting the
/// no-compact markers present in the bucket. Planners consult the gathered
/// set to leave marked blocks alone.
pub struct GatherNoCompactMarkFilter {
    bucket: Arc<dyn ObjectStore>,
    concurrency: usize,
    marked: std::sync::Mutex<HashMap<BlockId, NoCompactMark>>,
}

impl GatherNoCompactMarkFilter {
    pub fn new(bucket: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            bucket,
            concurrency: concurrency.max(1),
            marked: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the blocks marked for no compaction as of the last scan.
    pub fn no_compact_marked_blocks(&self) -> HashMap<BlockId, NoCompactMark> {
        self.marked.lock().unwrap().clone()
    }
}

enum Scan {
    Found(BlockId, NoCompactMark),
    Skipped,
    Failed(MarkerReadError),
}

#[async_trait]
impl MetadataFilter for GatherNoCompactMarkFilter {
    async fn filter(
        &self,
        cancel: &CancellationToken,
        metas: &mut HashMap<BlockId, BlockMeta>,
    ) -> Result<()> {
        let ids: Vec<BlockId> = metas.keys().copied().collect();

        let results: Vec<Scan> = stream::iter(ids.into_iter().map(|id| {
            let bucket = Arc::clone(&self.bucket);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Scan::Failed(MarkerReadError::Store(object_store::Error::Generic {
                        store: "no-compact scan",
                        source: "cancelled".into(),
                    }));
                }
                match read_marker::<NoCompactMark>(bucket.as_ref(), id, NO_COMPACT_MARK_FILENAME)
                    .await
                {
                    Ok(mark) => Scan::Found(id, mark),
                    Err(MarkerReadError::NotFound) => Scan::Skipped,
                    Err(MarkerReadError::Unmarshal(e)) => {
                        warn!(
                            block = %id,
                            error = %e,
                            "found partial no-compact marker; if this repeats for the same block, consider deleting the marker from the bucket"
                        );
                        Scan::Skipped
                    }
                    Err(e) => Scan::Failed(e),
                }
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        // The scan keeps draining past failures; only the last one surfaces.
        let mut gathered = HashMap::new();
        let mut last_err: Option<MarkerReadError> = None;
        for result in results {
            match result {
                Scan::Found(id, mark) => {
                    gathered.insert(id, mark);
                }
                Scan::Skipped => {}
                Scan::Failed(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            return Err(Error::Meta(format!(
                "filter blocks marked for no compaction: {e}"
            )));
        }

        *self.marked.lock().unwrap() = gathered;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testutil::raw_meta;
    use crate::block::mark_for_no_compact;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::PutPayload;

    #[tokio::test]
    async fn test_gathers_markers_without_removing_metas() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let a = raw_meta(0, 1000, 10);
        let b = raw_meta(1000, 2000, 10);
        mark_for_no_compact(bucket.as_ref(), a.id, "manual", "operator hold")
            .await
            .unwrap();

        let filter = GatherNoCompactMarkFilter::new(Arc::clone(&bucket), 4);
        let mut metas: HashMap<_, _> = [(a.id, a.clone()), (b.id, b.clone())].into_iter().collect();
        filter
            .filter(&CancellationToken::new(), &mut metas)
            .await
            .unwrap();

        assert_eq!(metas.len(), 2, "filter must pass all metas through");
        let marked = filter.no_compact_marked_blocks();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[&a.id].reason, "manual");
    }

    #[tokio::test]
    async fn test_partial_marker_is_skipped() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let a = raw_meta(0, 1000, 10);
        bucket
            .put(
                &ObjectPath::from(format!("{}/{}", a.id, NO_COMPACT_MARK_FILENAME)),
                PutPayload::from_static(b"{broken"),
            )
            .await
            .unwrap();

        let filter = GatherNoCompactMarkFilter::new(Arc::clone(&bucket), 2);
        let mut metas: HashMap<_, _> = [(a.id, a.clone())].into_iter().collect();
        filter
            .filter(&CancellationToken::new(), &mut metas)
            .await
            .unwrap();
        assert!(filter.no_compact_marked_blocks().is_empty());
    }
}
