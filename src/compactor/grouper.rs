//! Partitioning of the block set into compaction groups

use async_trait::async_trait;
use object_store::ObjectStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use super::group::Group;
use crate::block::{BlockId, BlockMeta};
use crate::Result;

/// Shared counters across all groups of a pass. Exposed so embedders and
/// tests can observe compaction outcomes without scraping metrics.
#[derive(Debug, Default)]
pub struct CompactionCounters {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub compactions: AtomicU64,
    pub vertical_compactions: AtomicU64,
    pub failures: AtomicU64,
    /// Source blocks marked deletable after a successful compaction.
    pub source_blocks_deleted: AtomicU64,
}

/// Splits all known blocks into groups that are safe to compact
/// concurrently. Groups are rebuilt from scratch on every call.
#[async_trait]
pub trait Grouper: Send + Sync {
    async fn groups(&self, blocks: &HashMap<BlockId, BlockMeta>) -> Result<Vec<Arc<Group>>>;
}

/// Groups blocks by external label set and downsample resolution. Blocks
/// sharing both carry series from the same producer stream at the same
/// granularity, so merging them is safe and commutative for queries.
pub struct DefaultGrouper {
    bucket: Arc<dyn ObjectStore>,
    accept_malformed_index: bool,
    enable_vertical_compaction: bool,
    counters: Arc<CompactionCounters>,
    block_files_concurrency: usize,
    compact_blocks_fetch_concurrency: usize,
}

impl DefaultGrouper {
    pub fn new(
        bucket: Arc<dyn ObjectStore>,
        accept_malformed_index: bool,
        enable_vertical_compaction: bool,
        block_files_concurrency: usize,
        compact_blocks_fetch_concurrency: usize,
    ) -> Self {
        Self {
            bucket,
            accept_malformed_index,
            enable_vertical_compaction,
            counters: Arc::new(CompactionCounters::default()),
            block_files_concurrency,
            compact_blocks_fetch_concurrency,
        }
    }

    pub fn counters(&self) -> Arc<CompactionCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl Grouper for DefaultGrouper {
    async fn groups(&self, blocks: &HashMap<BlockId, BlockMeta>) -> Result<Vec<Arc<Group>>> {
        let mut by_key: BTreeMap<String, Vec<&BlockMeta>> = BTreeMap::new();
        for meta in blocks.values() {
            by_key.entry(meta.group_key()).or_default().push(meta);
        }

        let mut groups = Vec::with_capacity(by_key.len());
        for (key, members) in by_key {
            let first = members[0];
            let group = Group::new(
                Arc::clone(&self.bucket),
                key,
                first.labels.clone(),
                first.resolution,
                self.accept_malformed_index,
                self.enable_vertical_compaction,
                Arc::clone(&self.counters),
                self.block_files_concurrency,
                self.compact_blocks_fetch_concurrency,
            )?;
            for meta in members {
                group.append_meta(meta.clone()).await?;
            }
            groups.push(Arc::new(group));
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testutil::raw_meta;
    use crate::block::Resolution;
    use object_store::memory::InMemory;

    fn grouper() -> DefaultGrouper {
        DefaultGrouper::new(Arc::new(InMemory::new()), false, false, 1, 1)
    }

    #[tokio::test]
    async fn test_groups_split_by_labels_and_resolution() {
        let mut a = raw_meta(0, 1000, 10);
        let mut b = raw_meta(1000, 2000, 10);
        let mut c = raw_meta(2000, 3000, 10);
        a.labels.insert("replica".to_string(), "1".to_string());
        b.labels.insert("replica".to_string(), "1".to_string());
        c.labels.insert("replica".to_string(), "2".to_string());
        let mut d = raw_meta(0, Resolution::Raw.downsample_range().unwrap(), 10);
        d.labels = c.labels.clone();
        d.resolution = Resolution::FiveMinutes;

        let blocks: HashMap<_, _> = [a, b, c, d].into_iter().map(|m| (m.id, m)).collect();
        let groups = grouper().groups(&blocks).await.unwrap();
        assert_eq!(groups.len(), 3);

        // Every member matches its group's labels and resolution, and groups
        // come back sorted by key.
        let mut keys: Vec<String> = Vec::new();
        for g in &groups {
            keys.push(g.key().to_string());
            for m in g.metas_by_min_time().await {
                assert_eq!(&m.labels, g.labels());
                assert_eq!(m.resolution, g.resolution());
            }
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_group_members_sorted_by_min_time() {
        let a = raw_meta(5000, 6000, 10);
        let b = raw_meta(0, 1000, 10);
        let c = raw_meta(2000, 3000, 10);
        let blocks: HashMap<_, _> = [a, b, c].into_iter().map(|m| (m.id, m)).collect();

        let groups = grouper().groups(&blocks).await.unwrap();
        assert_eq!(groups.len(), 1);
        let metas = groups[0].metas_by_min_time().await;
        let times: Vec<i64> = metas.iter().map(|m| m.min_time).collect();
        assert_eq!(times, vec![0, 2000, 5000]);
    }

    #[tokio::test]
    async fn test_append_of_mismatched_meta_fails() {
        let a = raw_meta(0, 1000, 10);
        let blocks: HashMap<_, _> = [(a.id, a.clone())].into_iter().collect();
        let groups = grouper().groups(&blocks).await.unwrap();

        let mut other = raw_meta(1000, 2000, 10);
        other.labels.insert("replica".to_string(), "9".to_string());
        assert!(groups[0].append_meta(other).await.is_err());

        let mut wrong_res = raw_meta(0, Resolution::Raw.downsample_range().unwrap(), 10);
        wrong_res.labels = a.labels.clone();
        wrong_res.resolution = Resolution::FiveMinutes;
        assert!(groups[0].append_meta(wrong_res).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_file_concurrency_fails_group_creation() {
        let g = DefaultGrouper::new(Arc::new(InMemory::new()), false, false, 0, 1);
        let a = raw_meta(0, 1000, 10);
        let blocks: HashMap<_, _> = [(a.id, a)].into_iter().collect();
        assert!(g.groups(&blocks).await.is_err());
    }
}
