//! Capability traits consumed by the compaction state machine
//!
//! The core holds planning, merging, deletability vetoes and lifecycle hooks
//! by capability, never by concrete type. Defaults implement the stock
//! behavior; embedding systems swap in their own.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::errors::{CompactError, CompactResult};
use super::group::Group;
use crate::block::{BlockId, BlockMeta, ChunkRef, SeriesIndex};
use crate::{Error, Result};

/// Chooses the next sub-list of a group's blocks to merge. An empty plan
/// means there is nothing to do right now. Metas arrive sorted by min time;
/// the plan may contain overlapping blocks when vertical compaction is
/// permitted.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        metas_by_min_time: &[BlockMeta],
        extensions: Option<&serde_json::Value>,
    ) -> Result<Vec<BlockMeta>>;
}

/// Low-level merge engine. Writes one or more merged blocks under
/// `dest_dir` from the block directories in `source_dirs` and returns their
/// IDs. Zero IDs means every input was empty and nothing was written.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    async fn merge(
        &self,
        dest_dir: &Path,
        source_dirs: &[PathBuf],
        populator: Arc<dyn BlockPopulator>,
    ) -> Result<Vec<BlockId>>;
}

/// Builds the output index contents of a merged block from the combined
/// input series. The default unifies identical series, sorts everything by
/// label set, and coalesces overlapping chunks so vertically compacted
/// inputs produce a healthy output index.
pub trait BlockPopulator: Send + Sync {
    fn populate(&self, series: Vec<SeriesIndex>) -> Result<Vec<SeriesIndex>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBlockPopulator;

impl BlockPopulator for DefaultBlockPopulator {
    fn populate(&self, series: Vec<SeriesIndex>) -> Result<Vec<SeriesIndex>> {
        let mut merged: Vec<SeriesIndex> = Vec::with_capacity(series.len());
        let mut sorted = series;
        sorted.sort_by(|a, b| a.labels.cmp(&b.labels));
        for s in sorted {
            match merged.last_mut() {
                Some(last) if last.labels == s.labels => {
                    last.chunks.extend(s.chunks);
                }
                _ => merged.push(s),
            }
        }

        for s in &mut merged {
            s.chunks.sort_by_key(|c| (c.min_time, c.max_time));
            let mut coalesced: Vec<ChunkRef> = Vec::with_capacity(s.chunks.len());
            for chunk in s.chunks.drain(..) {
                match coalesced.last_mut() {
                    Some(prev) if chunk.min_time <= prev.max_time => {
                        prev.max_time = prev.max_time.max(chunk.max_time);
                        prev.samples += chunk.samples;
                        prev.size_bytes += chunk.size_bytes;
                    }
                    _ => coalesced.push(chunk),
                }
            }
            s.chunks = coalesced;
        }
        Ok(merged)
    }
}

/// Veto hook consulted before the engine marks a source block deletable.
/// Embedding systems use it to protect blocks owned by other shards.
pub trait BlockDeletableChecker: Send + Sync {
    fn can_delete(&self, group: &Group, block_id: BlockId) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBlockDeletableChecker;

impl BlockDeletableChecker for DefaultBlockDeletableChecker {
    fn can_delete(&self, _group: &Group, _block_id: BlockId) -> bool {
        true
    }
}

/// Hooks around one group compaction: before the download of the planned
/// inputs, after each uploaded result, plus the populator handed to the
/// merge engine.
#[async_trait]
pub trait CompactionLifecycleCallback: Send + Sync {
    async fn pre_compaction(&self, group: &Group, to_compact: &[BlockMeta]) -> CompactResult<()>;

    async fn post_compaction(&self, group: &Group, block_id: BlockId) -> Result<()>;

    fn block_populator(&self, group: &Group) -> Arc<dyn BlockPopulator>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCompactionLifecycleCallback;

#[async_trait]
impl CompactionLifecycleCallback for DefaultCompactionLifecycleCallback {
    /// Verifies that no two planned blocks share a provenance source. A
    /// duplicated source is how the same sample ends up twice in the output;
    /// only vertical compaction may merge such plans, since it deduplicates.
    async fn pre_compaction(&self, group: &Group, to_compact: &[BlockMeta]) -> CompactResult<()> {
        let mut unique: HashSet<BlockId> = HashSet::new();
        for meta in to_compact {
            for source in &meta.sources {
                if !unique.insert(*source) {
                    if !group.vertical_compaction_enabled() {
                        let ids: Vec<String> =
                            to_compact.iter().map(|m| m.id.to_string()).collect();
                        return Err(CompactError::halt(Error::Compaction(format!(
                            "overlapping sources detected for plan [{}]",
                            ids.join(", ")
                        ))));
                    }
                    warn!(
                        group = group.key(),
                        duplicated_block = %source,
                        "overlapping sources detected for plan"
                    );
                }
            }
        }
        Ok(())
    }

    async fn post_compaction(&self, _group: &Group, _block_id: BlockId) -> Result<()> {
        Ok(())
    }

    fn block_populator(&self, _group: &Group) -> Arc<dyn BlockPopulator> {
        Arc::new(DefaultBlockPopulator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chunk(segment: &str, min_time: i64, max_time: i64) -> ChunkRef {
        ChunkRef {
            segment: segment.to_string(),
            min_time,
            max_time,
            samples: 10,
            size_bytes: 8,
        }
    }

    #[test]
    fn test_populate_unifies_series_and_coalesces_overlaps() {
        let labels = BTreeMap::from([("series".to_string(), "cpu".to_string())]);
        let series = vec![
            SeriesIndex {
                labels: labels.clone(),
                chunks: vec![chunk("000001", 0, 100)],
            },
            SeriesIndex {
                labels: labels.clone(),
                chunks: vec![chunk("000002", 50, 150), chunk("000003", 200, 300)],
            },
        ];

        let out = DefaultBlockPopulator.populate(series).unwrap();
        assert_eq!(out.len(), 1);
        // The overlapping [0,100] and [50,150] collapse into one chunk.
        assert_eq!(out[0].chunks.len(), 2);
        assert_eq!(out[0].chunks[0].min_time, 0);
        assert_eq!(out[0].chunks[0].max_time, 150);
        assert_eq!(out[0].chunks[0].samples, 20);
        assert_eq!(out[0].chunks[1].min_time, 200);
    }

    #[test]
    fn test_populate_sorts_series_by_label_set() {
        let a = BTreeMap::from([("series".to_string(), "a".to_string())]);
        let b = BTreeMap::from([("series".to_string(), "b".to_string())]);
        let series = vec![
            SeriesIndex {
                labels: b.clone(),
                chunks: vec![chunk("000001", 0, 100)],
            },
            SeriesIndex {
                labels: a.clone(),
                chunks: vec![chunk("000002", 0, 100)],
            },
        ];

        let out = DefaultBlockPopulator.populate(series).unwrap();
        assert_eq!(out[0].labels, a);
        assert_eq!(out[1].labels, b);
    }
}
