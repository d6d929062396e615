//! Block model for the time-series store
//!
//! A block is an immutable directory in the bucket covering a half-open time
//! range `[min_time, max_time)` for one stream of series, identified by a set
//! of external labels and a downsample resolution. This module holds the
//! metadata model shared by the syncer, grouper and compactor.

mod fetch;
mod index;
mod markers;
mod store;

pub use fetch::{DeduplicateFilter, DeletionMarkFilter, FetchedMetas, MetaFetcher, MetadataFilter};
pub use index::{
    gather_index_health_stats, rewrite_dropping_outside_chunks, BlockIndex, ChunkRef,
    IndexHealthStats, SeriesIndex,
};
pub use markers::{
    mark_for_deletion, mark_for_no_compact, read_marker, DeletionMark, MarkerReadError,
    NoCompactMark, DELETION_MARK_FILENAME, NO_COMPACT_MARK_FILENAME,
};
pub use store::BlockStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use ulid::Ulid;

use crate::{Error, Result};

/// File holding a block's metadata inside its directory.
pub const META_FILENAME: &str = "meta.json";
/// File holding a block's series/chunk index inside its directory.
pub const INDEX_FILENAME: &str = "index.json";
/// Directory holding a block's chunk segment files.
pub const CHUNKS_DIR: &str = "chunks";
/// Tombstones file written by the merge engine; stripped before upload.
pub const TOMBSTONES_FILENAME: &str = "tombstones.json";

/// External labels identifying the logical producer stream of a block.
pub type Labels = BTreeMap<String, String>;

/// Lexicographically ordered 128-bit block identifier that encodes its
/// creation time, so IDs sort by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Ulid);

impl BlockId {
    /// Mint an ID stamped with the given creation time in milliseconds.
    pub fn new(timestamp_ms: u64) -> Self {
        BlockId(Ulid::from_parts(timestamp_ms, rand::random::<u128>()))
    }

    /// Deterministic ID used when simulating compactions. Sequence numbers
    /// never collide, unlike wall-clock-derived IDs minted within the same
    /// second.
    pub fn simulated(seq: u64) -> Self {
        BlockId(Ulid::from_parts(seq, 0))
    }

    /// Creation time encoded in the ID, in milliseconds since epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(BlockId)
            .map_err(|e| Error::Meta(format!("invalid block id '{s}': {e}")))
    }
}

/// Downsample resolution of a block, in milliseconds per sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Resolution {
    Raw,
    FiveMinutes,
    OneHour,
}

impl Resolution {
    /// Window size in milliseconds. Raw data has no window.
    pub fn as_millis(&self) -> i64 {
        match self {
            Resolution::Raw => 0,
            Resolution::FiveMinutes => 5 * 60 * 1000,
            Resolution::OneHour => 60 * 60 * 1000,
        }
    }

    /// Minimum time span a block must cover before it becomes eligible for
    /// downsampling into the next resolution. 40 hours of raw data produce
    /// 5m aggregates; 10 days of 5m aggregates produce 1h aggregates.
    pub fn downsample_range(&self) -> Option<i64> {
        match self {
            Resolution::Raw => Some(40 * 60 * 60 * 1000),
            Resolution::FiveMinutes => Some(10 * 24 * 60 * 60 * 1000),
            Resolution::OneHour => None,
        }
    }

    /// The next coarser resolution, if any.
    pub fn next(&self) -> Option<Resolution> {
        match self {
            Resolution::Raw => Some(Resolution::FiveMinutes),
            Resolution::FiveMinutes => Some(Resolution::OneHour),
            Resolution::OneHour => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::FiveMinutes => "5m",
            Resolution::OneHour => "1h",
        }
    }
}

impl From<Resolution> for i64 {
    fn from(r: Resolution) -> i64 {
        r.as_millis()
    }
}

impl TryFrom<i64> for Resolution {
    type Error = String;

    fn try_from(v: i64) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(Resolution::Raw),
            300_000 => Ok(Resolution::FiveMinutes),
            3_600_000 => Ok(Resolution::OneHour),
            other => Err(format!("invalid resolution {other}ms")),
        }
    }
}

/// Who wrote a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Ingester,
    Compactor,
    Repair,
}

/// Size statistics gathered from a block index, carried on the meta so
/// downstream readers can size their buffers without re-scanning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    #[serde(default)]
    pub chunk_max_size: u64,
    #[serde(default)]
    pub series_max_size: u64,
}

/// Immutable descriptor of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    /// Inclusive start of the block's time range, milliseconds since epoch.
    pub min_time: i64,
    /// Exclusive end of the block's time range, milliseconds since epoch.
    pub max_time: i64,
    pub labels: Labels,
    pub resolution: Resolution,
    /// Root blocks this block was ultimately derived from, closed under
    /// transitive merging.
    pub sources: BTreeSet<BlockId>,
    pub compaction_level: u32,
    pub num_samples: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BlockSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
    #[serde(default)]
    pub index_stats: IndexStats,
}

impl BlockMeta {
    /// Deterministic key of the compaction group this block belongs to.
    /// Blocks sharing labels and resolution carry series from the same
    /// producer stream at the same granularity and may be merged.
    pub fn group_key(&self) -> String {
        group_key(&self.labels, self.resolution)
    }

    /// Half-open range overlap with another block.
    pub fn overlaps(&self, other: &BlockMeta) -> bool {
        self.min_time < other.max_time && other.min_time < self.max_time
    }

    /// Validates the structural invariants every meta must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.min_time >= self.max_time {
            return Err(Error::Meta(format!(
                "block {}: empty time range [{}, {})",
                self.id, self.min_time, self.max_time
            )));
        }
        if self.sources.is_empty() {
            return Err(Error::Meta(format!("block {}: no sources", self.id)));
        }
        if self.compaction_level < 1 {
            return Err(Error::Meta(format!(
                "block {}: compaction level {} below 1",
                self.id, self.compaction_level
            )));
        }
        // A downsampled block must span at least the range that produced it.
        let required_span = match self.resolution {
            Resolution::Raw => None,
            Resolution::FiveMinutes => Resolution::Raw.downsample_range(),
            Resolution::OneHour => Resolution::FiveMinutes.downsample_range(),
        };
        if let Some(range) = required_span {
            if self.max_time - self.min_time < range {
                return Err(Error::Meta(format!(
                    "block {}: {} resolution block spans {}ms, below the {}ms downsample range",
                    self.id,
                    self.resolution.as_str(),
                    self.max_time - self.min_time,
                    range
                )));
            }
        }
        Ok(())
    }

    /// Builds the meta of a block produced by merging `inputs`. The result
    /// covers the union of input ranges, unions provenance, sums samples and
    /// sits one compaction level above the deepest input.
    pub fn merged(id: BlockId, inputs: &[&BlockMeta]) -> BlockMeta {
        let min_time = inputs.iter().map(|m| m.min_time).min().unwrap_or(0);
        let max_time = inputs.iter().map(|m| m.max_time).max().unwrap_or(0);
        let sources: BTreeSet<BlockId> =
            inputs.iter().flat_map(|m| m.sources.iter().copied()).collect();
        let level = inputs.iter().map(|m| m.compaction_level).max().unwrap_or(0) + 1;
        let num_samples = inputs.iter().map(|m| m.num_samples).sum();
        let first = inputs.first();

        BlockMeta {
            id,
            min_time,
            max_time,
            labels: first.map(|m| m.labels.clone()).unwrap_or_default(),
            resolution: first.map(|m| m.resolution).unwrap_or(Resolution::Raw),
            sources,
            compaction_level: level,
            num_samples,
            source: Some(BlockSource::Compactor),
            extensions: None,
            index_stats: IndexStats::default(),
        }
    }

    /// Reads a meta from `<dir>/meta.json`.
    pub async fn read_from_dir(dir: &Path) -> Result<BlockMeta> {
        let raw = tokio::fs::read(dir.join(META_FILENAME)).await?;
        let meta: BlockMeta = serde_json::from_slice(&raw)?;
        Ok(meta)
    }

    /// Writes this meta to `<dir>/meta.json`.
    pub async fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(META_FILENAME), raw).await?;
        Ok(())
    }
}

/// Deterministic group key for a label set at a resolution.
pub fn group_key(labels: &Labels, resolution: Resolution) -> String {
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{}@{{{}}}", resolution.as_millis(), rendered.join(", "))
}

/// Scans metas for pairwise time-range overlaps and returns a description of
/// every overlapping pair found, empty when ranges are pairwise disjoint.
/// Adjacent half-open ranges do not overlap.
pub fn find_overlapping(metas: &[BlockMeta]) -> Vec<String> {
    let mut sorted: Vec<&BlockMeta> = metas.iter().collect();
    sorted.sort_by_key(|m| (m.min_time, m.id));

    let mut overlaps = Vec::new();
    // Track the block reaching furthest right; comparing only neighbors
    // would miss a block contained inside an earlier, wider one.
    let mut furthest: Option<&BlockMeta> = None;
    for m in sorted {
        if let Some(f) = furthest {
            if m.min_time < f.max_time {
                overlaps.push(format!(
                    "[{}, {}) {} overlaps [{}, {}) {}",
                    f.min_time, f.max_time, f.id, m.min_time, m.max_time, m.id
                ));
            }
        }
        if furthest.map(|f| m.max_time > f.max_time).unwrap_or(true) {
            furthest = Some(m);
        }
    }
    overlaps
}

/// How long until this block becomes eligible for the next downsample level.
/// Errors for 1h blocks, which are never downsampled further.
pub fn until_next_downsampling(meta: &BlockMeta) -> Result<chrono::Duration> {
    let span = meta.max_time - meta.min_time;
    match meta.resolution.downsample_range() {
        Some(range) => Ok(chrono::Duration::milliseconds(range - span)),
        None => Err(Error::Meta(format!(
            "block {}: no downsampling beyond {}",
            meta.id,
            meta.resolution.as_str()
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::raw_meta;
    use super::*;

    #[test]
    fn test_group_key_is_deterministic_and_label_sensitive() {
        let a = raw_meta(0, 1000, 10);
        let mut b = raw_meta(1000, 2000, 10);
        assert_eq!(a.group_key(), b.group_key());

        b.labels.insert("replica".to_string(), "1".to_string());
        assert_ne!(a.group_key(), b.group_key());

        b.resolution = Resolution::FiveMinutes;
        assert!(b.group_key().starts_with("300000@"));
    }

    #[test]
    fn test_adjacent_half_open_ranges_do_not_overlap() {
        let a = raw_meta(0, 100, 10);
        let b = raw_meta(100, 200, 10);
        assert!(!a.overlaps(&b));
        assert!(find_overlapping(&[a, b]).is_empty());
    }

    #[test]
    fn test_find_overlapping_reports_pairs() {
        let a = raw_meta(0, 150, 10);
        let b = raw_meta(100, 200, 10);
        let overlaps = find_overlapping(&[b.clone(), a.clone()]);
        assert_eq!(overlaps.len(), 1);
        assert!(overlaps[0].contains(&a.id.to_string()));
        assert!(overlaps[0].contains(&b.id.to_string()));
    }

    #[test]
    fn test_find_overlapping_sees_contained_blocks() {
        // A wide block swallowing two later ones; neighbor comparison alone
        // would miss the second.
        let wide = raw_meta(0, 1000, 10);
        let inner1 = raw_meta(10, 20, 10);
        let inner2 = raw_meta(30, 40, 10);
        let overlaps = find_overlapping(&[wide, inner1, inner2]);
        assert_eq!(overlaps.len(), 2);
    }

    #[test]
    fn test_merged_meta_unions_ranges_sources_and_levels() {
        let a = raw_meta(0, 7_200_000, 100);
        let b = raw_meta(7_200_000, 14_400_000, 100);
        let id = BlockId::new(1);
        let merged = BlockMeta::merged(id, &[&a, &b]);

        assert_eq!(merged.min_time, 0);
        assert_eq!(merged.max_time, 14_400_000);
        assert_eq!(merged.num_samples, 200);
        assert_eq!(merged.compaction_level, 2);
        let want: BTreeSet<BlockId> = a.sources.union(&b.sources).copied().collect();
        assert_eq!(merged.sources, want);
        assert_eq!(merged.source, Some(BlockSource::Compactor));
    }

    #[test]
    fn test_validate_rejects_short_downsampled_blocks() {
        let mut m = raw_meta(0, 1000, 10);
        assert!(m.validate().is_ok());

        m.resolution = Resolution::FiveMinutes;
        assert!(m.validate().is_err());

        m.max_time = m.min_time + Resolution::Raw.downsample_range().unwrap();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_sources() {
        let mut m = raw_meta(0, 1000, 10);
        m.sources.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_until_next_downsampling() {
        let m = raw_meta(0, 2 * 60 * 60 * 1000, 10);
        let left = until_next_downsampling(&m).unwrap();
        assert_eq!(left.num_hours(), 38);

        let mut hourly = raw_meta(0, 1000, 10);
        hourly.resolution = Resolution::OneHour;
        assert!(until_next_downsampling(&hourly).is_err());
    }

    #[test]
    fn test_simulated_ids_are_deterministic_and_ordered() {
        assert_eq!(BlockId::simulated(7), BlockId::simulated(7));
        assert!(BlockId::simulated(1) < BlockId::simulated(2));
    }

    #[test]
    fn test_meta_json_round_trip() {
        let m = raw_meta(0, 1000, 10);
        let raw = serde_json::to_vec(&m).unwrap();
        let back: BlockMeta = serde_json::from_slice(&raw).unwrap();
        assert_eq!(m, back);
    }
}
