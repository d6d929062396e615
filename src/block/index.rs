//! Block index format and health checks
//!
//! The index lists every series in a block together with references to the
//! chunk segments holding its samples. Health checks run over the index
//! before a block is admitted into a compaction and after one is produced;
//! the diagnoses drive the error classification of the compactor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use super::{BlockMeta, BlockSource, Labels, CHUNKS_DIR, INDEX_FILENAME};
use crate::{Error, Result};

/// Reference to one chunk of samples inside a segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Segment file under `chunks/` holding the samples.
    pub segment: String,
    pub min_time: i64,
    pub max_time: i64,
    pub samples: u64,
    pub size_bytes: u64,
}

/// One series and its chunks, ordered by time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesIndex {
    pub labels: Labels,
    pub chunks: Vec<ChunkRef>,
}

/// Index of every series in a block. Series are sorted by label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub series: Vec<SeriesIndex>,
}

impl BlockIndex {
    pub async fn read_from_dir(dir: &Path) -> Result<BlockIndex> {
        let raw = tokio::fs::read(dir.join(INDEX_FILENAME)).await?;
        let index: BlockIndex = serde_json::from_slice(&raw)
            .map_err(|e| Error::IndexHealth(format!("unreadable index in {dir:?}: {e}")))?;
        Ok(index)
    }

    pub async fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(INDEX_FILENAME), raw).await?;
        Ok(())
    }
}

/// Outcome of scanning a block index. Each diagnosis is independent; callers
/// decide severity by which accessor they consult.
#[derive(Debug, Default)]
pub struct IndexHealthStats {
    pub total_series: u64,
    pub total_chunks: u64,
    pub chunk_max_size: u64,
    pub series_max_size: u64,

    critical: Vec<String>,
    out_of_order_chunks: Vec<String>,
    outside_chunks: Vec<String>,
    out_of_order_labels: Vec<String>,
}

impl IndexHealthStats {
    /// Structural corruption that no amount of retrying or repairing fixes.
    pub fn critical_err(&self) -> Result<()> {
        Self::err_of("critical", &self.critical)
    }

    /// Chunks of one series unsorted or overlapping in time.
    pub fn out_of_order_chunks_err(&self) -> Result<()> {
        Self::err_of("out-of-order chunks", &self.out_of_order_chunks)
    }

    /// Chunks lying entirely outside the block's time range. The block is
    /// broken but can be rebuilt by dropping them.
    pub fn outside_chunks_err(&self) -> Result<()> {
        Self::err_of("chunks outside block range", &self.outside_chunks)
    }

    /// Series out of lexicographic label order.
    pub fn out_of_order_labels_err(&self) -> Result<()> {
        Self::err_of("out-of-order label sets", &self.out_of_order_labels)
    }

    /// First failing diagnosis in severity order, or Ok.
    pub fn any_err(&self) -> Result<()> {
        self.critical_err()?;
        self.out_of_order_chunks_err()?;
        self.outside_chunks_err()?;
        self.out_of_order_labels_err()?;
        Ok(())
    }

    fn err_of(kind: &str, found: &[String]) -> Result<()> {
        if found.is_empty() {
            return Ok(());
        }
        Err(Error::IndexHealth(format!(
            "{kind}: {} issue(s): {}",
            found.len(),
            found.join("; ")
        )))
    }
}

/// Scans the index of the block in `dir` against its declared time range
/// `[min_time, max_time)` and gathers every diagnosis plus size statistics.
pub async fn gather_index_health_stats(
    dir: &Path,
    min_time: i64,
    max_time: i64,
) -> Result<IndexHealthStats> {
    let index = BlockIndex::read_from_dir(dir).await?;
    let mut stats = IndexHealthStats {
        total_series: index.series.len() as u64,
        ..Default::default()
    };

    let mut prev_labels: Option<&Labels> = None;
    for series in &index.series {
        let series_label = render_labels(&series.labels);
        if let Some(prev) = prev_labels {
            if prev >= &series.labels {
                stats
                    .out_of_order_labels
                    .push(format!("series {series_label} sorts before its predecessor"));
            }
        }
        prev_labels = Some(&series.labels);

        if series.chunks.is_empty() {
            stats
                .critical
                .push(format!("series {series_label} has no chunks"));
            continue;
        }

        let series_size: u64 = series.chunks.iter().map(|c| c.size_bytes).sum();
        stats.series_max_size = stats.series_max_size.max(series_size);

        let mut prev_chunk: Option<&ChunkRef> = None;
        for chunk in &series.chunks {
            stats.total_chunks += 1;
            stats.chunk_max_size = stats.chunk_max_size.max(chunk.size_bytes);

            if chunk.min_time > chunk.max_time {
                stats.critical.push(format!(
                    "series {series_label}: chunk {} has inverted range [{}, {}]",
                    chunk.segment, chunk.min_time, chunk.max_time
                ));
                continue;
            }
            if chunk.max_time < min_time || chunk.min_time >= max_time {
                stats.outside_chunks.push(format!(
                    "series {series_label}: chunk {} [{}, {}] outside block range [{min_time}, {max_time})",
                    chunk.segment, chunk.min_time, chunk.max_time
                ));
            }
            if let Some(prev) = prev_chunk {
                if chunk.min_time <= prev.max_time {
                    stats.out_of_order_chunks.push(format!(
                        "series {series_label}: chunk {} [{}, {}] starts before predecessor ends at {}",
                        chunk.segment, chunk.min_time, chunk.max_time, prev.max_time
                    ));
                }
            }
            prev_chunk = Some(chunk);
        }
    }

    Ok(stats)
}

/// Rebuilds the block in `src_dir` into `dst_dir` under `new_meta.id`,
/// dropping every chunk lying entirely outside the block's declared time
/// range. Series left without chunks are dropped; only referenced segment
/// files are carried over. Returns the rewritten meta.
pub async fn rewrite_dropping_outside_chunks(
    src_dir: &Path,
    dst_dir: &Path,
    meta: &BlockMeta,
    new_id: super::BlockId,
) -> Result<BlockMeta> {
    let index = BlockIndex::read_from_dir(src_dir).await?;

    let mut kept_series = Vec::with_capacity(index.series.len());
    let mut kept_segments: BTreeSet<String> = BTreeSet::new();
    let mut num_samples = 0u64;

    for series in index.series {
        let chunks: Vec<ChunkRef> = series
            .chunks
            .into_iter()
            .filter(|c| c.max_time >= meta.min_time && c.min_time < meta.max_time)
            .collect();
        if chunks.is_empty() {
            continue;
        }
        num_samples += chunks.iter().map(|c| c.samples).sum::<u64>();
        kept_segments.extend(chunks.iter().map(|c| c.segment.clone()));
        kept_series.push(SeriesIndex {
            labels: series.labels,
            chunks,
        });
    }

    tokio::fs::create_dir_all(dst_dir.join(CHUNKS_DIR)).await?;
    for segment in &kept_segments {
        tokio::fs::copy(
            src_dir.join(CHUNKS_DIR).join(segment),
            dst_dir.join(CHUNKS_DIR).join(segment),
        )
        .await?;
    }

    BlockIndex {
        series: kept_series,
    }
    .write_to_dir(dst_dir)
    .await?;

    let mut rewritten = meta.clone();
    rewritten.id = new_id;
    rewritten.num_samples = num_samples;
    rewritten.source = Some(BlockSource::Repair);
    rewritten.write_to_dir(dst_dir).await?;
    Ok(rewritten)
}

fn render_labels(labels: &Labels) -> String {
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", parts.join(", "))
}
