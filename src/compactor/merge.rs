//! Default merge engine over local block directories

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::planner::{BlockPopulator, MergeEngine};
use crate::block::{
    BlockId, BlockIndex, BlockMeta, SeriesIndex, CHUNKS_DIR, TOMBSTONES_FILENAME,
};
use crate::clock::BlockClock;
use crate::{Error, Result};

/// Merges block directories into a single larger block. Inputs that are all
/// empty produce no output at all, which the state machine turns into
/// retirement of the empty sources.
pub struct DefaultMergeEngine {
    clock: Arc<BlockClock>,
}

impl DefaultMergeEngine {
    pub fn new(clock: Arc<BlockClock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl MergeEngine for DefaultMergeEngine {
    async fn merge(
        &self,
        dest_dir: &Path,
        source_dirs: &[PathBuf],
        populator: Arc<dyn BlockPopulator>,
    ) -> Result<Vec<BlockId>> {
        if source_dirs.is_empty() {
            return Err(Error::Compaction("no source directories to merge".to_string()));
        }

        let mut inputs = Vec::with_capacity(source_dirs.len());
        for dir in source_dirs {
            let meta = BlockMeta::read_from_dir(dir).await?;
            let index = BlockIndex::read_from_dir(dir).await?;
            inputs.push((dir.clone(), meta, index));
        }

        if inputs.iter().all(|(_, meta, _)| meta.num_samples == 0) {
            debug!("all merge inputs are empty; writing no block");
            return Ok(Vec::new());
        }

        let metas: Vec<&BlockMeta> = inputs.iter().map(|(_, m, _)| m).collect();
        let new_id = self.clock.new_block_id();
        let new_meta = BlockMeta::merged(new_id, &metas);

        let bdir = dest_dir.join(new_id.to_string());
        tokio::fs::create_dir_all(bdir.join(CHUNKS_DIR)).await?;

        // Segment files from different inputs share names; chunks are copied
        // under fresh sequential names and refs rewritten to match.
        let mut next_segment = 0u64;
        let mut renamed: HashMap<(usize, String), String> = HashMap::new();
        let mut all_series: Vec<SeriesIndex> = Vec::new();
        for (input_idx, (dir, _, index)) in inputs.iter().enumerate() {
            for series in &index.series {
                let mut chunks = Vec::with_capacity(series.chunks.len());
                for chunk in &series.chunks {
                    let key = (input_idx, chunk.segment.clone());
                    let segment = match renamed.get(&key) {
                        Some(name) => name.clone(),
                        None => {
                            next_segment += 1;
                            let name = format!("{next_segment:06}");
                            tokio::fs::copy(
                                dir.join(CHUNKS_DIR).join(&chunk.segment),
                                bdir.join(CHUNKS_DIR).join(&name),
                            )
                            .await?;
                            renamed.insert(key, name.clone());
                            name
                        }
                    };
                    let mut rewritten = chunk.clone();
                    rewritten.segment = segment;
                    chunks.push(rewritten);
                }
                all_series.push(SeriesIndex {
                    labels: series.labels.clone(),
                    chunks,
                });
            }
        }

        let series = populator.populate(all_series)?;

        // Coalescing may have dropped chunk refs; remove segment files
        // nothing references anymore.
        let referenced: std::collections::HashSet<&str> = series
            .iter()
            .flat_map(|s| s.chunks.iter().map(|c| c.segment.as_str()))
            .collect();
        for name in renamed.values() {
            if !referenced.contains(name.as_str()) {
                tokio::fs::remove_file(bdir.join(CHUNKS_DIR).join(name)).await?;
            }
        }

        BlockIndex { series }.write_to_dir(&bdir).await?;
        new_meta.write_to_dir(&bdir).await?;
        // Merging never carries tombstones forward; an empty file marks that.
        tokio::fs::write(bdir.join(TOMBSTONES_FILENAME), b"{}").await?;

        debug!(result_block = %new_id, inputs = source_dirs.len(), "merged blocks");
        Ok(vec![new_id])
    }
}

#[cfg(test)]
mod tests {
    use super::super::planner::DefaultBlockPopulator;
    use super::*;
    use crate::block::testutil::raw_meta;
    use crate::block::ChunkRef;
    use std::collections::BTreeMap;

    async fn write_block(dir: &Path, meta: &BlockMeta) {
        tokio::fs::create_dir_all(dir.join(CHUNKS_DIR)).await.unwrap();
        let chunks = if meta.num_samples > 0 {
            tokio::fs::write(dir.join(CHUNKS_DIR).join("000001"), b"data")
                .await
                .unwrap();
            vec![ChunkRef {
                segment: "000001".to_string(),
                min_time: meta.min_time,
                max_time: meta.max_time - 1,
                samples: meta.num_samples,
                size_bytes: 4,
            }]
        } else {
            Vec::new()
        };
        BlockIndex {
            series: if chunks.is_empty() {
                Vec::new()
            } else {
                vec![SeriesIndex {
                    labels: BTreeMap::from([("series".to_string(), "cpu".to_string())]),
                    chunks,
                }]
            },
        }
        .write_to_dir(dir)
        .await
        .unwrap();
        meta.write_to_dir(dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_produces_union_block() {
        let tmp = tempfile::tempdir().unwrap();
        let a = raw_meta(0, 7_200_000, 100);
        let b = raw_meta(7_200_000, 14_400_000, 100);
        let dir_a = tmp.path().join("a");
        let dir_b = tmp.path().join("b");
        write_block(&dir_a, &a).await;
        write_block(&dir_b, &b).await;

        let engine = DefaultMergeEngine::new(Arc::new(BlockClock::default()));
        let ids = engine
            .merge(
                tmp.path(),
                &[dir_a, dir_b],
                Arc::new(DefaultBlockPopulator),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let bdir = tmp.path().join(ids[0].to_string());
        let merged = BlockMeta::read_from_dir(&bdir).await.unwrap();
        assert_eq!(merged.min_time, 0);
        assert_eq!(merged.max_time, 14_400_000);
        assert_eq!(merged.num_samples, 200);
        assert_eq!(merged.compaction_level, 2);
        assert!(bdir.join(TOMBSTONES_FILENAME).exists());

        // Identical series from both inputs collapse into one entry with
        // both chunks, under rewritten segment names.
        let index = BlockIndex::read_from_dir(&bdir).await.unwrap();
        assert_eq!(index.series.len(), 1);
        assert_eq!(index.series[0].chunks.len(), 2);
        for chunk in &index.series[0].chunks {
            assert!(bdir.join(CHUNKS_DIR).join(&chunk.segment).exists());
        }
    }

    #[tokio::test]
    async fn test_all_empty_inputs_write_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let a = raw_meta(0, 1000, 0);
        let b = raw_meta(1000, 2000, 0);
        let dir_a = tmp.path().join("a");
        let dir_b = tmp.path().join("b");
        write_block(&dir_a, &a).await;
        write_block(&dir_b, &b).await;

        let engine = DefaultMergeEngine::new(Arc::new(BlockClock::default()));
        let ids = engine
            .merge(
                tmp.path(),
                &[dir_a, dir_b],
                Arc::new(DefaultBlockPopulator),
            )
            .await
            .unwrap();
        assert!(ids.is_empty());
    }
}
