//! Per-group compaction state machine
//!
//! One `Group` owns the blocks sharing a label set and resolution for the
//! duration of a pass. `compact` drives a single plan through download,
//! verification, merge, output validation, upload and source retirement,
//! holding the group lock throughout so operations within a group stay
//! strictly sequential.

use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use object_store::ObjectStore;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{CompactError, CompactResult};
use super::grouper::CompactionCounters;
use super::planner::{
    BlockDeletableChecker, CompactionLifecycleCallback, MergeEngine, Planner,
};
use super::telemetry;
use super::MARK_DELETION_DEADLINE;
use crate::block::{
    find_overlapping, gather_index_health_stats, BlockId, BlockMeta, BlockSource, BlockStore,
    IndexStats, Labels, Resolution, TOMBSTONES_FILENAME,
};
use crate::{Error, Result};

const DELETION_REASON_COMPACTED: &str = "source of compacted block";

/// A set of blocks with identical external labels and downsample resolution.
/// Those blocks generally contain the same series and can thus efficiently
/// be compacted together.
pub struct Group {
    store: BlockStore,
    key: String,
    labels: Labels,
    resolution: Resolution,
    metas: Mutex<Vec<BlockMeta>>,
    accept_malformed_index: bool,
    enable_vertical_compaction: bool,
    counters: Arc<CompactionCounters>,
    compact_blocks_fetch_concurrency: usize,
    extensions: std::sync::RwLock<Option<serde_json::Value>>,
}

impl Group {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket: Arc<dyn ObjectStore>,
        key: String,
        labels: Labels,
        resolution: Resolution,
        accept_malformed_index: bool,
        enable_vertical_compaction: bool,
        counters: Arc<CompactionCounters>,
        block_files_concurrency: usize,
        compact_blocks_fetch_concurrency: usize,
    ) -> Result<Group> {
        if compact_blocks_fetch_concurrency == 0 {
            return Err(Error::Config(
                "block fetch concurrency must be > 0".to_string(),
            ));
        }
        Ok(Group {
            store: BlockStore::new(bucket, block_files_concurrency)?,
            key,
            labels,
            resolution,
            metas: Mutex::new(Vec::new()),
            accept_malformed_index,
            enable_vertical_compaction,
            counters,
            compact_blocks_fetch_concurrency,
            extensions: std::sync::RwLock::new(None),
        })
    }

    /// Identifier of the group, unique per (labels, resolution).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn vertical_compaction_enabled(&self) -> bool {
        self.enable_vertical_compaction
    }

    /// Opaque payload handed to the planner and attached to output metas.
    pub fn extensions(&self) -> Option<serde_json::Value> {
        self.extensions.read().unwrap().clone()
    }

    pub fn set_extensions(&self, extensions: Option<serde_json::Value>) {
        *self.extensions.write().unwrap() = extensions;
    }

    /// Adds a block to the group, keeping members ordered by min time with
    /// ties broken by block ID.
    pub async fn append_meta(&self, meta: BlockMeta) -> Result<()> {
        if meta.labels != self.labels {
            return Err(Error::Meta(format!(
                "block {} and group labels do not match",
                meta.id
            )));
        }
        if meta.resolution != self.resolution {
            return Err(Error::Meta(format!(
                "block {} and group resolution do not match",
                meta.id
            )));
        }

        let mut metas = self.metas.lock().await;
        metas.push(meta);
        metas.sort_by_key(|m| (m.min_time, m.id));
        Ok(())
    }

    /// All block IDs in the group, sorted.
    pub async fn ids(&self) -> Vec<BlockId> {
        let metas = self.metas.lock().await;
        let mut ids: Vec<BlockId> = metas.iter().map(|m| m.id).collect();
        ids.sort();
        ids
    }

    /// Copy of the group's members, ordered by min time.
    pub async fn metas_by_min_time(&self) -> Vec<BlockMeta> {
        self.metas.lock().await.clone()
    }

    /// Min time across the group's blocks; `i64::MAX` when empty.
    pub async fn min_time(&self) -> i64 {
        let metas = self.metas.lock().await;
        metas.first().map(|m| m.min_time).unwrap_or(i64::MAX)
    }

    /// Max time across the group's blocks; `i64::MIN` when empty.
    pub async fn max_time(&self) -> i64 {
        let metas = self.metas.lock().await;
        metas.iter().map(|m| m.max_time).max().unwrap_or(i64::MIN)
    }

    /// Plans and runs a single compaction against the group, uploading the
    /// result into the bucket the blocks came from. Returns whether the
    /// planner is likely to find more work after a snapshot refresh, plus the
    /// IDs of any blocks produced.
    pub async fn compact(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        planner: &dyn Planner,
        engine: &dyn MergeEngine,
        deletable_checker: &dyn BlockDeletableChecker,
        lifecycle: &dyn CompactionLifecycleCallback,
    ) -> CompactResult<(bool, Vec<BlockId>)> {
        self.counters.runs_started.fetch_add(1, Ordering::Relaxed);
        telemetry::record_run_started(self.resolution);

        let subdir = dir.join(self.key());
        if let Err(e) = tokio::fs::create_dir_all(&subdir).await {
            return Err(CompactError::Other(Error::Compaction(format!(
                "create compaction group dir: {e}"
            ))));
        }

        let result = AssertUnwindSafe(self.compact_inner(
            cancel,
            &subdir,
            planner,
            engine,
            deletable_checker,
            lifecycle,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let ids: Vec<String> = match self.metas.try_lock() {
                Ok(metas) => metas.iter().map(|m| m.id.to_string()).collect(),
                Err(_) => Vec::new(),
            };
            Err(CompactError::Other(Error::Compaction(format!(
                "panicked while compacting {}: {}",
                ids.join(","),
                panic_message(&panic)
            ))))
        });

        match &result {
            Ok(_) => {
                self.counters.runs_completed.fetch_add(1, Ordering::Relaxed);
                telemetry::record_run_completed(self.resolution);
                // Leave the work directory only on failure, for post-mortem
                // and to avoid re-downloading on the next attempt.
                if let Err(e) = tokio::fs::remove_dir_all(&subdir).await {
                    warn!(path = %subdir.display(), error = %e, "failed to remove compaction group work directory");
                }
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                telemetry::record_compaction_failure(self.resolution);
            }
        }
        result
    }

    async fn compact_inner(
        &self,
        cancel: &CancellationToken,
        subdir: &Path,
        planner: &dyn Planner,
        engine: &dyn MergeEngine,
        deletable_checker: &dyn BlockDeletableChecker,
        lifecycle: &dyn CompactionLifecycleCallback,
    ) -> CompactResult<(bool, Vec<BlockId>)> {
        // The lock is held for the whole compaction; within a group nothing
        // runs concurrently.
        let metas = self.metas.lock().await;

        let overlaps = find_overlapping(&metas);
        let overlapping_blocks = if overlaps.is_empty() {
            false
        } else {
            if !self.enable_vertical_compaction {
                return Err(CompactError::halt(Error::Compaction(format!(
                    "pre compaction overlap check: {}",
                    overlaps.join("; ")
                ))));
            }
            true
        };

        let extensions = self.extensions();
        let to_compact = planner
            .plan(&metas, extensions.as_ref())
            .await
            .map_err(|e| CompactError::retry(Error::Plan(format!("plan compaction: {e}"))))?;
        if to_compact.is_empty() {
            // Nothing to do.
            return Ok((false, Vec::new()));
        }

        let plan_ids: Vec<String> = to_compact.iter().map(|m| m.id.to_string()).collect();
        info!(group = self.key(), plan = ?plan_ids, "compaction available and planned; downloading blocks");

        lifecycle
            .pre_compaction(self, &to_compact)
            .await
            .map_err(|e| e.context("pre compaction callback"))?;

        let download_futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = CompactResult<()>> + Send + '_>>,
        > = to_compact
            .iter()
            .map(|meta| Box::pin(self.download_and_verify(cancel, subdir, meta)) as _)
            .collect();
        stream::iter(download_futures)
            .buffer_unordered(self.compact_blocks_fetch_concurrency)
            .try_collect::<Vec<_>>()
            .await?;

        let to_compact_dirs: Vec<PathBuf> = to_compact
            .iter()
            .map(|m| subdir.join(m.id.to_string()))
            .collect();
        info!(group = self.key(), blocks = ?plan_ids, "downloaded and verified blocks; merging");

        let populator = lifecycle.block_populator(self);
        let new_ids = engine
            .merge(subdir, &to_compact_dirs, populator)
            .await
            .map_err(|e| {
                CompactError::halt(Error::Compaction(format!(
                    "merge blocks {plan_ids:?}: {e}"
                )))
            })?;

        if new_ids.is_empty() {
            // Every merged input carried no samples; retire the empty ones.
            info!(group = self.key(), blocks = ?plan_ids, "no blocks written, deleting empty source blocks");
            for meta in &to_compact {
                if meta.num_samples == 0 {
                    if let Err(e) = self
                        .delete_block(meta.id, &subdir.join(meta.id.to_string()), deletable_checker)
                        .await
                    {
                        warn!(block = %meta.id, error = %e, "failed to mark empty source block for deletion");
                    }
                }
            }
            // No output, but the group may still have more work.
            return Ok((true, Vec::new()));
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        if overlapping_blocks {
            self.counters
                .vertical_compactions
                .fetch_add(1, Ordering::Relaxed);
        }
        telemetry::record_compaction(self.resolution, overlapping_blocks);

        for new_id in &new_ids {
            let bdir = subdir.join(new_id.to_string());
            self.finalize_output(&metas, &to_compact, *new_id, &bdir, extensions.as_ref())
                .await?;

            self.store
                .upload_block(cancel, &bdir)
                .await
                .map_err(|e| {
                    CompactError::retry(Error::Compaction(format!("upload of {new_id} failed: {e}")))
                })?;
            info!(group = self.key(), result_block = %new_id, "uploaded block");

            lifecycle.post_compaction(self, *new_id).await.map_err(|e| {
                CompactError::retry(Error::Compaction(format!(
                    "post compaction callback for result block {new_id}: {e}"
                )))
            })?;
        }

        // Mark the compacted inputs deletable so they stay out of the next
        // planning cycle; the uploaded result gets synced in on a later pass.
        for meta in &to_compact {
            self.delete_block(meta.id, &subdir.join(meta.id.to_string()), deletable_checker)
                .await
                .map_err(|e| {
                    CompactError::retry(Error::Compaction(format!(
                        "mark old block {} for deletion from bucket: {e}",
                        meta.id
                    )))
                })?;
            self.counters
                .source_blocks_deleted
                .fetch_add(1, Ordering::Relaxed);
            telemetry::record_garbage_collected_block();
        }

        info!(group = self.key(), result_blocks = ?new_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(), "finished compacting blocks");
        Ok((true, new_ids))
    }

    /// Downloads one planned block and verifies its index, classifying each
    /// diagnosis into the error taxonomy.
    async fn download_and_verify(
        &self,
        cancel: &CancellationToken,
        subdir: &Path,
        meta: &BlockMeta,
    ) -> CompactResult<()> {
        let bdir = subdir.join(meta.id.to_string());
        self.store
            .download_block(cancel, meta.id, &bdir)
            .await
            .map_err(|e| {
                CompactError::retry(Error::Compaction(format!(
                    "download block {}: {e}",
                    meta.id
                )))
            })?;
        debug!(group = self.key(), block = %meta.id, "downloaded block");

        let stats = gather_index_health_stats(&bdir, meta.min_time, meta.max_time)
            .await
            .map_err(|e| {
                CompactError::Other(Error::Compaction(format!(
                    "gather index issues for block {}: {e}",
                    meta.id
                )))
            })?;

        if let Err(e) = stats.critical_err() {
            return Err(CompactError::halt(Error::Compaction(format!(
                "block {} with unhealthy index found; compaction level {}: {e}",
                meta.id, meta.compaction_level
            ))));
        }
        if let Err(e) = stats.out_of_order_chunks_err() {
            return Err(CompactError::OutOfOrderChunks {
                id: meta.id,
                source: e,
            });
        }
        if let Err(e) = stats.outside_chunks_err() {
            return Err(CompactError::Reparable {
                id: meta.id,
                source: e,
            });
        }
        if let Err(e) = stats.out_of_order_labels_err() {
            if !self.accept_malformed_index {
                return Err(CompactError::Other(Error::Compaction(format!(
                    "block {}: {e}",
                    meta.id
                ))));
            }
        }
        debug!(group = self.key(), block = %meta.id, "verified block");
        Ok(())
    }

    /// Validates a freshly merged block and stamps it with the group's
    /// identity before upload.
    async fn finalize_output(
        &self,
        group_metas: &[BlockMeta],
        to_compact: &[BlockMeta],
        new_id: BlockId,
        bdir: &Path,
        extensions: Option<&serde_json::Value>,
    ) -> CompactResult<()> {
        tokio::fs::remove_file(bdir.join(TOMBSTONES_FILENAME))
            .await
            .map_err(|e| {
                CompactError::Other(Error::Compaction(format!("remove tombstones: {e}")))
            })?;

        let mut new_meta = BlockMeta::read_from_dir(bdir).await.map_err(|e| {
            CompactError::Other(Error::Compaction(format!("read new meta: {e}")))
        })?;

        let health = match gather_index_health_stats(bdir, new_meta.min_time, new_meta.max_time)
            .await
        {
            Ok(stats) => stats.any_err().map(|_| stats),
            Err(e) => Err(e),
        };
        let stats = match health {
            Ok(stats) => Some(stats),
            Err(e) => {
                if !self.accept_malformed_index {
                    return Err(CompactError::halt(Error::Compaction(format!(
                        "invalid result block {new_id}: {e}"
                    ))));
                }
                None
            }
        };

        new_meta.labels = self.labels.clone();
        new_meta.resolution = self.resolution;
        new_meta.source = Some(BlockSource::Compactor);
        new_meta.extensions = extensions.cloned();
        if let Some(stats) = stats {
            new_meta.index_stats = IndexStats {
                chunk_max_size: stats.chunk_max_size,
                series_max_size: stats.series_max_size,
            };
        }
        new_meta.write_to_dir(bdir).await.map_err(|e| {
            CompactError::Other(Error::Compaction(format!(
                "failed to finalize the block {new_id}: {e}"
            )))
        })?;

        // The output must not overlap anything the group still holds, unless
        // vertical compaction is allowed to resolve such overlaps later.
        if !self.enable_vertical_compaction {
            let exclude: HashSet<BlockId> = to_compact.iter().map(|m| m.id).collect();
            let mut survivors: Vec<BlockMeta> = group_metas
                .iter()
                .filter(|m| !exclude.contains(&m.id))
                .cloned()
                .collect();
            survivors.push(new_meta);
            let overlaps = find_overlapping(&survivors);
            if !overlaps.is_empty() {
                return Err(CompactError::halt(Error::Compaction(format!(
                    "resulted compacted block {new_id} overlaps with something: {}",
                    overlaps.join("; ")
                ))));
            }
        }
        Ok(())
    }

    /// Removes the local copy of a block and, unless vetoed, marks it
    /// deletable in the bucket under a fresh deadline.
    async fn delete_block(
        &self,
        id: BlockId,
        bdir: &Path,
        deletable_checker: &dyn BlockDeletableChecker,
    ) -> Result<()> {
        if tokio::fs::try_exists(bdir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(bdir).await?;
        }

        if deletable_checker.can_delete(self, id) {
            info!(group = self.key(), old_block = %id, "marking compacted block for deletion");
            let bucket = self.store.bucket();
            tokio::time::timeout(
                MARK_DELETION_DEADLINE,
                crate::block::mark_for_deletion(bucket.as_ref(), id, DELETION_REASON_COMPACTED),
            )
            .await
            .map_err(|_| Error::Timeout)??;
            telemetry::record_block_marked_for_deletion(DELETION_REASON_COMPACTED);
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
