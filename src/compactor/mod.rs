//! Bucket compaction engine
//!
//! The compactor discovers blocks in the bucket, groups the compatible ones,
//! and merges overlapping or adjacent blocks into larger ones across a
//! bounded worker pool. It is responsible for:
//! - syncing a consistent snapshot of the bucket's block metadata
//! - garbage collection of blocks superseded by higher-level ones
//! - running per-group compactions until a pass finds no more work
//! - repairing reparable blocks and skipping poisoned ones

pub mod errors;
mod group;
mod grouper;
mod merge;
mod no_compact;
mod planner;
mod progress;
mod repair;
mod syncer;
mod telemetry;

pub use errors::{CompactError, CompactResult, MultiError};
pub use group::Group;
pub use grouper::{CompactionCounters, DefaultGrouper, Grouper};
pub use merge::DefaultMergeEngine;
pub use no_compact::GatherNoCompactMarkFilter;
pub use planner::{
    BlockDeletableChecker, BlockPopulator, CompactionLifecycleCallback,
    DefaultBlockDeletableChecker, DefaultBlockPopulator, DefaultCompactionLifecycleCallback,
    MergeEngine, Planner,
};
pub use progress::{
    CompactionProgressCalculator, DownsampleProgressCalculator, ProgressCalculator,
    RetentionProgressCalculator,
};
pub use repair::repair_outside_chunks;
pub use syncer::MetaSyncer;

use object_store::ObjectStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::block::mark_for_no_compact;
use crate::clock::BlockClock;
use crate::{Error, Result};

/// Deadline for deletion-marker writes, detached from the caller's
/// cancellation: a half-marked bucket on shutdown grows the duplicate-block
/// surface at the next startup.
pub(crate) const MARK_DELETION_DEADLINE: Duration = Duration::from_secs(5 * 60);

const NO_COMPACT_REASON_OOO_CHUNKS: &str = "block with out-of-order chunks";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Scratch directory holding per-group work subdirectories
    pub compact_dir: PathBuf,
    /// Number of groups compacted concurrently
    pub concurrency: usize,
    /// Per-file fan-out when the repair side channel moves a block
    pub block_files_concurrency: usize,
    /// Mark blocks with out-of-order chunks no-compact instead of failing
    /// the pass
    pub skip_blocks_with_out_of_order_chunks: bool,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            compact_dir: std::env::temp_dir().join("strata-compact"),
            concurrency: 4,
            block_files_concurrency: 8,
            skip_blocks_with_out_of_order_chunks: false,
        }
    }
}

/// Compacts the blocks of one bucket until no group reports further work.
pub struct BucketCompactor {
    bucket: Arc<dyn ObjectStore>,
    syncer: Arc<MetaSyncer>,
    grouper: Arc<dyn Grouper>,
    planner: Arc<dyn Planner>,
    engine: Arc<dyn MergeEngine>,
    deletable_checker: Arc<dyn BlockDeletableChecker>,
    lifecycle: Arc<dyn CompactionLifecycleCallback>,
    clock: Arc<BlockClock>,
    config: CompactorConfig,
    shutdown: CancellationToken,
}

impl BucketCompactor {
    /// Creates an orchestrator with the default deletable checker and
    /// lifecycle hooks.
    pub fn new(
        config: CompactorConfig,
        bucket: Arc<dyn ObjectStore>,
        syncer: Arc<MetaSyncer>,
        grouper: Arc<dyn Grouper>,
        planner: Arc<dyn Planner>,
        engine: Arc<dyn MergeEngine>,
    ) -> Result<Self> {
        Self::with_checker_and_callback(
            config,
            bucket,
            syncer,
            grouper,
            planner,
            engine,
            Arc::new(DefaultBlockDeletableChecker),
            Arc::new(DefaultCompactionLifecycleCallback),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_checker_and_callback(
        config: CompactorConfig,
        bucket: Arc<dyn ObjectStore>,
        syncer: Arc<MetaSyncer>,
        grouper: Arc<dyn Grouper>,
        planner: Arc<dyn Planner>,
        engine: Arc<dyn MergeEngine>,
        deletable_checker: Arc<dyn BlockDeletableChecker>,
        lifecycle: Arc<dyn CompactionLifecycleCallback>,
    ) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(Error::Config(
                "compaction concurrency must be > 0".to_string(),
            ));
        }
        Ok(Self {
            bucket,
            syncer,
            grouper,
            planner,
            engine,
            deletable_checker,
            lifecycle,
            clock: Arc::new(BlockClock::default()),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelling all in-flight bucket and file I/O of this compactor.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs compaction passes over the bucket until a full pass completes
    /// with every group reporting no further work, then removes the scratch
    /// directory. On error the scratch tree is kept so the next run does not
    /// re-download everything.
    pub async fn compact(&self) -> CompactResult<()> {
        loop {
            if !self.compact_pass().await? {
                break;
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.config.compact_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.config.compact_dir.display(), error = %e, "failed to remove compaction work directory");
            }
        }
        info!("compaction iterations done");
        Ok(())
    }

    /// One pass: sync, garbage-collect, group, fan out. Returns whether any
    /// group reported more work.
    async fn compact_pass(&self) -> CompactResult<bool> {
        info!("start sync of metas");
        self.syncer
            .sync_metas(&self.shutdown)
            .await
            .map_err(|e| e.context("sync"))?;

        info!("start of GC");
        // Blocks compacted away are garbage collected after each compaction,
        // but a crashed run leaves them to be resolved on startup.
        self.syncer
            .garbage_collect(&self.shutdown)
            .await
            .map_err(|e| e.context("garbage"))?;

        let groups = self
            .grouper
            .groups(&self.syncer.metas())
            .await
            .map_err(|e| {
                CompactError::Other(Error::Compaction(format!(
                    "build compaction groups: {e}"
                )))
            })?;

        self.prune_work_dir(&groups).await;

        info!("start of compactions");
        let pass_cancel = self.shutdown.child_token();
        let finished_all_groups = Arc::new(AtomicBool::new(true));

        let (group_tx, group_rx) = mpsc::channel::<Arc<Group>>(1);
        let group_rx = Arc::new(tokio::sync::Mutex::new(group_rx));
        let (err_tx, mut err_rx) = mpsc::channel::<CompactError>(self.config.concurrency);

        // Workers compact groups as they arrive until the channel closes or
        // they hit an error they cannot absorb.
        let mut workers = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency {
            workers.push(tokio::spawn(self.clone_worker(
                Arc::clone(&group_rx),
                err_tx.clone(),
                pass_cancel.clone(),
                Arc::clone(&finished_all_groups),
            )));
        }
        drop(err_tx);

        // Feed every multi-block group; stop on the first published error.
        let mut group_errs = MultiError::new();
        for group in &groups {
            // A single block has nothing to merge with.
            if group.ids().await.len() <= 1 {
                continue;
            }
            tokio::select! {
                biased;
                Some(err) = err_rx.recv() => {
                    group_errs.add(err);
                    break;
                }
                sent = group_tx.send(Arc::clone(group)) => {
                    if sent.is_err() {
                        // All workers exited; their errors are collected below.
                        break;
                    }
                }
            }
        }
        drop(group_tx);

        for worker in workers {
            if let Err(e) = worker.await {
                group_errs.add(CompactError::Other(Error::Internal(format!(
                    "compaction worker failed: {e}"
                ))));
            }
        }
        pass_cancel.cancel();

        while let Ok(err) = err_rx.try_recv() {
            group_errs.add(err);
        }
        group_errs.into_result()?;

        Ok(!finished_all_groups.load(Ordering::SeqCst))
    }

    /// Builds one worker's future: pull groups, compact, absorb reparable
    /// and skippable failures, publish the rest.
    fn clone_worker(
        &self,
        group_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Group>>>>,
        err_tx: mpsc::Sender<CompactError>,
        pass_cancel: CancellationToken,
        finished_all_groups: Arc<AtomicBool>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let bucket = Arc::clone(&self.bucket);
        let planner = Arc::clone(&self.planner);
        let engine = Arc::clone(&self.engine);
        let deletable_checker = Arc::clone(&self.deletable_checker);
        let lifecycle = Arc::clone(&self.lifecycle);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();

        async move {
            loop {
                let group = { group_rx.lock().await.recv().await };
                let Some(group) = group else { break };

                let outcome = group
                    .compact(
                        &pass_cancel,
                        &config.compact_dir,
                        planner.as_ref(),
                        engine.as_ref(),
                        deletable_checker.as_ref(),
                        lifecycle.as_ref(),
                    )
                    .await;

                let err = match outcome {
                    Ok((should_rerun, _)) => {
                        if should_rerun {
                            finished_all_groups.store(false, Ordering::SeqCst);
                        }
                        continue;
                    }
                    Err(err) => err,
                };

                if matches!(err, CompactError::Reparable { .. }) {
                    match repair_outside_chunks(
                        &pass_cancel,
                        Arc::clone(&bucket),
                        &clock,
                        config.block_files_concurrency,
                        &err,
                    )
                    .await
                    {
                        Ok(()) => {
                            finished_all_groups.store(false, Ordering::SeqCst);
                            continue;
                        }
                        Err(repair_err) => {
                            warn!(group = group.key(), error = %repair_err, "repair of broken block failed");
                        }
                    }
                }

                // A block with out-of-order chunks can be marked no-compact
                // so the next run plans around it.
                if let CompactError::OutOfOrderChunks { id, source } = &err {
                    if config.skip_blocks_with_out_of_order_chunks {
                        match mark_for_no_compact(
                            bucket.as_ref(),
                            *id,
                            NO_COMPACT_REASON_OOO_CHUNKS,
                            &source.to_string(),
                        )
                        .await
                        {
                            Ok(_) => {
                                telemetry::record_block_marked_no_compact();
                                finished_all_groups.store(false, Ordering::SeqCst);
                                continue;
                            }
                            Err(mark_err) => {
                                warn!(group = group.key(), error = %mark_err, "failed to mark block for no compaction");
                            }
                        }
                    }
                }

                let _ = err_tx
                    .send(err.context(&format!("group {}", group.key())))
                    .await;
                return;
            }
        }
    }

    /// Removes everything under the scratch directory that no current group
    /// references. Failures only cost disk space, so they are logged and
    /// ignored.
    async fn prune_work_dir(&self, groups: &[Arc<Group>]) {
        let mut keep: HashSet<PathBuf> = HashSet::new();
        for group in groups {
            let group_dir = self.config.compact_dir.join(group.key());
            for id in group.ids().await {
                keep.insert(group_dir.join(id.to_string()));
            }
            keep.insert(group_dir);
        }

        if let Err(e) = prune_except(&self.config.compact_dir, &keep).await {
            warn!(
                dir = %self.config.compact_dir.display(),
                error = %e,
                "failed deleting stale compaction work directories; disk usage may leak"
            );
        }
    }
}

async fn prune_except(root: &std::path::Path, keep: &HashSet<PathBuf>) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            tokio::fs::remove_file(&path).await?;
            continue;
        }
        if !keep.contains(&path) {
            tokio::fs::remove_dir_all(&path).await?;
            continue;
        }
        // A kept group directory may still hold block subtrees from groups
        // that no longer exist.
        let mut blocks = tokio::fs::read_dir(&path).await?;
        while let Some(block_entry) = blocks.next_entry().await? {
            let block_path = block_entry.path();
            if !keep.contains(&block_path) {
                if block_entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&block_path).await?;
                } else {
                    tokio::fs::remove_file(&block_path).await?;
                }
            }
        }
    }
    Ok(())
}
