//! Repair side channel for blocks with chunks outside their time range
//!
//! Repair never resumes an aborted compaction; it rebuilds the broken block
//! under a new ID so the next pass can proceed without it.

use object_store::ObjectStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::errors::CompactError;
use super::telemetry;
use super::MARK_DELETION_DEADLINE;
use crate::block::{
    gather_index_health_stats, mark_for_deletion, rewrite_dropping_outside_chunks, BlockMeta,
    BlockStore,
};
use crate::clock::BlockClock;
use crate::{Error, Result};

const DELETION_REASON_REPAIRED: &str = "source of repaired block";

/// Rebuilds the broken block named by a reparable error: download, drop the
/// chunks outside the block's declared range, re-validate, upload under a
/// fresh ID and mark the broken original deletable.
pub async fn repair_outside_chunks(
    cancel: &CancellationToken,
    bucket: Arc<dyn ObjectStore>,
    clock: &BlockClock,
    block_files_concurrency: usize,
    err: &CompactError,
) -> Result<()> {
    let CompactError::Reparable { id, source } = err else {
        return Err(Error::Repair(format!("not a reparable error: {err}")));
    };
    info!(block = %id, error = %source, "repairing block with chunks outside its time range");

    let scratch = std::env::temp_dir().join(format!("strata-repair-{}-{}", id, clock.now_millis()));
    tokio::fs::create_dir_all(&scratch).await?;

    let result = repair_in(cancel, bucket, clock, block_files_concurrency, *id, &scratch).await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!(path = %scratch.display(), error = %e, "failed to remove repair scratch directory");
    }
    result
}

async fn repair_in(
    cancel: &CancellationToken,
    bucket: Arc<dyn ObjectStore>,
    clock: &BlockClock,
    block_files_concurrency: usize,
    id: crate::block::BlockId,
    scratch: &std::path::Path,
) -> Result<()> {
    let store = BlockStore::new(Arc::clone(&bucket), block_files_concurrency)?;

    let bdir = scratch.join(id.to_string());
    store
        .download_block(cancel, id, &bdir)
        .await
        .map_err(|e| Error::Repair(format!("download block {id}: {e}")))?;

    let meta = BlockMeta::read_from_dir(&bdir)
        .await
        .map_err(|e| Error::Repair(format!("read meta of {id}: {e}")))?;

    let new_id = clock.new_block_id();
    let new_dir = scratch.join(new_id.to_string());
    let rewritten = rewrite_dropping_outside_chunks(&bdir, &new_dir, &meta, new_id)
        .await
        .map_err(|e| Error::Repair(format!("rewrite of block {id} failed: {e}")))?;

    // Verify the rebuilt block before letting it into the bucket.
    let stats =
        gather_index_health_stats(&new_dir, rewritten.min_time, rewritten.max_time).await?;
    stats
        .any_err()
        .map_err(|e| Error::Repair(format!("repaired block {new_id} is invalid: {e}")))?;

    info!(block = %id, new_block = %new_id, "uploading repaired block");
    store
        .upload_block(cancel, &new_dir)
        .await
        .map_err(|e| Error::Repair(format!("upload of repaired block {new_id} failed: {e}")))?;

    info!(block = %id, "marking broken block for deletion");
    // Fresh deadline detached from the caller so shutdown cannot leave a
    // half-marked block.
    tokio::time::timeout(
        MARK_DELETION_DEADLINE,
        mark_for_deletion(bucket.as_ref(), id, DELETION_REASON_REPAIRED),
    )
    .await
    .map_err(|_| Error::Timeout)?
    .map_err(|e| Error::Repair(format!("marking broken block {id} for deletion failed: {e}")))?;
    telemetry::record_block_marked_for_deletion(DELETION_REASON_REPAIRED);
    Ok(())
}
