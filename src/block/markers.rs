//! Deletion and no-compact markers
//!
//! Small JSON objects written next to a block. A deletion marker tells the
//! external reaper the block may be removed; the engine itself never deletes
//! block objects. A no-compact marker tells this engine to leave the block
//! out of planning.

use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::BlockId;
use crate::{Error, Result};

pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
pub const NO_COMPACT_MARK_FILENAME: &str = "no-compact-mark.json";

const MARKER_VERSION: u32 = 1;

/// Marker telling external reapers a block may be physically deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: BlockId,
    /// Unix seconds at which the marker was written.
    pub deletion_time: i64,
    pub reason: String,
    pub version: u32,
}

/// Operator- or engine-placed marker excluding a block from compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoCompactMark {
    pub id: BlockId,
    /// Unix seconds at which the marker was written.
    pub no_compact_time: i64,
    pub reason: String,
    #[serde(default)]
    pub details: String,
    pub version: u32,
}

/// Why reading a marker failed. Callers treat absence, corruption and store
/// failures differently, so they stay distinguishable.
#[derive(Debug, thiserror::Error)]
pub enum MarkerReadError {
    #[error("marker not found")]
    NotFound,
    #[error("malformed marker: {0}")]
    Unmarshal(String),
    #[error("read marker: {0}")]
    Store(#[from] object_store::Error),
}

fn marker_path(id: BlockId, filename: &str) -> ObjectPath {
    ObjectPath::from(format!("{id}/{filename}"))
}

/// Reads and decodes the marker object `<id>/<filename>`.
pub async fn read_marker<T: serde::de::DeserializeOwned>(
    bucket: &dyn ObjectStore,
    id: BlockId,
    filename: &str,
) -> std::result::Result<T, MarkerReadError> {
    let raw = match bucket.get(&marker_path(id, filename)).await {
        Ok(r) => r.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Err(MarkerReadError::NotFound),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw).map_err(|e| MarkerReadError::Unmarshal(e.to_string()))
}

/// Writes a deletion marker for `id` with the given reason. Marking an
/// already-marked block is a success no-op; an unreadable existing marker is
/// surfaced instead of silently overwritten. Returns whether a new marker was
/// written.
pub async fn mark_for_deletion(
    bucket: &dyn ObjectStore,
    id: BlockId,
    reason: &str,
) -> Result<bool> {
    match read_marker::<DeletionMark>(bucket, id, DELETION_MARK_FILENAME).await {
        Ok(_) => {
            info!(block = %id, "block already marked for deletion");
            return Ok(false);
        }
        Err(MarkerReadError::NotFound) => {}
        Err(MarkerReadError::Unmarshal(e)) => {
            return Err(Error::Meta(format!(
                "existing deletion marker for {id} is unreadable: {e}"
            )));
        }
        Err(MarkerReadError::Store(e)) => return Err(e.into()),
    }

    let mark = DeletionMark {
        id,
        deletion_time: chrono::Utc::now().timestamp(),
        reason: reason.to_string(),
        version: MARKER_VERSION,
    };
    let raw = serde_json::to_vec(&mark)?;
    bucket
        .put(&marker_path(id, DELETION_MARK_FILENAME), PutPayload::from(raw))
        .await?;
    info!(block = %id, reason = reason, "marked block for deletion");
    Ok(true)
}

/// Writes a no-compact marker for `id`. Same idempotence contract as
/// [`mark_for_deletion`].
pub async fn mark_for_no_compact(
    bucket: &dyn ObjectStore,
    id: BlockId,
    reason: &str,
    details: &str,
) -> Result<bool> {
    match read_marker::<NoCompactMark>(bucket, id, NO_COMPACT_MARK_FILENAME).await {
        Ok(_) => {
            info!(block = %id, "block already marked for no compaction");
            return Ok(false);
        }
        Err(MarkerReadError::NotFound) => {}
        Err(MarkerReadError::Unmarshal(e)) => {
            return Err(Error::Meta(format!(
                "existing no-compact marker for {id} is unreadable: {e}"
            )));
        }
        Err(MarkerReadError::Store(e)) => return Err(e.into()),
    }

    let mark = NoCompactMark {
        id,
        no_compact_time: chrono::Utc::now().timestamp(),
        reason: reason.to_string(),
        details: details.to_string(),
        version: MARKER_VERSION,
    };
    let raw = serde_json::to_vec(&mark)?;
    bucket
        .put(
            &marker_path(id, NO_COMPACT_MARK_FILENAME),
            PutPayload::from(raw),
        )
        .await?;
    info!(block = %id, reason = reason, "marked block for no compaction");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_mark_for_deletion_is_idempotent() {
        let bucket = InMemory::new();
        let id = BlockId::new(1);

        assert!(mark_for_deletion(&bucket, id, "outdated block").await.unwrap());
        let first: DeletionMark = read_marker(&bucket, id, DELETION_MARK_FILENAME)
            .await
            .unwrap();

        // Second call is a no-op and leaves the original marker in place.
        assert!(!mark_for_deletion(&bucket, id, "some other reason").await.unwrap());
        let second: DeletionMark = read_marker(&bucket, id, DELETION_MARK_FILENAME)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.reason, "outdated block");
    }

    #[tokio::test]
    async fn test_corrupt_existing_marker_is_an_error() {
        let bucket = InMemory::new();
        let id = BlockId::new(2);
        bucket
            .put(
                &marker_path(id, DELETION_MARK_FILENAME),
                PutPayload::from_static(b"{not json"),
            )
            .await
            .unwrap();

        let err = mark_for_deletion(&bucket, id, "outdated block")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreadable"));
    }

    #[tokio::test]
    async fn test_read_marker_distinguishes_not_found() {
        let bucket = InMemory::new();
        let id = BlockId::new(3);
        let err = read_marker::<NoCompactMark>(&bucket, id, NO_COMPACT_MARK_FILENAME)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkerReadError::NotFound));
    }

    #[tokio::test]
    async fn test_no_compact_marker_round_trip() {
        let bucket = InMemory::new();
        let id = BlockId::new(4);
        mark_for_no_compact(&bucket, id, "block with out-of-order chunks", "details")
            .await
            .unwrap();

        let mark: NoCompactMark = read_marker(&bucket, id, NO_COMPACT_MARK_FILENAME)
            .await
            .unwrap();
        assert_eq!(mark.id, id);
        assert_eq!(mark.reason, "block with out-of-order chunks");
        assert_eq!(mark.version, MARKER_VERSION);
    }
}
