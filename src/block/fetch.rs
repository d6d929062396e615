//! Metadata fetch and filter contracts
//!
//! The syncer consumes these traits; production fetchers scan the bucket,
//! tests substitute in-memory fakes.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::{BlockId, BlockMeta, DeletionMark};
use crate::Result;

/// One consistent view of the bucket's blocks.
#[derive(Debug, Clone, Default)]
pub struct FetchedMetas {
    /// Complete, usable blocks.
    pub metas: HashMap<BlockId, BlockMeta>,
    /// Blocks currently unusable, with the reason (e.g. still uploading).
    pub partial: HashMap<BlockId, String>,
}

/// Produces the current view of the bucket's block metadata.
#[async_trait]
pub trait MetaFetcher: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<FetchedMetas>;
}

/// Reports blocks whose data is a strict subset of some surviving block's
/// sources at an equal or higher compaction level. Must be refreshed by the
/// most recent fetch before garbage collection consults it.
pub trait DeduplicateFilter: Send + Sync {
    fn duplicate_ids(&self) -> Vec<BlockId>;
}

/// Reports blocks already carrying a deletion marker as of the last fetch.
pub trait DeletionMarkFilter: Send + Sync {
    fn deletion_marks(&self) -> HashMap<BlockId, DeletionMark>;
}

/// A pass over fetched metas. Filters may remove entries or merely observe
/// them (the no-compact gatherer observes without removing).
#[async_trait]
pub trait MetadataFilter: Send + Sync {
    async fn filter(
        &self,
        cancel: &CancellationToken,
        metas: &mut HashMap<BlockId, BlockMeta>,
    ) -> Result<()>;
}
