//! # strata
//!
//! A background compaction engine for time-series block stores built on
//! object storage.
//!
//! The store holds immutable blocks in a bucket; each block covers a
//! half-open time range and carries identifying external labels plus a
//! downsample resolution. strata discovers those blocks, groups the
//! compatible ones, merges overlapping or adjacent blocks into larger ones
//! across a bounded worker pool, and garbage-collects superseded blocks,
//! while guaranteeing each source sample lands in the output at most once.
//!
//! ## Architecture
//!
//! - **MetaSyncer**: pulls the bucket's block metadata into memory,
//!   coalescing concurrent syncs onto one fetch, and retires duplicates
//! - **Grouper**: partitions blocks by (external labels, resolution)
//! - **Group**: drives one compaction through download → verify → merge →
//!   validate → upload → retire sources
//! - **BucketCompactor**: the outer loop fanning groups across workers until
//!   a pass finds no more work

pub mod block;
pub mod clock;
pub mod compactor;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::block::{BlockId, BlockMeta, BlockStore, Labels, Resolution};
    pub use crate::compactor::{
        BucketCompactor, CompactError, CompactorConfig, DefaultGrouper, DefaultMergeEngine,
        Group, MetaSyncer, Planner,
    };
    pub use crate::{Error, Result};
}
