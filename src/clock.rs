//! Time source for minting block IDs
//!
//! Block IDs encode their creation time and the engine relies on later IDs
//! sorting after earlier ones, for deterministic tie-breaking and for
//! telling a compaction output apart from its inputs. A raw wall clock can
//! step backward under NTP adjustment, so the clock hands out strictly
//! increasing timestamps instead.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::block::BlockId;

/// Hands out strictly increasing millisecond timestamps and block IDs
/// stamped with them. IDs minted by one clock never sort before an ID it
/// minted earlier, even across a wall-clock step.
#[derive(Debug, Default)]
pub struct BlockClock {
    last_ms: AtomicI64,
}

impl BlockClock {
    pub fn new() -> Self {
        Self {
            last_ms: AtomicI64::new(0),
        }
    }

    /// Current time in milliseconds since epoch, bumped past the last value
    /// this clock returned if the wall clock went backward.
    pub fn now_millis(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut claimed = wall;
        let _ = self
            .last_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                claimed = wall.max(last + 1);
                Some(claimed)
            });
        claimed
    }

    /// Mints a fresh block ID stamped with [`now_millis`](Self::now_millis),
    /// so IDs from one process sort by creation order.
    pub fn new_block_id(&self) -> BlockId {
        BlockId::new(self.now_millis() as u64)
    }
}
