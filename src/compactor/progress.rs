//! Progress calculators
//!
//! Side-effect-free estimators of the work left in the bucket: pending
//! compaction runs, blocks awaiting downsampling and blocks past retention.
//! Each simulates against copies and only updates gauges; none touches the
//! bucket.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::group::Group;
use super::planner::Planner;
use super::telemetry;
use crate::block::{BlockId, BlockMeta, Labels, Resolution};
use crate::clock::BlockClock;
use crate::{Error, Result};

/// Updates a gauge from the current set of groups.
#[async_trait]
pub trait ProgressCalculator: Send + Sync {
    async fn progress_calculate(&self, groups: &[Arc<Group>]) -> Result<()>;
}

/// Simulates the planner over copies of each group's metas to count how many
/// compaction runs and input blocks remain.
pub struct CompactionProgressCalculator {
    planner: Arc<dyn Planner>,
}

struct SimGroup {
    labels: Labels,
    resolution: Resolution,
    extensions: Option<serde_json::Value>,
    metas: Vec<BlockMeta>,
}

impl CompactionProgressCalculator {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }

    /// Returns `(pending_runs, pending_blocks)` and records both gauges.
    pub async fn calculate(&self, groups: &[Arc<Group>]) -> Result<(u64, u64)> {
        let mut sims = Vec::with_capacity(groups.len());
        for g in groups {
            sims.push(SimGroup {
                labels: g.labels().clone(),
                resolution: g.resolution(),
                extensions: g.extensions(),
                metas: g.metas_by_min_time().await,
            });
        }

        let mut runs = 0u64;
        let mut blocks = 0u64;
        // Synthetic IDs come from a counter; wall-clock-derived IDs could
        // collide when two plans land in the same second.
        let mut seq = 0u64;

        while !sims.is_empty() {
            let mut next_round = Vec::with_capacity(sims.len());
            for mut sim in sims {
                if sim.metas.len() <= 1 {
                    continue;
                }
                let plan = self
                    .planner
                    .plan(&sim.metas, sim.extensions.as_ref())
                    .await
                    .map_err(|e| Error::Plan(format!("could not plan: {e}")))?;
                if plan.is_empty() {
                    continue;
                }
                runs += 1;
                blocks += plan.len() as u64;

                let planned: HashSet<BlockId> = plan.iter().map(|m| m.id).collect();
                sim.metas.retain(|m| !planned.contains(&m.id));
                if sim.metas.is_empty() {
                    continue;
                }

                seq += 1;
                let inputs: Vec<&BlockMeta> = plan.iter().collect();
                let mut synthetic = BlockMeta::merged(BlockId::simulated(seq), &inputs);
                synthetic.labels = sim.labels.clone();
                synthetic.resolution = sim.resolution;
                sim.metas.push(synthetic);
                sim.metas.sort_by_key(|m| (m.min_time, m.id));
                next_round.push(sim);
            }
            sims = next_round;
        }

        telemetry::record_todo_compactions(runs, blocks);
        Ok((runs, blocks))
    }
}

#[async_trait]
impl ProgressCalculator for CompactionProgressCalculator {
    async fn progress_calculate(&self, groups: &[Arc<Group>]) -> Result<()> {
        self.calculate(groups).await.map(|_| ())
    }
}

/// Counts blocks old enough for the next downsample level whose sources are
/// not yet covered by a coarser-resolution block.
#[derive(Default)]
pub struct DownsampleProgressCalculator;

impl DownsampleProgressCalculator {
    pub fn new() -> Self {
        Self
    }

    pub async fn calculate(&self, groups: &[Arc<Group>]) -> Result<u64> {
        let mut sources_5m: HashSet<BlockId> = HashSet::new();
        let mut sources_1h: HashSet<BlockId> = HashSet::new();
        for g in groups {
            for m in g.metas_by_min_time().await {
                match m.resolution {
                    Resolution::Raw => {}
                    Resolution::FiveMinutes => sources_5m.extend(m.sources.iter().copied()),
                    Resolution::OneHour => sources_1h.extend(m.sources.iter().copied()),
                }
            }
        }

        let mut pending = 0u64;
        for g in groups {
            for m in g.metas_by_min_time().await {
                let (covered, range) = match m.resolution {
                    Resolution::Raw => (&sources_5m, Resolution::Raw.downsample_range()),
                    Resolution::FiveMinutes => {
                        (&sources_1h, Resolution::FiveMinutes.downsample_range())
                    }
                    Resolution::OneHour => continue,
                };
                let range = range.expect("raw and 5m always have a downsample range");
                if m.sources.iter().all(|s| covered.contains(s)) {
                    continue;
                }
                if m.max_time - m.min_time < range {
                    continue;
                }
                pending += 1;
            }
        }

        telemetry::record_todo_downsample_blocks(pending);
        Ok(pending)
    }
}

#[async_trait]
impl ProgressCalculator for DownsampleProgressCalculator {
    async fn progress_calculate(&self, groups: &[Arc<Group>]) -> Result<()> {
        self.calculate(groups).await.map(|_| ())
    }
}

/// Counts blocks whose max time has fallen past the retention window for
/// their resolution. A zero retention means blocks at that resolution never
/// expire.
pub struct RetentionProgressCalculator {
    retention_by_resolution: HashMap<Resolution, Duration>,
    clock: Arc<BlockClock>,
}

impl RetentionProgressCalculator {
    pub fn new(
        retention_by_resolution: HashMap<Resolution, Duration>,
        clock: Arc<BlockClock>,
    ) -> Self {
        Self {
            retention_by_resolution,
            clock,
        }
    }

    pub async fn calculate(&self, groups: &[Arc<Group>]) -> Result<u64> {
        let now_ms = self.clock.now_millis();
        let mut pending = 0u64;
        for g in groups {
            for m in g.metas_by_min_time().await {
                let retention_ms = self
                    .retention_by_resolution
                    .get(&m.resolution)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                if retention_ms == 0 {
                    continue;
                }
                if now_ms - m.max_time >= retention_ms {
                    pending += 1;
                }
            }
        }

        telemetry::record_todo_deletion_blocks(pending);
        Ok(pending)
    }
}

#[async_trait]
impl ProgressCalculator for RetentionProgressCalculator {
    async fn progress_calculate(&self, groups: &[Arc<Group>]) -> Result<()> {
        self.calculate(groups).await.map(|_| ())
    }
}
