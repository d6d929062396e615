//! Compactor telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::block::Resolution;

struct CompactorInstruments {
    compaction_runs_started: Counter<u64>,
    compaction_runs_completed: Counter<u64>,
    compactions: Counter<u64>,
    vertical_compactions: Counter<u64>,
    compaction_failures: Counter<u64>,
    garbage_collections: Counter<u64>,
    garbage_collection_failures: Counter<u64>,
    garbage_collected_blocks: Counter<u64>,
    garbage_collection_duration_seconds: Histogram<f64>,
    blocks_marked_for_deletion: Counter<u64>,
    blocks_marked_no_compact: Counter<u64>,
    todo_compactions: Gauge<u64>,
    todo_compaction_blocks: Gauge<u64>,
    todo_downsample_blocks: Gauge<u64>,
    todo_deletion_blocks: Gauge<u64>,
}

fn instruments() -> &'static CompactorInstruments {
    static INSTRUMENTS: OnceLock<CompactorInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.compactor");
        CompactorInstruments {
            compaction_runs_started: meter
                .u64_counter("strata.compactor.group.runs_started")
                .with_description("Group compaction attempts")
                .init(),
            compaction_runs_completed: meter
                .u64_counter("strata.compactor.group.runs_completed")
                .with_description("Group compaction runs that finished, including no-op runs")
                .init(),
            compactions: meter
                .u64_counter("strata.compactor.group.compactions")
                .with_description("Group compaction runs that produced a new block")
                .init(),
            vertical_compactions: meter
                .u64_counter("strata.compactor.group.vertical_compactions")
                .with_description("Compactions that merged overlapping blocks")
                .init(),
            compaction_failures: meter
                .u64_counter("strata.compactor.group.failures")
                .with_description("Failed group compactions")
                .init(),
            garbage_collections: meter
                .u64_counter("strata.compactor.gc.runs")
                .with_description("Garbage collection operations")
                .init(),
            garbage_collection_failures: meter
                .u64_counter("strata.compactor.gc.failures")
                .with_description("Failed garbage collection operations")
                .init(),
            garbage_collected_blocks: meter
                .u64_counter("strata.compactor.gc.blocks")
                .with_description("Blocks removed from consideration by garbage collection")
                .init(),
            garbage_collection_duration_seconds: meter
                .f64_histogram("strata.compactor.gc.duration")
                .with_description("Garbage collection iteration duration")
                .with_unit("s")
                .init(),
            blocks_marked_for_deletion: meter
                .u64_counter("strata.compactor.blocks.marked_for_deletion")
                .with_description("Deletion markers written, by reason")
                .init(),
            blocks_marked_no_compact: meter
                .u64_counter("strata.compactor.blocks.marked_no_compact")
                .with_description("No-compact markers written by the orchestrator")
                .init(),
            todo_compactions: meter
                .u64_gauge("strata.compactor.todo.compactions")
                .with_description("Compaction runs left across all groups")
                .init(),
            todo_compaction_blocks: meter
                .u64_gauge("strata.compactor.todo.compaction_blocks")
                .with_description("Blocks planned into pending compactions")
                .init(),
            todo_downsample_blocks: meter
                .u64_gauge("strata.compactor.todo.downsample_blocks")
                .with_description("Blocks awaiting downsampling")
                .init(),
            todo_deletion_blocks: meter
                .u64_gauge("strata.compactor.todo.deletion_blocks")
                .with_description("Blocks past their retention period")
                .init(),
        }
    })
}

fn res_attr(resolution: Resolution) -> [KeyValue; 1] {
    [KeyValue::new("resolution", resolution.as_str())]
}

pub fn record_run_started(resolution: Resolution) {
    instruments()
        .compaction_runs_started
        .add(1, &res_attr(resolution));
}

pub fn record_run_completed(resolution: Resolution) {
    instruments()
        .compaction_runs_completed
        .add(1, &res_attr(resolution));
}

pub fn record_compaction(resolution: Resolution, vertical: bool) {
    let i = instruments();
    i.compactions.add(1, &res_attr(resolution));
    if vertical {
        i.vertical_compactions.add(1, &res_attr(resolution));
    }
}

pub fn record_compaction_failure(resolution: Resolution) {
    instruments()
        .compaction_failures
        .add(1, &res_attr(resolution));
}

pub fn record_garbage_collection(duration_seconds: f64) {
    let i = instruments();
    i.garbage_collections.add(1, &[]);
    i.garbage_collection_duration_seconds
        .record(duration_seconds, &[]);
}

pub fn record_garbage_collection_failure() {
    instruments().garbage_collection_failures.add(1, &[]);
}

pub fn record_garbage_collected_block() {
    instruments().garbage_collected_blocks.add(1, &[]);
}

pub fn record_block_marked_for_deletion(reason: &'static str) {
    instruments()
        .blocks_marked_for_deletion
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_block_marked_no_compact() {
    instruments().blocks_marked_no_compact.add(1, &[]);
}

pub fn record_todo_compactions(runs: u64, blocks: u64) {
    let i = instruments();
    i.todo_compactions.record(runs, &[]);
    i.todo_compaction_blocks.record(blocks, &[]);
}

pub fn record_todo_downsample_blocks(blocks: u64) {
    instruments().todo_downsample_blocks.record(blocks, &[]);
}

pub fn record_todo_deletion_blocks(blocks: u64) {
    instruments().todo_deletion_blocks.record(blocks, &[]);
}
