//! Segment loop runner, observers and their statistics.

use crate::{
    errors::MetabaseResult,
    services::{
        loop_iter::{IterateLoopOptions, LoopSegmentEntry},
        metabase::{Metabase, now},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// A batch job fed by the segment loop.
pub trait SegmentObserver: Send {
    fn name(&self) -> &str;

    /// Called once before the first batch.
    fn start(&mut self) {}

    fn process(&mut self, segments: &[LoopSegmentEntry]) -> anyhow::Result<()>;

    /// Called once after the last batch; may summarize what was seen.
    fn finish(&mut self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Statistics of the latest run of one observer.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ObserverStats {
    pub runs: u64,
    pub segments: u64,
    pub batches: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: serde_json::Value,
}

/// Per-observer statistics, created once at start-up and shared by every
/// loop caller.
#[derive(Default)]
pub struct StatsRegistry {
    observers: Mutex<BTreeMap<String, ObserverStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str, run: ObserverStats) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let runs = observers.get(name).map_or(0, |stats| stats.runs);
        observers.insert(name.to_string(), ObserverStats { runs: runs + 1, ..run });
    }

    pub fn get(&self, name: &str) -> Option<ObserverStats> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ObserverStats> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SegmentLoopOptions {
    pub iterate: IterateLoopOptions,
    /// Sleep between batches to limit load on the database.
    pub batch_pause: Option<Duration>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub segments: u64,
    pub batches: u64,
}

/// Feed every segment of a consistent snapshot to `observers`.
///
/// A failing observer is logged and counted; it keeps receiving the
/// remaining batches and never stops the loop for the others.
pub async fn run_segment_loop(
    metabase: &Metabase,
    opts: SegmentLoopOptions,
    observers: &mut [Box<dyn SegmentObserver>],
    stats: &StatsRegistry,
) -> MetabaseResult<LoopSummary> {
    let started = Instant::now();
    let mut summary = LoopSummary::default();
    let mut errors = vec![0u64; observers.len()];

    for observer in observers.iter_mut() {
        observer.start();
    }

    let mut iterator = metabase.iterate_loop_segments(opts.iterate).await?;
    loop {
        let batch = iterator.next_batch().await?;
        if batch.is_empty() {
            break;
        }
        summary.batches += 1;
        summary.segments += batch.len() as u64;

        for (observer, errors) in observers.iter_mut().zip(errors.iter_mut()) {
            if let Err(err) = observer.process(&batch) {
                *errors += 1;
                tracing::warn!(
                    observer = observer.name(),
                    error = %err,
                    "observer failed to process batch"
                );
            }
        }

        if let Some(pause) = opts.batch_pause {
            tokio::time::sleep(pause).await;
        }
    }
    iterator.finish().await?;

    let duration_ms = started.elapsed().as_millis() as u64;
    let finished_at = now();
    for (observer, errors) in observers.iter_mut().zip(errors) {
        let report = observer.finish();
        stats.record(
            observer.name(),
            ObserverStats {
                runs: 0,
                segments: summary.segments,
                batches: summary.batches,
                errors,
                duration_ms,
                finished_at: Some(finished_at),
                report,
            },
        );
    }

    tracing::info!(
        segments = summary.segments,
        batches = summary.batches,
        duration_ms,
        "segment loop finished"
    );
    Ok(summary)
}

/// Counts remote and inline segments and their encrypted bytes.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentTally {
    pub remote_segments: u64,
    pub inline_segments: u64,
    pub remote_bytes: i64,
    pub inline_bytes: i64,
}

impl SegmentObserver for SegmentTally {
    fn name(&self) -> &str {
        "segment_tally"
    }

    fn start(&mut self) {
        *self = Self::default();
    }

    fn process(&mut self, segments: &[LoopSegmentEntry]) -> anyhow::Result<()> {
        for segment in segments {
            if segment.inline() {
                self.inline_segments += 1;
                self.inline_bytes += i64::from(segment.encrypted_size);
            } else {
                self.remote_segments += 1;
                self.remote_bytes += i64::from(segment.encrypted_size);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> serde_json::Value {
        serde_json::to_value(&*self).unwrap_or_default()
    }
}
