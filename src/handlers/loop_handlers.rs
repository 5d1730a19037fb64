//! Loop statistics and manual loop trigger.

use crate::{
    errors::AppError,
    routes::routes::AppState,
    services::{
        loop_iter::IterateLoopOptions,
        observer::{
            LoopSummary, ObserverStats, SegmentLoopOptions, SegmentObserver, SegmentTally,
            run_segment_loop,
        },
    },
};
use axum::{Json, extract::State};
use std::collections::BTreeMap;

/// `GET /stats`
pub async fn loop_stats(State(state): State<AppState>) -> Json<BTreeMap<String, ObserverStats>> {
    Json(state.stats.snapshot())
}

/// `POST /loop/run`
///
/// Runs one segment loop with the tally observer and returns its summary.
pub async fn run_loop(State(state): State<AppState>) -> Result<Json<LoopSummary>, AppError> {
    let mut observers: Vec<Box<dyn SegmentObserver>> = vec![Box::new(SegmentTally::default())];
    let opts = SegmentLoopOptions {
        iterate: IterateLoopOptions {
            batch_size: state.loop_batch_size,
            as_of_system_time: None,
        },
        batch_pause: None,
    };
    let summary = run_segment_loop(&state.metabase, opts, &mut observers, &state.stats).await?;
    Ok(Json(summary))
}
