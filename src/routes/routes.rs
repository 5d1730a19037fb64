//! Operations surface of the metadata engine.
//!
//! - `GET  /healthz`  — liveness
//! - `GET  /readyz`   — database readiness
//! - `GET  /stats`    — per-observer statistics of past loop runs
//! - `POST /loop/run` — run the segment loop once with the tally observer

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        loop_handlers::{loop_stats, run_loop},
    },
    services::{Metabase, observer::StatsRegistry},
};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub metabase: Metabase,
    pub stats: Arc<StatsRegistry>,
    pub loop_batch_size: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(loop_stats))
        .route("/loop/run", post(run_loop))
}
