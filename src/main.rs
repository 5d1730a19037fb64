use anyhow::Result;
use axum::Router;
use metabase::{
    config::{self, Mode},
    db,
    routes::routes::{AppState, routes},
    services::{
        Metabase,
        delete::{DeleteExpiredObjects, DeleteZombieObjects},
        loop_iter::IterateLoopOptions,
        observer::{
            SegmentLoopOptions, SegmentObserver, SegmentTally, StatsRegistry, run_segment_loop,
        },
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting metabase in {:?} mode with config: {:?}", mode, cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    if mode == Mode::Migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let metabase = Metabase::new(db, cfg.metabase.clone());
    let stats = Arc::new(StatsRegistry::new());

    match mode {
        Mode::RunLoop => {
            let mut observers: Vec<Box<dyn SegmentObserver>> =
                vec![Box::new(SegmentTally::default())];
            let opts = SegmentLoopOptions {
                iterate: IterateLoopOptions {
                    batch_size: cfg.loop_batch_size,
                    as_of_system_time: None,
                },
                batch_pause: None,
            };
            run_segment_loop(&metabase, opts, &mut observers, &stats).await?;
            println!("{}", serde_json::to_string_pretty(&stats.snapshot())?);
            Ok(())
        }
        Mode::Cleanup => {
            let now = chrono::Utc::now();
            let expired = metabase
                .delete_expired_objects(DeleteExpiredObjects {
                    expired_before: now,
                    batch_size: cfg.loop_batch_size,
                })
                .await?;
            let zombies = metabase
                .delete_zombie_objects(DeleteZombieObjects {
                    deadline_before: now,
                    inactive_deadline: Some(now - cfg.metabase.default_zombie_deadline),
                    batch_size: cfg.loop_batch_size,
                })
                .await?;
            tracing::info!(
                expired = expired.objects.len(),
                zombies = zombies.objects.len(),
                unreferenced_segments = expired.segments.len() + zombies.segments.len(),
                "cleanup complete"
            );
            Ok(())
        }
        Mode::Serve | Mode::Migrate => serve(&cfg, metabase, stats).await,
    }
}

async fn serve(
    cfg: &config::AppConfig,
    metabase: Metabase,
    stats: Arc<StatsRegistry>,
) -> Result<()> {
    let state = AppState {
        metabase,
        stats,
        loop_batch_size: cfg.loop_batch_size,
    };
    let app: Router = routes().with_state(state);

    let listener = bind_operations_listener(cfg).await?;
    tracing::info!(addr = %listener.local_addr()?, "metabase operations endpoint ready");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Bind the operations endpoint. Sandboxes that forbid wildcard binds still
/// get a loopback endpoint for health checks and loop runs.
async fn bind_operations_listener(cfg: &config::AppConfig) -> Result<TcpListener> {
    let addr = cfg.addr();
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let loopback = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                %addr,
                %loopback,
                error = %err,
                "operations endpoint bound to loopback only"
            );
            Ok(TcpListener::bind(&loopback).await?)
        }
        Err(err) => {
            Err(anyhow::Error::new(err).context(format!("bind operations endpoint {addr}")))
        }
    }
}
