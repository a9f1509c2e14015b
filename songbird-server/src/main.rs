//! Coordinator host binary: wires every collaborator behind `AppState`,
//! starts the background reaper and rate-limiter sweeps, and serves the
//! axum router (§2, §6).
//!
//! The bootstrap shape — tracing init, settings load, collaborator
//! construction, then `axum::serve` with a graceful-shutdown future — is the
//! same sequencing the teacher's `main` uses for its own engine/model/Tauri
//! setup, generalized from a desktop host to an HTTP one.

mod auth;
mod blobstore;
mod config;
mod error;
mod persistence;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use songbird_core::bus::EventBus;
use songbird_core::clock::{SystemClock, UuidIdGen};
use songbird_core::dispatcher::{Dispatcher, DispatcherConfig};
use songbird_core::inference::http::{HttpClassifier, HttpGenerator};
use songbird_core::pipeline::PipelineContext;
use songbird_core::ratelimit::{DeviceRateLimiter, RateLimitConfig};
use songbird_core::reaper::{self, ReaperConfig};
use songbird_core::store::SharedBlobStore;

use auth::DevAuthVerifier;
use blobstore::fs::FsBlobStore;
use config::Settings;
use persistence::sqlite::SqliteRepository;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "songbird_server=info,songbird_core=info".parse().unwrap()),
        )
        .init();

    let settings = Settings::load();
    info!(bind_addr = %settings.bind_addr, "songbird-server starting");

    let clock = Arc::new(SystemClock);
    let id_gen: Arc<dyn songbird_core::clock::IdGen> = Arc::new(UuidIdGen);

    let repository = Arc::new(SqliteRepository::open(
        settings.database_path.clone(),
        id_gen,
    )?);

    let clip_store: SharedBlobStore = Arc::new(FsBlobStore::new(
        format!("{}/clips", settings.blob_root),
        format!("{}/clips", settings.asset_url_prefix),
    ));
    let asset_store: SharedBlobStore = Arc::new(FsBlobStore::new(
        format!("{}/assets", settings.blob_root),
        format!("{}/assets", settings.asset_url_prefix),
    ));

    let classifier = Arc::new(HttpClassifier::new(
        settings.classifier_url.clone(),
        settings.classifier_deadline,
    ));
    let generator = Arc::new(HttpGenerator::new(
        settings.generator_url.clone(),
        settings.generator_deadline,
    ));

    let bus = Arc::new(EventBus::default());

    let pipeline_ctx = PipelineContext {
        repository: repository.clone(),
        clip_store: clip_store.clone(),
        asset_store: asset_store.clone(),
        classifier: classifier.clone(),
        generator: generator.clone(),
        bus: bus.clone(),
        clock: clock.clone(),
    };

    let dispatcher_config = DispatcherConfig {
        workers: if settings.worker_pool_size == 0 {
            DispatcherConfig::default().workers
        } else {
            settings.worker_pool_size
        },
        queue_capacity: if settings.queue_capacity == 0 {
            DispatcherConfig::default().queue_capacity
        } else {
            settings.queue_capacity
        },
        job_deadline: settings.job_deadline,
    };
    let dispatcher = Arc::new(Dispatcher::spawn(dispatcher_config, pipeline_ctx));

    let rate_limiter = Arc::new(DeviceRateLimiter::new(RateLimitConfig {
        refill_per_minute: settings.rate_limit_per_minute,
        burst: settings.rate_limit_burst,
        idle_eviction_age: settings.rate_limit_idle_age,
    }));
    let rate_limit_retry_after_secs = if settings.rate_limit_per_minute == 0 {
        60
    } else {
        (60 / settings.rate_limit_per_minute as u64).max(1)
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reaper_handle = tokio::spawn(reaper::run(
        ReaperConfig {
            sweep_interval: settings.reaper_interval,
            stale_age: settings.reaper_stale_age,
        },
        repository.clone(),
        bus.clone(),
        clock.clone(),
        shutdown_rx.clone(),
    ));

    let sweep_limiter = rate_limiter.clone();
    let sweep_clock = clock.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let rate_limit_sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep_limiter.sweep_idle(sweep_clock.as_ref()),
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let app_state = AppState {
        repository,
        clip_store,
        asset_store,
        classifier,
        generator,
        bus,
        clock,
        dispatcher: dispatcher.clone(),
        rate_limiter,
        auth: Arc::new(DevAuthVerifier),
        max_upload_bytes: settings.max_upload_bytes,
        ws_ping_interval: settings.ws_ping_interval,
        ws_backpressure_grace: settings.ws_backpressure_grace,
        rate_limit_retry_after_secs,
    };

    let router = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, draining in-flight jobs");
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;
    let _ = rate_limit_sweep_handle.await;

    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        Err(_) => info!("dispatcher still referenced, skipping owned shutdown drain"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
