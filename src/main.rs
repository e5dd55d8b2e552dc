use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apron::allocation::AllocationEngine;
use apron::cache::{MemoryCacheBackend, PredictionCache};
use apron::clock::{Clock, SystemClock};
use apron::config::{Config, PredictionMode};
use apron::layout;
use apron::notify::NotifyHub;
use apron::provider::{FlightSource, HttpFlightSource, HttpPredictionProvider, MockPredictionProvider, PredictionProvider};
use apron::reaper::{self, Sweeper};
use apron::scheduler::{JobScheduler, ParkingWorkload, SchedulerSettings};
use apron::store::Store;
use apron::sync::{SyncOrchestrator, SyncSettings};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("APRON_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("APRON_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::from_env()?;
    apron::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(Store::open(&config.storage.wal_path())?);

    let spots = match &config.layout_file {
        Some(path) => layout::load_layout(path)?,
        None => layout::default_layout(),
    };
    layout::seed_if_empty(store.as_ref(), spots).await?;

    let hub = Arc::new(NotifyHub::new(clock.clone()));
    let engine = Arc::new(AllocationEngine::new(store.clone(), hub.clone(), clock.clone()));

    let providers = &config.providers;
    let primary: Arc<dyn FlightSource> = Arc::new(HttpFlightSource::new(
        "primary",
        &providers.primary_url,
        providers.primary_token.clone(),
        providers.call_timeout,
    )?);
    let secondary: Option<Arc<dyn FlightSource>> = match &providers.secondary_url {
        Some(url) => Some(Arc::new(HttpFlightSource::new(
            "secondary",
            url,
            providers.secondary_token.clone(),
            providers.call_timeout,
        )?)),
        None => None,
    };
    let predictor: Arc<dyn PredictionProvider> = match (providers.prediction_mode, &providers.prediction_url) {
        (PredictionMode::Remote, Some(url)) => Arc::new(HttpPredictionProvider::new("remote", url, providers.call_timeout)?),
        _ => Arc::new(MockPredictionProvider),
    };
    let health = predictor.health().await;
    if !health.healthy {
        warn!(mode = %health.mode, detail = ?health.detail, "prediction provider unhealthy at startup");
    }

    let cache = Arc::new(PredictionCache::new(
        Arc::new(MemoryCacheBackend::new()),
        config.cache.ttl,
        config.cache.enabled,
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        engine.clone(),
        primary,
        secondary,
        predictor,
        cache,
        clock.clone(),
        SyncSettings::from_config(&config),
    ));
    let sweeper = Arc::new(Sweeper::new(engine.clone()));
    let workload = Arc::new(ParkingWorkload::new(orchestrator, sweeper));
    let scheduler = JobScheduler::new(workload, clock.clone(), SchedulerSettings::from_config(&config))?;
    scheduler.start().await;

    let cancel = CancellationToken::new();
    let compactor = tokio::spawn(reaper::run_compactor(
        store.clone(),
        config.storage.compact_threshold,
        cancel.clone(),
    ));

    let occupancy = engine.occupancy().await;
    info!("apron running for {} ({})", config.airport.icao, config.airport.iata);
    info!("  data_dir: {}", config.storage.data_dir.display());
    info!("  spots: {} civil, {} military", occupancy.civil_total, occupancy.military_total);
    info!("  sync every {} min, prediction mode {:?}", config.sync.interval_minutes, providers.prediction_mode);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await?;
    info!("shutdown signal received, draining jobs...");
    scheduler.stop().await;
    cancel.cancel();
    if let Err(e) = compactor.await {
        warn!("compactor task ended abnormally: {e}");
    }
    info!("apron stopped");
    Ok(())
}
