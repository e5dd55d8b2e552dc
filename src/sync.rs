//! One sync cycle: fetch demand with source fallback, predict through the cache, allocate.
//! Plus the telemetry refresh for flights the store already knows.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::allocation::{AllocationEngine, AllocationError, Placement, size_for_aircraft};
use crate::cache::PredictionCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::geo::{BoundingBox, haversine_km};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::provider::{
    FlightRecord, FlightSource, PredictionInput, PredictionOutput, PredictionProvider, ProviderError, TimeWindow,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{ParkingStore, StoreError};

const NEVER: Ms = i64::MIN;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub airport_icao: String,
    pub airport_latitude: f64,
    pub airport_longitude: f64,
    pub telemetry_radius_km: f64,
    pub lookback: Duration,
    pub batch_width: usize,
    pub secondary_cooldown: Duration,
    pub retry: RetryPolicy,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            airport_icao: config.airport.icao.clone(),
            airport_latitude: config.airport.latitude,
            airport_longitude: config.airport.longitude,
            telemetry_radius_km: config.airport.radius_km,
            lookback: config.sync.lookback,
            batch_width: config.sync.batch_width,
            secondary_cooldown: config.sync.secondary_cooldown,
            retry: RetryPolicy {
                max_attempts: config.providers.max_attempts,
                call_timeout: config.providers.call_timeout,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Result of one `sync()` call. Returned on every path; a failed fetch shows up in `fetch_error`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Name of the source that served the demand, empty when none did.
    pub source: String,
    pub total_flights: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// First few per-flight errors.
    pub errors: Vec<String>,
    pub fetch_error: Option<String>,
    pub started_at: Ms,
    pub finished_at: Ms,
}

impl SyncReport {
    pub fn is_ok(&self) -> bool {
        self.fetch_error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionReport {
    pub updated_count: usize,
    pub total_states: usize,
    pub errors: usize,
}

/// Per-flight result inside a sync batch.
#[derive(Debug)]
enum FlightOutcome {
    Allocated(&'static str),
    AlreadyAllocated,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
enum FlightError {
    #[error("prediction failed: {0}")]
    Prediction(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

pub struct SyncOrchestrator {
    store: Arc<dyn ParkingStore>,
    engine: Arc<AllocationEngine>,
    primary: Arc<dyn FlightSource>,
    secondary: Option<Arc<dyn FlightSource>>,
    predictor: Arc<dyn PredictionProvider>,
    cache: Arc<PredictionCache>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    last_secondary_use: AtomicI64,
}

impl SyncOrchestrator {
    pub fn new(
        engine: Arc<AllocationEngine>,
        primary: Arc<dyn FlightSource>,
        secondary: Option<Arc<dyn FlightSource>>,
        predictor: Arc<dyn PredictionProvider>,
        cache: Arc<PredictionCache>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
            primary,
            secondary,
            predictor,
            cache,
            clock,
            settings,
            last_secondary_use: AtomicI64::new(NEVER),
        }
    }

    pub fn engine(&self) -> &Arc<AllocationEngine> {
        &self.engine
    }

    #[instrument(skip(self), fields(airport = %self.settings.airport_icao))]
    pub async fn sync(&self) -> SyncReport {
        let started = Instant::now();
        let started_at = self.clock.now_ms();
        let lookback_ms = self.settings.lookback.as_millis() as Ms;
        let window = TimeWindow::lookback(started_at, lookback_ms);

        let (source, records) = match self.fetch_demand(window).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(error = %e, "no demand fetched");
                metrics::counter!(observability::SYNC_RUNS_TOTAL, "source" => "none", "outcome" => "fetch_failed")
                    .increment(1);
                return SyncReport {
                    fetch_error: Some(e.to_string()),
                    started_at,
                    finished_at: self.clock.now_ms(),
                    ..SyncReport::default()
                };
            }
        };

        let records = dedupe(records);
        let mut report = SyncReport {
            source: source.clone(),
            total_flights: records.len(),
            started_at,
            ..SyncReport::default()
        };

        let mut outcomes = futures::stream::iter(records)
            .map(|record| async move {
                let id = record.id.clone();
                (id, self.process_flight(record).await)
            })
            .buffer_unordered(self.settings.batch_width.max(1));

        while let Some((id, outcome)) = outcomes.next().await {
            let label = match outcome {
                FlightOutcome::Allocated(_) | FlightOutcome::AlreadyAllocated => {
                    report.successful += 1;
                    "successful"
                }
                FlightOutcome::Skipped(reason) => {
                    debug!(flight_id = %id, reason, "skipped");
                    report.skipped += 1;
                    "skipped"
                }
                FlightOutcome::Failed(reason) => {
                    warn!(flight_id = %id, error = %reason, "flight failed");
                    report.failed += 1;
                    if report.errors.len() < MAX_REPORTED_ERRORS {
                        report.errors.push(format!("{id}: {reason}"));
                    }
                    "failed"
                }
            };
            metrics::counter!(observability::SYNC_FLIGHTS_TOTAL, "outcome" => label).increment(1);
        }
        drop(outcomes);

        self.engine.check_saturation().await;

        report.finished_at = self.clock.now_ms();
        metrics::counter!(observability::SYNC_RUNS_TOTAL, "source" => source, "outcome" => "ok").increment(1);
        metrics::histogram!(observability::SYNC_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            source = %report.source,
            total = report.total_flights,
            successful = report.successful,
            failed = report.failed,
            skipped = report.skipped,
            "sync complete"
        );
        report
    }

    /// Primary first. The secondary is only tried when its cooldown has run out, and
    /// using it restarts the cooldown whether or not it succeeds.
    async fn fetch_demand(&self, window: TimeWindow) -> Result<(String, Vec<FlightRecord>), ProviderError> {
        let icao = self.settings.airport_icao.as_str();
        let primary_err = match retry_with_backoff(&self.settings.retry, "fetch_demand", || {
            self.primary.fetch_demand(icao, window)
        })
        .await
        {
            Ok(records) => return Ok((self.primary.name().to_string(), records)),
            Err(e) => e,
        };
        warn!(source = self.primary.name(), error = %primary_err, "primary source failed");

        let Some(secondary) = &self.secondary else {
            return Err(primary_err);
        };
        if !self.claim_secondary() {
            info!("secondary source cooling down, not used");
            return Err(primary_err);
        }
        match retry_with_backoff(&self.settings.retry, "fetch_demand_secondary", || {
            secondary.fetch_demand(icao, window)
        })
        .await
        {
            Ok(records) => {
                info!(source = secondary.name(), count = records.len(), "served by secondary source");
                Ok((secondary.name().to_string(), records))
            }
            Err(e) => {
                warn!(source = secondary.name(), error = %e, "secondary source failed");
                Err(e)
            }
        }
    }

    /// Take the secondary-source slot if the cooldown since the last use has elapsed.
    fn claim_secondary(&self) -> bool {
        let now = self.clock.now_ms();
        let cooldown = self.settings.secondary_cooldown.as_millis() as Ms;
        self.last_secondary_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                (last == NEVER || now - last >= cooldown).then_some(now)
            })
            .is_ok()
    }

    async fn process_flight(&self, record: FlightRecord) -> FlightOutcome {
        match self.try_process_flight(record).await {
            Ok(outcome) => outcome,
            Err(e) => FlightOutcome::Failed(e.to_string()),
        }
    }

    async fn try_process_flight(&self, record: FlightRecord) -> Result<FlightOutcome, FlightError> {
        let Some(direction) = record.direction_for(&self.settings.airport_icao) else {
            return Ok(FlightOutcome::Skipped("not relevant to this airport"));
        };

        let upserted = self.store.upsert_flight(record.to_flight(direction)).await?;
        let flight_id = upserted.flight.id.clone();
        if let Some(status) = record.status {
            match self.store.advance_flight_status(&flight_id, status).await {
                Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.store.get_active_allocation(&flight_id).await.is_some() {
            return Ok(FlightOutcome::AlreadyAllocated);
        }
        let Some(flight) = self.store.get_flight(&flight_id).await else {
            return Err(StoreError::FlightNotFound(flight_id).into());
        };
        if flight.status.is_terminal() {
            return Ok(FlightOutcome::Skipped("flight already finished"));
        }

        let input = self.prediction_input(&flight).await;
        let prediction = self.predict(&input).await?;
        let now = self.clock.now_ms();
        let offset = (prediction.eta_minutes.max(0.0) * MINUTE_MS as f64).round() as Ms;
        let delay_minutes = prediction.delay_minutes.round() as i64;
        let occupation_minutes = prediction.occupation_minutes.max(0.0).round() as u32;
        let predictions = FlightPredictions {
            eta: (direction == Direction::Arrival).then_some(now + offset),
            etd: (direction == Direction::Departure).then_some(now + offset),
            delay_minutes: Some(delay_minutes),
            occupation_minutes: Some(occupation_minutes),
        };
        let flight = self.store.record_predictions(&flight_id, predictions).await?;
        self.engine.report_delay(&flight_id, delay_minutes).await;

        let outcome = self
            .engine
            .allocate(&flight, occupation_minutes, prediction.conflict_probability)
            .await?;
        Ok(match outcome.placement {
            Placement::Saturated => FlightOutcome::Failed(outcome.reason),
            Placement::AlreadyAllocated => FlightOutcome::AlreadyAllocated,
            placement => FlightOutcome::Allocated(placement.label()),
        })
    }

    async fn prediction_input(&self, flight: &Flight) -> PredictionInput {
        let occupancy = self.store.occupancy().await;
        let telemetry = flight.telemetry.as_ref();
        PredictionInput {
            flight_id: flight.id.clone(),
            callsign: flight.callsign.clone(),
            aircraft_type: flight.aircraft_type.clone(),
            size: size_for_aircraft(flight.aircraft_type.as_deref()),
            direction: flight.direction,
            origin: flight.origin.clone(),
            destination: flight.destination.clone(),
            hour_of_day: (self.clock.now_ms().div_euclid(HOUR_MS)).rem_euclid(24) as u8,
            distance_km: telemetry.map(|t| {
                haversine_km(
                    t.latitude,
                    t.longitude,
                    self.settings.airport_latitude,
                    self.settings.airport_longitude,
                )
            }),
            altitude_m: telemetry.and_then(|t| t.altitude_m),
            velocity_ms: telemetry.and_then(|t| t.velocity_ms),
            civil_occupancy: occupancy.civil_rate() / 100.0,
        }
    }

    async fn predict(&self, input: &PredictionInput) -> Result<PredictionOutput, ProviderError> {
        let model = self.predictor.name();
        if let Some(hit) = self.cache.get(model, input).await {
            return Ok(hit);
        }
        let output = retry_with_backoff(&self.settings.retry, "predict", || self.predictor.predict(input)).await?;
        self.cache.set(model, input, &output, None).await;
        Ok(output)
    }

    /// Refresh telemetry of known flights from the live feed around the airport.
    /// Reports for unknown aircraft are dropped.
    #[instrument(skip(self))]
    pub async fn sync_positions(&self) -> Result<PositionReport, ProviderError> {
        let bbox = BoundingBox::around(
            self.settings.airport_latitude,
            self.settings.airport_longitude,
            self.settings.telemetry_radius_km,
        );
        let states = retry_with_backoff(&self.settings.retry, "fetch_live_telemetry", || {
            self.primary.fetch_live_telemetry(bbox)
        })
        .await?;

        let mut report = PositionReport {
            total_states: states.len(),
            ..PositionReport::default()
        };
        for state in states {
            let Some(telemetry) = state.to_telemetry() else {
                continue;
            };
            let id = state.id.trim().to_ascii_lowercase();
            match self.store.update_telemetry(&id, telemetry).await {
                Ok(true) => report.updated_count += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(flight_id = %id, error = %e, "telemetry update failed");
                    report.errors += 1;
                }
            }
        }
        metrics::counter!(observability::TELEMETRY_UPDATES_TOTAL).increment(report.updated_count as u64);
        info!(
            updated = report.updated_count,
            total = report.total_states,
            errors = report.errors,
            "positions synced"
        );
        Ok(report)
    }
}

/// Collapse repeated ids, keeping the most recently seen record. First-seen order is kept.
fn dedupe(records: Vec<FlightRecord>) -> Vec<FlightRecord> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<FlightRecord> = Vec::with_capacity(records.len());
    for record in records {
        let key = record.id.trim().to_ascii_lowercase();
        match index.get(&key) {
            Some(&i) => {
                if record.last_seen > out[i].last_seen {
                    out[i] = record;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(record);
            }
        }
    }
    out
}
