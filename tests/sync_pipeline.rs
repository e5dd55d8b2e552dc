use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use apron::allocation::AllocationEngine;
use apron::cache::{MemoryCacheBackend, PredictionCache};
use apron::clock::ManualClock;
use apron::geo::BoundingBox;
use apron::layout;
use apron::model::*;
use apron::notify::NotifyHub;
use apron::provider::prediction::ProviderHealth;
use apron::provider::{
    FlightRecord, FlightSource, MockPredictionProvider, PredictionInput, PredictionOutput, PredictionProvider,
    ProviderError, TelemetryRecord, TimeWindow,
};
use apron::reaper::Sweeper;
use apron::retry::RetryPolicy;
use apron::scheduler::{JobScheduler, ParkingWorkload, SchedulerSettings};
use apron::store::Store;
use apron::sync::{SyncOrchestrator, SyncSettings};

const AIRPORT: &str = "DXXX";
const T0: Ms = 1_700_000_000_000;

// ── Test infrastructure ──────────────────────────────────────

struct FakeSource {
    name: &'static str,
    failing: bool,
    records: Mutex<Vec<FlightRecord>>,
    states: Vec<TelemetryRecord>,
    demand_calls: AtomicUsize,
}

impl FakeSource {
    fn new(name: &'static str, records: Vec<FlightRecord>) -> Self {
        Self {
            name,
            failing: false,
            records: Mutex::new(records),
            states: Vec::new(),
            demand_calls: AtomicUsize::new(0),
        }
    }

    fn down(name: &'static str) -> Self {
        Self {
            failing: true,
            ..Self::new(name, Vec::new())
        }
    }

    fn calls(&self) -> usize {
        self.demand_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlightSource for FakeSource {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch_demand(&self, _: &str, _: TimeWindow) -> Result<Vec<FlightRecord>, ProviderError> {
        self.demand_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        Ok(self.records.lock().unwrap().clone())
    }

    async fn fetch_live_telemetry(&self, _: BoundingBox) -> Result<Vec<TelemetryRecord>, ProviderError> {
        Ok(self.states.clone())
    }
}

/// Mock predictions, except for one flight whose prediction is refused.
struct RefusesOne(&'static str);

#[async_trait]
impl PredictionProvider for RefusesOne {
    fn name(&self) -> &str {
        "refuses-one"
    }

    async fn predict(&self, input: &PredictionInput) -> Result<PredictionOutput, ProviderError> {
        if input.flight_id == self.0 {
            return Err(ProviderError::Auth("403 Forbidden".into()));
        }
        MockPredictionProvider.predict(input).await
    }

    async fn health(&self) -> ProviderHealth {
        MockPredictionProvider.health().await
    }
}

fn record(id: &str, aircraft: &str, origin: &str, destination: &str) -> FlightRecord {
    FlightRecord {
        id: id.into(),
        callsign: Some(format!("CS{id}")),
        aircraft_type: Some(aircraft.into()),
        origin: Some(origin.into()),
        destination: Some(destination.into()),
        first_seen: T0 - 3_600_000,
        last_seen: T0 - 60_000,
        status: None,
    }
}

fn arrival(id: &str, aircraft: &str) -> FlightRecord {
    record(id, aircraft, "DGAA", AIRPORT)
}

struct Harness {
    store: Arc<Store>,
    engine: Arc<AllocationEngine>,
    clock: Arc<ManualClock>,
    orchestrator: Arc<SyncOrchestrator>,
}

async fn harness(
    primary: Arc<FakeSource>,
    secondary: Option<Arc<FakeSource>>,
    predictor: Arc<dyn PredictionProvider>,
    spots: Vec<Spot>,
) -> Harness {
    let dir = std::env::temp_dir().join(format!("apron_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(Store::open(&dir.join("apron.wal")).unwrap());
    layout::seed_if_empty(store.as_ref(), spots).await.unwrap();

    let clock = Arc::new(ManualClock::new(T0));
    let hub = Arc::new(NotifyHub::new(clock.clone()));
    let engine = Arc::new(AllocationEngine::new(store.clone(), hub, clock.clone()));
    let settings = SyncSettings {
        airport_icao: AIRPORT.into(),
        airport_latitude: 6.165611,
        airport_longitude: 1.254797,
        telemetry_radius_km: 60.0,
        lookback: Duration::from_secs(2 * 3600),
        batch_width: 4,
        secondary_cooldown: Duration::from_secs(12 * 3600),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        },
    };
    let orchestrator = Arc::new(SyncOrchestrator::new(
        engine.clone(),
        primary,
        secondary.map(|s| s as Arc<dyn FlightSource>),
        predictor,
        Arc::new(PredictionCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(300),
            true,
        )),
        clock.clone(),
        settings,
    ));
    Harness {
        store,
        engine,
        clock,
        orchestrator,
    }
}

fn assert_occupancy_invariant(store: &Store, spots: &[Spot]) {
    let active = store.get_active_allocations();
    for spot in spots {
        let holders = active.iter().filter(|a| a.spot_id == spot.id).count();
        if spot.status == SpotStatus::Occupied {
            assert_eq!(holders, 1, "{} occupied without exactly one holder", spot.id);
        } else {
            assert_eq!(holders, 0, "{} free but held", spot.id);
        }
    }
}

// ── Sync ─────────────────────────────────────────────────────

#[tokio::test]
async fn sync_allocates_and_second_run_is_idempotent() {
    let primary = Arc::new(FakeSource::new(
        "primary",
        vec![
            arrival("aa0001", "A320"),
            arrival("aa0002", "B77W"),
            record("aa0003", "AT76", AIRPORT, "DGAA"),
            record("aa0004", "A320", "LFPG", "EDDF"),
            // Same aircraft reported twice.
            arrival("AA0001", "A320"),
        ],
    ));
    let h = harness(primary.clone(), None, Arc::new(MockPredictionProvider), layout::default_layout()).await;

    let first = h.orchestrator.sync().await;
    assert!(first.is_ok());
    assert_eq!(first.source, "primary");
    assert_eq!(first.total_flights, 4);
    assert_eq!(first.successful, 3);
    assert_eq!(first.skipped, 1);
    assert_eq!(first.failed, 0);
    assert_eq!(h.store.get_active_allocations().len(), 3);

    let departure = h.store.get_flight("aa0003").await.unwrap();
    assert_eq!(departure.direction, Direction::Departure);
    assert!(departure.predictions.etd.is_some());
    let wide = h.store.get_active_allocation("aa0002").unwrap();
    let spot = h.store.get_spot(&wide.spot_id).await.unwrap();
    assert_eq!(spot.size_capacity, SizeClass::Large);

    h.clock.advance_minutes(5);
    let second = h.orchestrator.sync().await;
    assert_eq!(second.successful, 3);
    assert_eq!(h.store.get_active_allocations().len(), 3);
    for id in ["aa0001", "aa0002", "aa0003"] {
        assert_eq!(h.store.get_allocation_history(id).len(), 1, "{id} allocated twice");
    }
    assert_occupancy_invariant(&h.store, &h.store.list_spots().await);
}

#[tokio::test]
async fn secondary_is_used_at_most_once_per_cooldown() {
    let primary = Arc::new(FakeSource::down("primary"));
    let secondary = Arc::new(FakeSource::new("secondary", vec![arrival("bb0001", "A320")]));
    let h = harness(
        primary.clone(),
        Some(secondary.clone()),
        Arc::new(MockPredictionProvider),
        layout::default_layout(),
    )
    .await;

    let first = h.orchestrator.sync().await;
    assert_eq!(first.source, "secondary");
    assert_eq!(first.successful, 1);
    // Transport errors are retried once.
    assert_eq!(primary.calls(), 2);

    h.clock.advance_minutes(5);
    let second = h.orchestrator.sync().await;
    assert!(!second.is_ok());
    assert!(second.fetch_error.unwrap().contains("connection refused"));
    assert_eq!(second.total_flights, 0);
    assert_eq!(secondary.calls(), 1);

    h.clock.advance_minutes(12 * 60);
    let third = h.orchestrator.sync().await;
    assert_eq!(third.source, "secondary");
    assert_eq!(secondary.calls(), 2);
}

#[tokio::test]
async fn primary_failure_without_secondary_reports_error() {
    let primary = Arc::new(FakeSource::down("primary"));
    let h = harness(primary, None, Arc::new(MockPredictionProvider), layout::default_layout()).await;
    let report = h.orchestrator.sync().await;
    assert!(report.fetch_error.is_some());
    assert_eq!((report.total_flights, report.successful, report.failed), (0, 0, 0));
}

#[tokio::test]
async fn one_failing_flight_does_not_stop_the_batch() {
    let records = (1..=12).map(|i| arrival(&format!("cc{i:04}"), "A320")).collect();
    let primary = Arc::new(FakeSource::new("primary", records));
    let h = harness(primary, None, Arc::new(RefusesOne("cc0003")), layout::default_layout()).await;

    let report = h.orchestrator.sync().await;
    assert_eq!(report.total_flights, 12);
    assert_eq!(report.failed, 1);
    assert_eq!(report.successful, 11);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("cc0003"));
    assert!(h.store.get_active_allocation("cc0003").is_none());
}

#[tokio::test]
async fn saturation_counts_as_failed() {
    let spots = vec![Spot {
        id: "C01".into(),
        spot_type: SpotType::Civil,
        status: SpotStatus::Available,
        size_capacity: SizeClass::Large,
        has_jetway: true,
        distance_to_terminal: 50,
        admin_configurable: true,
        notes: None,
    }];
    let primary = Arc::new(FakeSource::new(
        "primary",
        vec![arrival("dd0001", "A320"), arrival("dd0002", "A320")],
    ));
    let h = harness(primary, None, Arc::new(MockPredictionProvider), spots).await;

    let report = h.orchestrator.sync().await;
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].contains("saturation"));
    assert_eq!(h.store.get_active_allocations().len(), 1);
}

#[tokio::test]
async fn completed_flights_are_released_by_the_sweep() {
    let primary = Arc::new(FakeSource::new("primary", vec![arrival("ee0001", "A320")]));
    let h = harness(primary.clone(), None, Arc::new(MockPredictionProvider), layout::default_layout()).await;
    h.orchestrator.sync().await;
    let spot_id = h.store.get_active_allocation("ee0001").unwrap().spot_id;

    primary.records.lock().unwrap()[0].status = Some(FlightStatus::Completed);
    h.clock.advance_minutes(40);
    h.orchestrator.sync().await;
    assert_eq!(h.store.get_flight("ee0001").await.unwrap().status, FlightStatus::Completed);

    let sweeper = Sweeper::new(h.engine.clone());
    let report = sweeper.release_sweep().await;
    assert_eq!(report.applied, 1);
    let closed = &h.store.get_allocation_history("ee0001")[0];
    assert_eq!(closed.actual_duration_minutes, Some(40));
    assert_eq!(h.store.get_spot(&spot_id).await.unwrap().status, SpotStatus::Available);

    // A completed flight is not given a new spot.
    h.orchestrator.sync().await;
    assert!(h.store.get_active_allocation("ee0001").is_none());
}

#[tokio::test]
async fn positions_update_known_flights_only() {
    let mut source = FakeSource::new("primary", vec![arrival("ff0001", "A320")]);
    let state = |id: &str, lat: Option<f64>| TelemetryRecord {
        id: id.into(),
        callsign: None,
        latitude: lat,
        longitude: Some(1.3),
        altitude_m: Some(900.0),
        velocity_ms: Some(70.0),
        heading_deg: None,
        on_ground: false,
        updated_at: T0,
    };
    source.states = vec![state("FF0001", Some(6.2)), state("zz9999", Some(6.2)), state("ff0001", None)];
    let h = harness(Arc::new(source), None, Arc::new(MockPredictionProvider), layout::default_layout()).await;
    h.orchestrator.sync().await;

    let report = h.orchestrator.sync_positions().await.unwrap();
    assert_eq!(report.total_states, 3);
    assert_eq!(report.updated_count, 1);
    assert_eq!(report.errors, 0);
    assert!(h.store.get_flight("ff0001").await.unwrap().telemetry.is_some());
    assert!(h.store.get_flight("zz9999").await.is_none());
}

// ── Scheduler ────────────────────────────────────────────────

#[tokio::test]
async fn manual_sync_through_the_scheduler() {
    let primary = Arc::new(FakeSource::new("primary", vec![arrival("gg0001", "B738")]));
    let h = harness(primary, None, Arc::new(MockPredictionProvider), layout::default_layout()).await;
    let workload = Arc::new(ParkingWorkload::new(
        h.orchestrator.clone(),
        Arc::new(Sweeper::new(h.engine.clone())),
    ));
    let scheduler = JobScheduler::new(workload, h.clock.clone(), SchedulerSettings::default()).unwrap();

    scheduler.start().await;
    let report = scheduler.trigger_manual_sync().await;
    assert_eq!(report.successful, 1);

    scheduler.update_interval(15).await.unwrap();
    let status = scheduler.get_status().await;
    assert!(status.running);
    assert_eq!(status.interval_minutes, 15);
    assert_eq!(status.jobs["sync"].runs, 1);
    assert_eq!(status.jobs["sync"].last_run_at, Some(T0));

    scheduler.stop().await;
    assert!(!scheduler.get_status().await.running);
}
