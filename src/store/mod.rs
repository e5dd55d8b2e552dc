mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

/// A spot plus the allocation currently holding it. `active.is_some()` ⇔ status is occupied.
#[derive(Debug, Clone)]
pub struct SpotState {
    pub spot: Spot,
    pub active: Option<Ulid>,
}

impl SpotState {
    fn new(spot: Spot) -> Self {
        Self { spot, active: None }
    }

    pub fn is_free(&self) -> bool {
        self.spot.status == SpotStatus::Available && self.active.is_none()
    }

    fn occupy(&mut self, allocation_id: Ulid) {
        self.active = Some(allocation_id);
        self.spot.status = SpotStatus::Occupied;
    }

    fn vacate(&mut self, allocation_id: Ulid) {
        if self.active == Some(allocation_id) {
            self.active = None;
            self.spot.status = SpotStatus::Available;
        }
    }
}

pub type SharedSpotState = Arc<RwLock<SpotState>>;
pub type SharedFlight = Arc<RwLock<Flight>>;

#[derive(Debug, Clone)]
pub struct UpsertedFlight {
    pub flight: Flight,
    pub created: bool,
}

/// Repository surface the allocation engine, orchestrator and sweeps work against.
#[async_trait]
pub trait ParkingStore: Send + Sync {
    async fn register_spot(&self, spot: Spot) -> Result<(), StoreError>;
    async fn get_spot(&self, spot_id: &str) -> Option<Spot>;
    async fn list_spots(&self) -> Vec<Spot>;
    /// Free spots of one pool that fit `min_size`, best first (jetway, then distance).
    async fn get_available_spots(&self, spot_type: SpotType, min_size: SizeClass) -> Vec<Spot>;
    async fn update_spot_status(&self, spot_id: &str, status: SpotStatus) -> Result<Spot, StoreError>;
    async fn occupancy(&self) -> Occupancy;

    async fn upsert_flight(&self, flight: Flight) -> Result<UpsertedFlight, StoreError>;
    async fn get_flight(&self, flight_id: &str) -> Option<Flight>;
    async fn list_flights(&self) -> Vec<Flight>;
    async fn record_predictions(
        &self,
        flight_id: &str,
        predictions: FlightPredictions,
    ) -> Result<Flight, StoreError>;
    async fn advance_flight_status(&self, flight_id: &str, status: FlightStatus) -> Result<bool, StoreError>;
    async fn update_telemetry(&self, flight_id: &str, telemetry: Telemetry) -> Result<bool, StoreError>;

    async fn get_active_allocations(&self) -> Vec<Allocation>;
    async fn get_active_allocation(&self, flight_id: &str) -> Option<Allocation>;
    async fn get_active_allocations_by_spot(&self, spot_id: &str) -> Vec<Allocation>;
    async fn get_allocation_history(&self, flight_id: &str) -> Vec<Allocation>;
    async fn create_allocation(&self, new: NewAllocation) -> Result<Allocation, StoreError>;
    async fn complete_allocation(&self, allocation_id: Ulid, ended_at: Ms) -> Result<Allocation, StoreError>;
    async fn transfer_allocation(
        &self,
        allocation_id: Ulid,
        next: NewAllocation,
        at: Ms,
    ) -> Result<Transfer, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already queued,
/// then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes do not leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Durable spot / flight / allocation state. Spots are individually locked; every
/// status read-modify-write happens under the spot's write guard.
pub struct Store {
    pub(super) spots: DashMap<String, SharedSpotState>,
    pub(super) flights: DashMap<String, SharedFlight>,
    pub(super) allocations: DashMap<Ulid, Allocation>,
    pub(super) active_by_flight: DashMap<String, Ulid>,
    /// Serializes flight creation so a new id is logged once.
    pub(super) flight_gate: Mutex<()>,
    /// Mutations hold it shared across append + apply; compaction holds it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

#[derive(Default)]
struct Replayed {
    spots: HashMap<String, SpotState>,
    flights: HashMap<String, Flight>,
    allocations: HashMap<Ulid, Allocation>,
    active_by_flight: HashMap<String, Ulid>,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::SpotRegistered { spot } => {
                self.spots.insert(spot.id.clone(), SpotState::new(spot));
            }
            Event::SpotStatusChanged { spot_id, status } => {
                if let Some(state) = self.spots.get_mut(&spot_id) {
                    state.spot.status = status;
                }
            }
            Event::FlightRecorded { flight } => {
                self.flights.insert(flight.id.clone(), flight);
            }
            Event::AllocationOpened { allocation } => self.open(allocation),
            Event::AllocationClosed { closure } => self.close(&closure),
            Event::AllocationTransferred { closure, opened } => {
                self.close(&closure);
                self.open(opened);
            }
        }
    }

    fn open(&mut self, allocation: Allocation) {
        if allocation.is_active() {
            if let Some(state) = self.spots.get_mut(&allocation.spot_id) {
                state.occupy(allocation.id);
            }
            self.active_by_flight
                .insert(allocation.flight_id.clone(), allocation.id);
        }
        self.allocations.insert(allocation.id, allocation);
    }

    fn close(&mut self, closure: &Closure) {
        if let Some(allocation) = self.allocations.get_mut(&closure.allocation_id) {
            apply_closure(allocation, closure);
        }
        if let Some(state) = self.spots.get_mut(&closure.spot_id) {
            state.vacate(closure.allocation_id);
        }
        if self.active_by_flight.get(&closure.flight_id) == Some(&closure.allocation_id) {
            self.active_by_flight.remove(&closure.flight_id);
        }
    }
}

pub(super) fn apply_closure(allocation: &mut Allocation, closure: &Closure) {
    allocation.actual_start_time = Some(closure.actual_start_time);
    allocation.actual_end_time = Some(closure.actual_end_time);
    allocation.actual_duration_minutes = Some(closure.actual_duration_minutes);
}

impl Store {
    /// Replay the WAL at `path` and start the group-commit writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %path.display(),
                discarded_bytes = replay.discarded_bytes,
                "discarded torn or corrupt WAL tail"
            );
        }
        let event_count = replay.events.len();
        let mut state = Replayed::default();
        for event in replay.events {
            state.apply(event);
        }

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            events = event_count,
            spots = state.spots.len(),
            flights = state.flights.len(),
            active_allocations = state.active_by_flight.len(),
            "store recovered"
        );

        Ok(Self {
            spots: state
                .spots
                .into_iter()
                .map(|(id, s)| (id, Arc::new(RwLock::new(s))))
                .collect(),
            flights: state
                .flights
                .into_iter()
                .map(|(id, f)| (id, Arc::new(RwLock::new(f))))
                .collect(),
            allocations: state.allocations.into_iter().collect(),
            active_by_flight: state.active_by_flight.into_iter().collect(),
            flight_gate: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
        })
    }

    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) fn spot_handle(&self, spot_id: &str) -> Result<SharedSpotState, StoreError> {
        self.spots
            .get(spot_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::SpotNotFound(spot_id.to_string()))
    }

    pub(super) fn flight_handle(&self, flight_id: &str) -> Option<SharedFlight> {
        self.flights.get(flight_id).map(|e| e.value().clone())
    }

    pub(super) fn spot_handles(&self) -> Vec<SharedSpotState> {
        self.spots.iter().map(|e| e.value().clone()).collect()
    }

    /// Fill in the derived spot assignment.
    pub(super) fn with_assignment(&self, mut flight: Flight) -> Flight {
        flight.assigned_spot = self
            .active_by_flight
            .get(&flight.id)
            .and_then(|id| self.allocations.get(id.value()).map(|a| a.spot_id.clone()));
        flight
    }

    /// Rewrite the WAL as the minimal event set for the current state, then drop
    /// closed allocations from memory. Closed allocation history does not survive.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        let mut spots = Vec::new();
        for shared in self.spot_handles() {
            spots.push(shared.read().await.spot.clone());
        }
        spots.sort_by(|a, b| a.id.cmp(&b.id));
        for mut spot in spots {
            if spot.status == SpotStatus::Occupied {
                spot.status = SpotStatus::Available;
            }
            events.push(Event::SpotRegistered { spot });
        }

        let flights: Vec<SharedFlight> = self.flights.iter().map(|e| e.value().clone()).collect();
        for shared in flights {
            let flight = shared.read().await.clone();
            events.push(Event::FlightRecorded { flight });
        }

        let mut active: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect();
        active.sort_by_key(|a| a.id);
        events.extend(active.into_iter().map(|allocation| Event::AllocationOpened { allocation }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;

        let before = self.allocations.len();
        self.allocations.retain(|_, a| a.is_active());
        debug!(pruned = before - self.allocations.len(), "dropped closed allocations");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ParkingStore for Store {
    async fn register_spot(&self, spot: Spot) -> Result<(), StoreError> {
        Store::register_spot(self, spot).await
    }

    async fn get_spot(&self, spot_id: &str) -> Option<Spot> {
        Store::get_spot(self, spot_id).await
    }

    async fn list_spots(&self) -> Vec<Spot> {
        Store::list_spots(self).await
    }

    async fn get_available_spots(&self, spot_type: SpotType, min_size: SizeClass) -> Vec<Spot> {
        Store::get_available_spots(self, spot_type, min_size).await
    }

    async fn update_spot_status(&self, spot_id: &str, status: SpotStatus) -> Result<Spot, StoreError> {
        Store::update_spot_status(self, spot_id, status).await
    }

    async fn occupancy(&self) -> Occupancy {
        Store::occupancy(self).await
    }

    async fn upsert_flight(&self, flight: Flight) -> Result<UpsertedFlight, StoreError> {
        Store::upsert_flight(self, flight).await
    }

    async fn get_flight(&self, flight_id: &str) -> Option<Flight> {
        Store::get_flight(self, flight_id).await
    }

    async fn list_flights(&self) -> Vec<Flight> {
        Store::list_flights(self).await
    }

    async fn record_predictions(
        &self,
        flight_id: &str,
        predictions: FlightPredictions,
    ) -> Result<Flight, StoreError> {
        Store::record_predictions(self, flight_id, predictions).await
    }

    async fn advance_flight_status(&self, flight_id: &str, status: FlightStatus) -> Result<bool, StoreError> {
        Store::advance_flight_status(self, flight_id, status).await
    }

    async fn update_telemetry(&self, flight_id: &str, telemetry: Telemetry) -> Result<bool, StoreError> {
        Store::update_telemetry(self, flight_id, telemetry).await
    }

    async fn get_active_allocations(&self) -> Vec<Allocation> {
        Store::get_active_allocations(self)
    }

    async fn get_active_allocation(&self, flight_id: &str) -> Option<Allocation> {
        Store::get_active_allocation(self, flight_id)
    }

    async fn get_active_allocations_by_spot(&self, spot_id: &str) -> Vec<Allocation> {
        Store::get_active_allocations_by_spot(self, spot_id)
    }

    async fn get_allocation_history(&self, flight_id: &str) -> Vec<Allocation> {
        Store::get_allocation_history(self, flight_id)
    }

    async fn create_allocation(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
        Store::create_allocation(self, new).await
    }

    async fn complete_allocation(&self, allocation_id: Ulid, ended_at: Ms) -> Result<Allocation, StoreError> {
        Store::complete_allocation(self, allocation_id, ended_at).await
    }

    async fn transfer_allocation(
        &self,
        allocation_id: Ulid,
        next: NewAllocation,
        at: Ms,
    ) -> Result<Transfer, StoreError> {
        Store::transfer_allocation(self, allocation_id, next, at).await
    }
}
