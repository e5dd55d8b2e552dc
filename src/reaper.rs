use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocation::{AllocationEngine, size_for_aircraft};
use crate::model::{FlightStatus, SpotType};
use crate::store::{ParkingStore, Store};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Allocations looked at.
    pub examined: usize,
    /// Allocations recalled or released.
    pub applied: usize,
    pub failed: usize,
}

/// Reconciliation passes over stored allocations: bring overflow flights back to civil
/// spots, and free spots held by flights that have finished.
pub struct Sweeper {
    store: Arc<dyn ParkingStore>,
    engine: Arc<AllocationEngine>,
}

impl Sweeper {
    pub fn new(engine: Arc<AllocationEngine>) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
        }
    }

    pub async fn recall_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for allocation in self.store.get_active_allocations().await {
            if !allocation.overflow_to_military {
                continue;
            }
            report.examined += 1;
            let flight = self.store.get_flight(&allocation.flight_id).await;
            let size = size_for_aircraft(flight.as_ref().and_then(|f| f.aircraft_type.as_deref()));
            let Some(spot) = self
                .store
                .get_available_spots(SpotType::Civil, size)
                .await
                .into_iter()
                .next()
            else {
                debug!(flight_id = %allocation.flight_id, "no civil spot yet");
                continue;
            };
            match self.engine.recall(&allocation.flight_id, &spot.id).await {
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(flight_id = %allocation.flight_id, error = %e, "recall failed");
                    report.failed += 1;
                }
            }
        }
        if report.applied > 0 {
            info!(recalled = report.applied, "recall sweep");
        }
        report
    }

    /// Completed and cancelled flights give their spot back.
    pub async fn release_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for allocation in self.store.get_active_allocations().await {
            report.examined += 1;
            let Some(flight) = self.store.get_flight(&allocation.flight_id).await else {
                continue;
            };
            if !matches!(flight.status, FlightStatus::Completed | FlightStatus::Cancelled) {
                continue;
            }
            match self.engine.release(&flight.id).await {
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(flight_id = %flight.id, error = %e, "release failed");
                    report.failed += 1;
                }
            }
        }
        if report.applied > 0 {
            info!(released = report.applied, "release sweep");
        }
        report
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}
