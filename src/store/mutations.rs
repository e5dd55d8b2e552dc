use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{SpotState, Store, StoreError, UpsertedFlight, apply_closure};

fn validate_spot(spot: &Spot) -> Result<(), StoreError> {
    if spot.id.is_empty() {
        return Err(StoreError::InvalidSpot("empty spot id"));
    }
    if spot.id.len() > MAX_SPOT_ID_LEN {
        return Err(StoreError::InvalidSpot("spot id too long"));
    }
    if spot.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(StoreError::InvalidSpot("notes too long"));
    }
    if spot.status == SpotStatus::Occupied {
        return Err(StoreError::InvalidStatus(SpotStatus::Occupied));
    }
    Ok(())
}

impl Store {
    // ── Spots ────────────────────────────────────────────────────

    pub async fn register_spot(&self, spot: Spot) -> Result<(), StoreError> {
        validate_spot(&spot)?;
        let _commit = self.commit_gate.read().await;
        if self.spots.contains_key(&spot.id) {
            return Err(StoreError::SpotExists(spot.id));
        }
        let event = Event::SpotRegistered { spot: spot.clone() };
        self.wal_append(&event).await?;
        self.spots
            .insert(spot.id.clone(), Arc::new(RwLock::new(SpotState::new(spot))));
        Ok(())
    }

    /// Admin status change. `occupied` is reserved for allocations.
    pub async fn update_spot_status(&self, spot_id: &str, status: SpotStatus) -> Result<Spot, StoreError> {
        if status == SpotStatus::Occupied {
            return Err(StoreError::InvalidStatus(status));
        }
        let _commit = self.commit_gate.read().await;
        let shared = self.spot_handle(spot_id)?;
        let mut guard = shared.write().await;
        if !guard.spot.admin_configurable {
            return Err(StoreError::InvalidSpot("spot is not admin-configurable"));
        }
        if guard.active.is_some() {
            return Err(StoreError::SpotBusy(spot_id.to_string()));
        }
        if guard.spot.status != status {
            let event = Event::SpotStatusChanged {
                spot_id: spot_id.to_string(),
                status,
            };
            self.wal_append(&event).await?;
            guard.spot.status = status;
        }
        Ok(guard.spot.clone())
    }

    // ── Flights ──────────────────────────────────────────────────

    /// Create the flight if unseen; otherwise only `last_seen` and telemetry move.
    pub async fn upsert_flight(&self, flight: Flight) -> Result<UpsertedFlight, StoreError> {
        if let Some(existing) = self.refresh_flight(&flight).await {
            return Ok(existing);
        }

        let _commit = self.commit_gate.read().await;
        let _creating = self.flight_gate.lock().await;
        if let Some(existing) = self.refresh_flight(&flight).await {
            return Ok(existing);
        }

        let mut flight = flight;
        flight.assigned_spot = None;
        self.wal_append(&Event::FlightRecorded { flight: flight.clone() })
            .await?;
        self.flights
            .insert(flight.id.clone(), Arc::new(RwLock::new(flight.clone())));
        Ok(UpsertedFlight { flight, created: true })
    }

    async fn refresh_flight(&self, seen: &Flight) -> Option<UpsertedFlight> {
        let shared = self.flight_handle(&seen.id)?;
        let mut guard = shared.write().await;
        guard.last_seen = guard.last_seen.max(seen.last_seen);
        if seen.telemetry.is_some() {
            guard.telemetry = seen.telemetry.clone();
        }
        let flight = self.with_assignment(guard.clone());
        Some(UpsertedFlight { flight, created: false })
    }

    pub async fn record_predictions(
        &self,
        flight_id: &str,
        predictions: FlightPredictions,
    ) -> Result<Flight, StoreError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .flight_handle(flight_id)
            .ok_or_else(|| StoreError::FlightNotFound(flight_id.to_string()))?;
        let mut guard = shared.write().await;
        let mut updated = guard.clone();
        updated.predictions = predictions;
        self.wal_append(&Event::FlightRecorded { flight: updated.clone() })
            .await?;
        *guard = updated;
        Ok(self.with_assignment(guard.clone()))
    }

    /// Move a flight's lifecycle forward. `Ok(false)` when it is already in `status`.
    pub async fn advance_flight_status(&self, flight_id: &str, status: FlightStatus) -> Result<bool, StoreError> {
        let _commit = self.commit_gate.read().await;
        let shared = self
            .flight_handle(flight_id)
            .ok_or_else(|| StoreError::FlightNotFound(flight_id.to_string()))?;
        let mut guard = shared.write().await;
        if guard.status == status {
            return Ok(false);
        }
        if !guard.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                flight_id: flight_id.to_string(),
                from: guard.status,
                to: status,
            });
        }
        let mut updated = guard.clone();
        updated.status = status;
        self.wal_append(&Event::FlightRecorded { flight: updated.clone() })
            .await?;
        *guard = updated;
        debug!(flight_id, status = status.as_str(), "flight status advanced");
        Ok(true)
    }

    /// In-memory only. Unknown flights are ignored (`Ok(false)`).
    pub async fn update_telemetry(&self, flight_id: &str, telemetry: Telemetry) -> Result<bool, StoreError> {
        let Some(shared) = self.flight_handle(flight_id) else {
            return Ok(false);
        };
        let mut guard = shared.write().await;
        guard.last_seen = guard.last_seen.max(telemetry.updated_at);
        guard.telemetry = Some(telemetry);
        Ok(true)
    }

    // ── Allocations ──────────────────────────────────────────────

    /// Claim a free spot for a flight. Fails if the spot was taken in the meantime
    /// or the flight already holds an active allocation.
    pub async fn create_allocation(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
        if !self.flights.contains_key(&new.flight_id) {
            return Err(StoreError::FlightNotFound(new.flight_id));
        }
        let _commit = self.commit_gate.read().await;
        let shared = self.spot_handle(&new.spot_id)?;
        let mut guard = shared.write().await;
        if !guard.is_free() {
            return Err(StoreError::SpotUnavailable {
                spot_id: new.spot_id,
                status: guard.spot.status,
            });
        }

        let allocation = new.into_allocation(Ulid::new());
        match self.active_by_flight.entry(allocation.flight_id.clone()) {
            Entry::Occupied(e) => {
                return Err(StoreError::AlreadyAllocated {
                    flight_id: allocation.flight_id,
                    allocation_id: *e.get(),
                });
            }
            Entry::Vacant(e) => {
                e.insert(allocation.id);
            }
        }

        let event = Event::AllocationOpened {
            allocation: allocation.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.active_by_flight
                .remove_if(&allocation.flight_id, |_, id| *id == allocation.id);
            return Err(e);
        }
        self.allocations.insert(allocation.id, allocation.clone());
        guard.occupy(allocation.id);
        Ok(allocation)
    }

    /// Close an active allocation and free its spot.
    pub async fn complete_allocation(&self, allocation_id: Ulid, ended_at: Ms) -> Result<Allocation, StoreError> {
        let _commit = self.commit_gate.read().await;
        let spot_id = self
            .allocations
            .get(&allocation_id)
            .map(|a| a.spot_id.clone())
            .ok_or(StoreError::AllocationNotFound(allocation_id))?;
        let shared = self.spot_handle(&spot_id)?;
        let mut guard = shared.write().await;

        let closure = {
            let current = self
                .allocations
                .get(&allocation_id)
                .ok_or(StoreError::AllocationNotFound(allocation_id))?;
            if !current.is_active() {
                return Err(StoreError::AllocationNotActive(allocation_id));
            }
            Closure::of(&current, ended_at)
        };
        self.wal_append(&Event::AllocationClosed {
            closure: closure.clone(),
        })
        .await?;

        let closed = self.close_in_place(&closure)?;
        guard.vacate(allocation_id);
        self.active_by_flight
            .remove_if(&closure.flight_id, |_, id| *id == allocation_id);
        Ok(closed)
    }

    /// Close `allocation_id` and open `next` for the same flight on another spot, as one
    /// logged record. Both spots are locked in id order.
    pub async fn transfer_allocation(
        &self,
        allocation_id: Ulid,
        next: NewAllocation,
        at: Ms,
    ) -> Result<Transfer, StoreError> {
        let _commit = self.commit_gate.read().await;
        let (flight_id, from_spot) = self
            .allocations
            .get(&allocation_id)
            .map(|a| (a.flight_id.clone(), a.spot_id.clone()))
            .ok_or(StoreError::AllocationNotFound(allocation_id))?;
        let to_spot = next.spot_id.clone();
        if to_spot == from_spot {
            return Err(StoreError::SpotUnavailable {
                spot_id: to_spot,
                status: SpotStatus::Occupied,
            });
        }

        let from_shared = self.spot_handle(&from_spot)?;
        let to_shared = self.spot_handle(&to_spot)?;
        let (mut from_guard, mut to_guard) = if from_spot < to_spot {
            let f = from_shared.write_owned().await;
            let t = to_shared.write_owned().await;
            (f, t)
        } else {
            let t = to_shared.write_owned().await;
            let f = from_shared.write_owned().await;
            (f, t)
        };

        let closure = {
            let current = self
                .allocations
                .get(&allocation_id)
                .ok_or(StoreError::AllocationNotFound(allocation_id))?;
            if !current.is_active() {
                return Err(StoreError::AllocationNotActive(allocation_id));
            }
            Closure::of(&current, at)
        };
        if !to_guard.is_free() {
            return Err(StoreError::SpotUnavailable {
                spot_id: to_spot,
                status: to_guard.spot.status,
            });
        }

        let opened = NewAllocation { flight_id: flight_id.clone(), ..next }.into_allocation(Ulid::new());
        self.wal_append(&Event::AllocationTransferred {
            closure: closure.clone(),
            opened: opened.clone(),
        })
        .await?;

        // Repoint the flight before closing so it is never without an active allocation.
        self.active_by_flight.insert(flight_id, opened.id);
        self.allocations.insert(opened.id, opened.clone());
        to_guard.occupy(opened.id);
        let closed = self.close_in_place(&closure)?;
        from_guard.vacate(allocation_id);

        Ok(Transfer { closed, opened })
    }

    fn close_in_place(&self, closure: &Closure) -> Result<Allocation, StoreError> {
        let mut entry = self
            .allocations
            .get_mut(&closure.allocation_id)
            .ok_or(StoreError::AllocationNotFound(closure.allocation_id))?;
        apply_closure(entry.value_mut(), closure);
        Ok(entry.value().clone())
    }
}
