use ulid::Ulid;

use crate::model::*;

use super::Store;

impl Store {
    pub async fn get_spot(&self, spot_id: &str) -> Option<Spot> {
        let shared = self.spot_handle(spot_id).ok()?;
        let guard = shared.read().await;
        Some(guard.spot.clone())
    }

    pub async fn list_spots(&self) -> Vec<Spot> {
        let mut spots = Vec::with_capacity(self.spots.len());
        for shared in self.spot_handles() {
            spots.push(shared.read().await.spot.clone());
        }
        spots.sort_by(|a, b| a.id.cmp(&b.id));
        spots
    }

    pub async fn get_available_spots(&self, spot_type: SpotType, min_size: SizeClass) -> Vec<Spot> {
        let mut spots = Vec::new();
        for shared in self.spot_handles() {
            let guard = shared.read().await;
            if guard.spot.spot_type == spot_type && guard.is_free() && guard.spot.fits(min_size) {
                spots.push(guard.spot.clone());
            }
        }
        spots.sort_by(Spot::preference);
        spots
    }

    pub async fn occupancy(&self) -> Occupancy {
        let mut occ = Occupancy::default();
        for shared in self.spot_handles() {
            let guard = shared.read().await;
            let available = guard.is_free() as u32;
            let occupied = (guard.spot.status == SpotStatus::Occupied) as u32;
            match guard.spot.spot_type {
                SpotType::Civil => {
                    occ.civil_total += 1;
                    occ.civil_available += available;
                    occ.civil_occupied += occupied;
                }
                SpotType::Military => {
                    occ.military_total += 1;
                    occ.military_available += available;
                    occ.military_occupied += occupied;
                }
            }
        }
        occ
    }

    pub async fn get_flight(&self, flight_id: &str) -> Option<Flight> {
        let shared = self.flight_handle(flight_id)?;
        let flight = shared.read().await.clone();
        Some(self.with_assignment(flight))
    }

    pub async fn list_flights(&self) -> Vec<Flight> {
        let handles: Vec<_> = self.flights.iter().map(|e| e.value().clone()).collect();
        let mut flights = Vec::with_capacity(handles.len());
        for shared in handles {
            let flight = shared.read().await.clone();
            flights.push(self.with_assignment(flight));
        }
        flights.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.id.cmp(&b.id)));
        flights
    }

    /// Active allocations, oldest first.
    pub fn get_active_allocations(&self) -> Vec<Allocation> {
        let ids: Vec<Ulid> = self.active_by_flight.iter().map(|e| *e.value()).collect();
        let mut active: Vec<Allocation> = ids
            .iter()
            .filter_map(|id| self.allocations.get(id).map(|e| e.value().clone()))
            .filter(Allocation::is_active)
            .collect();
        active.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at).then(a.id.cmp(&b.id)));
        active
    }

    pub fn get_active_allocation(&self, flight_id: &str) -> Option<Allocation> {
        let id = *self.active_by_flight.get(flight_id)?.value();
        self.allocations
            .get(&id)
            .map(|e| e.value().clone())
            .filter(Allocation::is_active)
    }

    pub fn get_active_allocations_by_spot(&self, spot_id: &str) -> Vec<Allocation> {
        self.allocations
            .iter()
            .filter(|e| e.value().is_active() && e.value().spot_id == spot_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Every allocation a flight has held since the last compaction, oldest first.
    pub fn get_allocation_history(&self, flight_id: &str) -> Vec<Allocation> {
        let mut history: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|e| e.value().flight_id == flight_id)
            .map(|e| e.value().clone())
            .collect();
        history.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at).then(a.id.cmp(&b.id)));
        history
    }
}
