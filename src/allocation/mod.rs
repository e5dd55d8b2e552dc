//! Spot assignment: civil first, preemptive displacement of the longest civil occupant,
//! military overflow, and recall / release of existing allocations.

mod sizing;
#[cfg(test)]
mod tests;

pub use sizing::size_for_aircraft;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationSink;
use crate::observability;
use crate::store::{ParkingStore, StoreError};

pub const REASON_CIVIL: &str = "civil spot allocated";
pub const REASON_AFTER_TRANSFER: &str = "civil spot allocated after preemptive transfer";
pub const REASON_DISPLACED: &str = "transferred to free civil spot";
pub const REASON_OVERFLOW: &str = "civil parking full — automatic overflow";
pub const REASON_SATURATED: &str = "complete saturation: no civil or military spot available";
pub const REASON_ALREADY_ALLOCATED: &str = "flight already holds an active allocation";

/// Only storage failures surface as errors. Capacity outcomes are `Placement`s.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Civil,
    /// The latest-leaving civil occupant was moved to the military pool first.
    CivilAfterTransfer { displaced: Transfer },
    MilitaryOverflow,
    Saturated,
    AlreadyAllocated,
}

impl Placement {
    pub fn label(&self) -> &'static str {
        match self {
            Placement::Civil => "civil",
            Placement::CivilAfterTransfer { .. } => "civil_after_transfer",
            Placement::MilitaryOverflow => "military_overflow",
            Placement::Saturated => "saturated",
            Placement::AlreadyAllocated => "already_allocated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationOutcome {
    pub placement: Placement,
    pub spot: Option<Spot>,
    pub allocation: Option<Allocation>,
    pub reason: String,
}

impl AllocationOutcome {
    pub fn success(&self) -> bool {
        !matches!(self.placement, Placement::Saturated)
    }

    pub fn overflow_to_military(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.overflow_to_military)
    }
}

/// What the engine asks for when claiming a spot.
struct Claim<'a> {
    flight: &'a Flight,
    size: SizeClass,
    duration_minutes: u32,
    conflict_probability: f64,
    overflow_reason: Option<&'a str>,
    conflict_resolution: Option<String>,
}

pub struct AllocationEngine {
    store: Arc<dyn ParkingStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn ParkingStore>, notifier: Arc<dyn NotificationSink>, clock: Arc<dyn Clock>) -> Self {
        Self { store, notifier, clock }
    }

    pub fn store(&self) -> &Arc<dyn ParkingStore> {
        &self.store
    }

    #[instrument(skip_all, fields(flight_id = %flight.id))]
    pub async fn allocate(
        &self,
        flight: &Flight,
        predicted_duration_minutes: u32,
        conflict_probability: f64,
    ) -> Result<AllocationOutcome, AllocationError> {
        if let Some(existing) = self.store.get_active_allocation(&flight.id).await {
            return Ok(self.already_allocated(existing).await);
        }

        let size = size_for_aircraft(flight.aircraft_type.as_deref());
        let probability = normalize_probability(conflict_probability);
        let conflict = probability >= CONFLICT_THRESHOLD;
        let duration_minutes = if predicted_duration_minutes == 0 {
            DEFAULT_OCCUPATION_MINUTES
        } else {
            predicted_duration_minutes
        };
        let claim = |overflow_reason: Option<&'static str>, conflict_resolution: Option<String>| Claim {
            flight,
            size,
            duration_minutes,
            conflict_probability: probability,
            overflow_reason,
            conflict_resolution,
        };
        debug!(size = size.as_str(), probability, conflict, "allocating");

        if !conflict
            && let Some(outcome) = self.claim_pool(SpotType::Civil, claim(None, None)).await?
        {
            return Ok(self.finish(Placement::Civil, outcome, REASON_CIVIL).await);
        }

        warn!(conflict, "civil path closed, attempting preemptive transfer");
        if let Some(displaced) = self.displace_latest_civil_occupant(size).await? {
            let resolution = conflict.then(|| {
                format!(
                    "moved {} from {} to {} before assignment",
                    displaced.closed.flight_id, displaced.closed.spot_id, displaced.opened.spot_id
                )
            });
            if let Some(outcome) = self.claim_pool(SpotType::Civil, claim(None, resolution)).await? {
                let placement = Placement::CivilAfterTransfer { displaced };
                return Ok(self.finish(placement, outcome, REASON_AFTER_TRANSFER).await);
            }
        }

        let resolution = conflict.then(|| "isolated on military overflow".to_string());
        if let Some(outcome) = self
            .claim_pool(SpotType::Military, claim(Some(REASON_OVERFLOW), resolution))
            .await?
        {
            self.notifier
                .create(
                    NotificationKind::Overflow,
                    Severity::Warning,
                    format!(
                        "Flight {} sent to military spot {}: {REASON_OVERFLOW}",
                        flight.label(),
                        outcome.0.id
                    ),
                    Some(&flight.id),
                )
                .await;
            return Ok(self.finish(Placement::MilitaryOverflow, outcome, REASON_OVERFLOW).await);
        }

        warn!(size = size.as_str(), "complete saturation");
        self.notifier
            .create(
                NotificationKind::Saturation,
                Severity::Critical,
                format!(
                    "Parking saturation: no civil or military spot for {} ({})",
                    flight.label(),
                    size.as_str()
                ),
                Some(&flight.id),
            )
            .await;
        metrics::counter!(observability::ALLOCATIONS_TOTAL, "placement" => Placement::Saturated.label())
            .increment(1);
        Ok(AllocationOutcome {
            placement: Placement::Saturated,
            spot: None,
            allocation: None,
            reason: REASON_SATURATED.to_string(),
        })
    }

    async fn already_allocated(&self, existing: Allocation) -> AllocationOutcome {
        metrics::counter!(observability::ALLOCATIONS_TOTAL, "placement" => Placement::AlreadyAllocated.label())
            .increment(1);
        AllocationOutcome {
            placement: Placement::AlreadyAllocated,
            spot: self.store.get_spot(&existing.spot_id).await,
            allocation: Some(existing),
            reason: REASON_ALREADY_ALLOCATED.to_string(),
        }
    }

    async fn finish(
        &self,
        placement: Placement,
        (spot, allocation): (Spot, Allocation),
        reason: &str,
    ) -> AllocationOutcome {
        if allocation.conflict_detected {
            self.notifier
                .create(
                    NotificationKind::Conflict,
                    Severity::Critical,
                    format!(
                        "Conflict detected for flight {} (spot {}), probability {:.1}%",
                        allocation.flight_id,
                        spot.id,
                        allocation.conflict_probability * 100.0
                    ),
                    Some(&allocation.flight_id),
                )
                .await;
        }
        metrics::counter!(observability::ALLOCATIONS_TOTAL, "placement" => placement.label()).increment(1);
        info!(spot_id = %spot.id, placement = placement.label(), "allocated");
        AllocationOutcome {
            placement,
            spot: Some(spot),
            allocation: Some(allocation),
            reason: reason.to_string(),
        }
    }

    /// Walk the pool's free spots best-first and take the first one still free when locked.
    /// `Ok(None)` when the pool has nothing that fits.
    async fn claim_pool(
        &self,
        pool: SpotType,
        claim: Claim<'_>,
    ) -> Result<Option<(Spot, Allocation)>, AllocationError> {
        let now = self.clock.now_ms();
        for spot in self.store.get_available_spots(pool, claim.size).await {
            let new = NewAllocation {
                flight_id: claim.flight.id.clone(),
                spot_id: spot.id.clone(),
                allocated_at: now,
                predicted_duration_minutes: claim.duration_minutes,
                predicted_end_time: now + claim.duration_minutes as Ms * MINUTE_MS,
                overflow_to_military: pool == SpotType::Military,
                overflow_reason: claim.overflow_reason.map(str::to_string),
                conflict_probability: claim.conflict_probability,
                conflict_resolution: claim.conflict_resolution.clone(),
            };
            match self.store.create_allocation(new).await {
                Ok(allocation) => return Ok(Some((spot, allocation))),
                Err(StoreError::SpotUnavailable { spot_id, .. }) => {
                    debug!(spot_id, "lost race for spot, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Move the civil occupant that would stay longest to a military spot that fits it.
    /// Only occupants of spots able to host `incoming` are considered.
    async fn displace_latest_civil_occupant(
        &self,
        incoming: SizeClass,
    ) -> Result<Option<Transfer>, AllocationError> {
        let mut candidate: Option<Allocation> = None;
        for allocation in self.store.get_active_allocations().await {
            let Some(spot) = self.store.get_spot(&allocation.spot_id).await else {
                continue;
            };
            if spot.spot_type != SpotType::Civil || !spot.fits(incoming) {
                continue;
            }
            // Strict max on predicted end; ties keep the older allocation.
            let replace = match &candidate {
                None => true,
                Some(best) => {
                    allocation.predicted_end_time > best.predicted_end_time
                        || (allocation.predicted_end_time == best.predicted_end_time && allocation.id < best.id)
                }
            };
            if replace {
                candidate = Some(allocation);
            }
        }
        let Some(victim) = candidate else {
            debug!("no civil occupant to displace");
            return Ok(None);
        };

        let victim_flight = self.store.get_flight(&victim.flight_id).await;
        let victim_size = size_for_aircraft(
            victim_flight
                .as_ref()
                .and_then(|f| f.aircraft_type.as_deref()),
        );
        let now = self.clock.now_ms();
        let remaining = ((victim.predicted_end_time - now).div_euclid(MINUTE_MS))
            .max(MIN_TRANSFER_DURATION_MINUTES as i64) as u32;

        for military in self.store.get_available_spots(SpotType::Military, victim_size).await {
            let next = NewAllocation {
                flight_id: victim.flight_id.clone(),
                spot_id: military.id.clone(),
                allocated_at: now,
                predicted_duration_minutes: remaining,
                predicted_end_time: victim.predicted_end_time,
                overflow_to_military: true,
                overflow_reason: Some(REASON_DISPLACED.to_string()),
                conflict_probability: 0.0,
                conflict_resolution: None,
            };
            match self.store.transfer_allocation(victim.id, next, now).await {
                Ok(transfer) => {
                    let label = victim_flight
                        .as_ref()
                        .map(|f| f.label().to_string())
                        .unwrap_or_else(|| victim.flight_id.clone());
                    self.notifier
                        .create(
                            NotificationKind::Overflow,
                            Severity::Warning,
                            format!(
                                "Flight {label} moved from {} to military spot {}: {REASON_DISPLACED}",
                                victim.spot_id, military.id
                            ),
                            Some(&victim.flight_id),
                        )
                        .await;
                    metrics::counter!(observability::TRANSFERS_TOTAL).increment(1);
                    info!(
                        displaced = %victim.flight_id,
                        from = %victim.spot_id,
                        to = %military.id,
                        remaining_minutes = remaining,
                        "preemptive transfer"
                    );
                    return Ok(Some(transfer));
                }
                Err(StoreError::SpotUnavailable { .. }) => continue,
                // Occupant left while we were deciding.
                Err(StoreError::AllocationNotActive(_) | StoreError::AllocationNotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        debug!(size = victim_size.as_str(), "no military spot for displaced flight");
        Ok(None)
    }

    /// Bring an overflow flight back to `civil_spot_id`. `false` when the flight is not in
    /// overflow or the spot cannot take it; nothing is changed in that case.
    #[instrument(skip(self))]
    pub async fn recall(&self, flight_id: &str, civil_spot_id: &str) -> Result<bool, AllocationError> {
        let Some(active) = self.store.get_active_allocation(flight_id).await else {
            return Ok(false);
        };
        if !active.overflow_to_military {
            debug!("not in military overflow");
            return Ok(false);
        }
        let Some(spot) = self.store.get_spot(civil_spot_id).await else {
            return Ok(false);
        };
        let flight = self.store.get_flight(flight_id).await;
        let size = size_for_aircraft(flight.as_ref().and_then(|f| f.aircraft_type.as_deref()));
        if spot.spot_type != SpotType::Civil || spot.status != SpotStatus::Available || !spot.fits(size) {
            return Ok(false);
        }

        let now = self.clock.now_ms();
        let next = NewAllocation {
            flight_id: flight_id.to_string(),
            spot_id: spot.id.clone(),
            allocated_at: now,
            predicted_duration_minutes: active.predicted_duration_minutes,
            predicted_end_time: now + active.predicted_duration_minutes as Ms * MINUTE_MS,
            overflow_to_military: false,
            overflow_reason: None,
            conflict_probability: 0.0,
            conflict_resolution: None,
        };
        match self.store.transfer_allocation(active.id, next, now).await {
            Ok(_) => {}
            Err(
                StoreError::SpotUnavailable { .. }
                | StoreError::AllocationNotActive(_)
                | StoreError::AllocationNotFound(_),
            ) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let label = flight.as_ref().map(|f| f.label()).unwrap_or(flight_id);
        self.notifier
            .create(
                NotificationKind::Recall,
                Severity::Info,
                format!("Flight {label} recalled from {} to civil spot {}", active.spot_id, spot.id),
                Some(flight_id),
            )
            .await;
        metrics::counter!(observability::RECALLS_TOTAL).increment(1);
        info!(from = %active.spot_id, to = %spot.id, "recalled");
        Ok(true)
    }

    /// Close the flight's active allocation and free its spot. `false` if there is none.
    #[instrument(skip(self))]
    pub async fn release(&self, flight_id: &str) -> Result<bool, AllocationError> {
        let Some(active) = self.store.get_active_allocation(flight_id).await else {
            return Ok(false);
        };
        let closed = match self.store.complete_allocation(active.id, self.clock.now_ms()).await {
            Ok(closed) => closed,
            Err(StoreError::AllocationNotActive(_) | StoreError::AllocationNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let label = self
            .store
            .get_flight(flight_id)
            .await
            .map(|f| f.label().to_string())
            .unwrap_or_else(|| flight_id.to_string());
        self.notifier
            .create(
                NotificationKind::ParkingFreed,
                Severity::Info,
                format!("Spot {} freed by flight {label}", closed.spot_id),
                Some(flight_id),
            )
            .await;
        metrics::counter!(observability::RELEASES_TOTAL).increment(1);
        info!(
            spot_id = %closed.spot_id,
            duration_minutes = closed.actual_duration_minutes.unwrap_or_default(),
            "released"
        );
        Ok(true)
    }

    /// Admin move of an active allocation to a chosen free spot. The overflow flag follows
    /// the target pool. `None` when the flight has no active allocation or the target is taken.
    #[instrument(skip(self))]
    pub async fn manual_transfer(
        &self,
        flight_id: &str,
        target_spot_id: &str,
    ) -> Result<Option<Transfer>, AllocationError> {
        let Some(active) = self.store.get_active_allocation(flight_id).await else {
            return Ok(None);
        };
        let target = self
            .store
            .get_spot(target_spot_id)
            .await
            .ok_or_else(|| StoreError::SpotNotFound(target_spot_id.to_string()))?;

        let now = self.clock.now_ms();
        let to_military = target.spot_type == SpotType::Military;
        let remaining = ((active.predicted_end_time - now).div_euclid(MINUTE_MS))
            .max(MIN_TRANSFER_DURATION_MINUTES as i64) as u32;
        let next = NewAllocation {
            flight_id: flight_id.to_string(),
            spot_id: target.id.clone(),
            allocated_at: now,
            predicted_duration_minutes: remaining,
            predicted_end_time: active.predicted_end_time.max(now + remaining as Ms * MINUTE_MS),
            overflow_to_military: to_military,
            overflow_reason: to_military.then(|| "manual transfer".to_string()),
            conflict_probability: active.conflict_probability,
            conflict_resolution: active.conflict_resolution.clone(),
        };
        let transfer = match self.store.transfer_allocation(active.id, next, now).await {
            Ok(t) => t,
            Err(
                StoreError::SpotUnavailable { .. }
                | StoreError::AllocationNotActive(_)
                | StoreError::AllocationNotFound(_),
            ) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (kind, severity) = if to_military {
            (NotificationKind::Overflow, Severity::Warning)
        } else {
            (NotificationKind::Recall, Severity::Info)
        };
        self.notifier
            .create(
                kind,
                severity,
                format!("Flight {flight_id} moved from {} to {} by operator", active.spot_id, target.id),
                Some(flight_id),
            )
            .await;
        Ok(Some(transfer))
    }

    pub async fn occupancy(&self) -> Occupancy {
        self.store.occupancy().await
    }

    /// Raise a saturation alert when civil occupancy passes the warning level.
    pub async fn check_saturation(&self) -> Option<Notification> {
        let occ = self.store.occupancy().await;
        let rate = occ.civil_rate();
        metrics::gauge!(observability::CIVIL_OCCUPANCY_PERCENT).set(rate);
        if rate <= SATURATION_WARNING_PERCENT {
            return None;
        }
        let severity = if rate > SATURATION_CRITICAL_PERCENT {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let notification = self
            .notifier
            .create(
                NotificationKind::Saturation,
                severity,
                format!(
                    "Civil parking {rate:.1}% occupied, {} spot(s) left",
                    occ.civil_available
                ),
                None,
            )
            .await;
        Some(notification)
    }

    /// Raise a delay notification for significant predicted delays.
    pub async fn report_delay(&self, flight_id: &str, delay_minutes: i64) -> Option<Notification> {
        if delay_minutes < DELAY_WARNING_MINUTES {
            return None;
        }
        let severity = if delay_minutes >= DELAY_CRITICAL_MINUTES {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let label = self
            .store
            .get_flight(flight_id)
            .await
            .map(|f| f.label().to_string())
            .unwrap_or_else(|| flight_id.to_string());
        let notification = self
            .notifier
            .create(
                NotificationKind::Delay,
                severity,
                format!("Flight {label} delayed by {delay_minutes} minutes"),
                Some(flight_id),
            )
            .await;
        Some(notification)
    }
}
