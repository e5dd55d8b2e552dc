use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{CONFLICT_THRESHOLD, MINUTE_MS};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Whole minutes between two instants, rounded to nearest.
pub fn elapsed_minutes(start: Ms, end: Ms) -> i64 {
    ((end - start) as f64 / MINUTE_MS as f64).round() as i64
}

// ── Spots ────────────────────────────────────────────────────────

/// The two disjoint pools. Military is overflow capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotType {
    Civil,
    Military,
}

impl SpotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotType::Civil => "civil",
            SpotType::Military => "military",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotStatus::Available => "available",
            SpotStatus::Occupied => "occupied",
            SpotStatus::Reserved => "reserved",
            SpotStatus::Maintenance => "maintenance",
        }
    }
}

/// Aircraft / spot size class with the explicit order small < medium < large.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn rank(&self) -> u8 {
        match self {
            SizeClass::Small => 0,
            SizeClass::Medium => 1,
            SizeClass::Large => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        }
    }
}

impl PartialOrd for SizeClass {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SizeClass {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: String,
    pub spot_type: SpotType,
    pub status: SpotStatus,
    pub size_capacity: SizeClass,
    pub has_jetway: bool,
    /// Meters.
    pub distance_to_terminal: u32,
    #[serde(default = "default_true")]
    pub admin_configurable: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Spot {
    pub fn fits(&self, size: SizeClass) -> bool {
        self.size_capacity >= size
    }

    /// Preference order for handing out spots: jetway first, then closest to the terminal.
    pub fn preference(a: &Spot, b: &Spot) -> Ordering {
        b.has_jetway
            .cmp(&a.has_jetway)
            .then(a.distance_to_terminal.cmp(&b.distance_to_terminal))
            .then_with(|| a.id.cmp(&b.id))
    }
}

// ── Flights ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Arrival,
    Departure,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Arrival => "arrival",
            Direction::Departure => "departure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl FlightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightStatus::Scheduled => "scheduled",
            FlightStatus::Active => "active",
            FlightStatus::Completed => "completed",
            FlightStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlightStatus::Completed | FlightStatus::Cancelled)
    }

    /// Lifecycle only moves forward; any non-terminal state may be cancelled.
    pub fn can_advance_to(&self, next: FlightStatus) -> bool {
        use FlightStatus::*;
        match (self, next) {
            (Scheduled, Active) | (Scheduled, Completed) | (Active, Completed) => true,
            (Scheduled, Cancelled) | (Active, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub velocity_ms: Option<f64>,
    pub heading_deg: Option<f64>,
    pub on_ground: bool,
    pub updated_at: Ms,
}

/// Timing estimates attached to a flight after the prediction step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightPredictions {
    pub eta: Option<Ms>,
    pub etd: Option<Ms>,
    pub delay_minutes: Option<i64>,
    pub occupation_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flight {
    /// Transponder-style key (ICAO24).
    pub id: String,
    pub callsign: Option<String>,
    pub aircraft_type: Option<String>,
    pub direction: Direction,
    pub status: FlightStatus,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub first_seen: Ms,
    pub last_seen: Ms,
    pub telemetry: Option<Telemetry>,
    pub predictions: FlightPredictions,
    /// Derived from the active allocation on every read; never persisted.
    #[serde(skip)]
    pub assigned_spot: Option<String>,
}

impl Flight {
    pub fn label(&self) -> &str {
        self.callsign.as_deref().unwrap_or(&self.id)
    }
}

// ── Allocations ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub flight_id: String,
    pub spot_id: String,
    pub allocated_at: Ms,
    pub predicted_duration_minutes: u32,
    pub predicted_end_time: Ms,
    pub actual_start_time: Option<Ms>,
    pub actual_end_time: Option<Ms>,
    pub actual_duration_minutes: Option<i64>,
    pub overflow_to_military: bool,
    pub overflow_reason: Option<String>,
    pub conflict_detected: bool,
    pub conflict_probability: f64,
    pub conflict_resolution: Option<String>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.actual_end_time.is_none()
    }
}

/// Everything needed to open an allocation. The conflict flag is derived, never supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub flight_id: String,
    pub spot_id: String,
    pub allocated_at: Ms,
    pub predicted_duration_minutes: u32,
    pub predicted_end_time: Ms,
    pub overflow_to_military: bool,
    pub overflow_reason: Option<String>,
    pub conflict_probability: f64,
    pub conflict_resolution: Option<String>,
}

/// Clamp a model-supplied probability into [0, 1]; NaN counts as no risk.
pub fn normalize_probability(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

impl NewAllocation {
    pub fn into_allocation(self, id: Ulid) -> Allocation {
        let conflict_probability = normalize_probability(self.conflict_probability);
        Allocation {
            id,
            flight_id: self.flight_id,
            spot_id: self.spot_id,
            allocated_at: self.allocated_at,
            predicted_duration_minutes: self.predicted_duration_minutes,
            predicted_end_time: self.predicted_end_time,
            actual_start_time: None,
            actual_end_time: None,
            actual_duration_minutes: None,
            overflow_to_military: self.overflow_to_military,
            overflow_reason: self.overflow_reason,
            conflict_detected: conflict_probability >= CONFLICT_THRESHOLD,
            conflict_probability,
            conflict_resolution: self.conflict_resolution,
        }
    }
}

/// The actual-* fields written exactly once when an allocation ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub allocation_id: Ulid,
    pub spot_id: String,
    pub flight_id: String,
    pub actual_start_time: Ms,
    pub actual_end_time: Ms,
    pub actual_duration_minutes: i64,
}

impl Closure {
    pub fn of(allocation: &Allocation, ended_at: Ms) -> Self {
        Self {
            allocation_id: allocation.id,
            spot_id: allocation.spot_id.clone(),
            flight_id: allocation.flight_id.clone(),
            actual_start_time: allocation.allocated_at,
            actual_end_time: ended_at,
            actual_duration_minutes: elapsed_minutes(allocation.allocated_at, ended_at),
        }
    }
}

/// Result of moving a flight between spots: the closed allocation and its successor.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub closed: Allocation,
    pub opened: Allocation,
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Conflict,
    Saturation,
    Recall,
    Overflow,
    Delay,
    ParkingFreed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Conflict => "conflict",
            NotificationKind::Saturation => "saturation",
            NotificationKind::Recall => "recall",
            NotificationKind::Overflow => "overflow",
            NotificationKind::Delay => "delay",
            NotificationKind::ParkingFreed => "parking_freed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub message: String,
    pub flight_id: Option<String>,
    pub read: bool,
    pub created_at: Ms,
    pub acknowledged_at: Option<Ms>,
}

// ── Statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub civil_total: u32,
    pub civil_available: u32,
    pub civil_occupied: u32,
    pub military_total: u32,
    pub military_available: u32,
    pub military_occupied: u32,
}

impl Occupancy {
    /// Percentage of civil spots that are occupied.
    pub fn civil_rate(&self) -> f64 {
        if self.civil_total == 0 {
            return 0.0;
        }
        self.civil_occupied as f64 * 100.0 / self.civil_total as f64
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event types, no nesting beyond the records they carry. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpotRegistered { spot: Spot },
    SpotStatusChanged { spot_id: String, status: SpotStatus },
    FlightRecorded { flight: Flight },
    AllocationOpened { allocation: Allocation },
    AllocationClosed { closure: Closure },
    /// Close + open in one record so a transfer is never half-applied on replay.
    AllocationTransferred { closure: Closure, opened: Allocation },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(id: &str, jetway: bool, distance: u32) -> Spot {
        Spot {
            id: id.into(),
            spot_type: SpotType::Civil,
            status: SpotStatus::Available,
            size_capacity: SizeClass::Medium,
            has_jetway: jetway,
            distance_to_terminal: distance,
            admin_configurable: true,
            notes: None,
        }
    }

    #[test]
    fn size_order_is_explicit() {
        assert!(SizeClass::Small < SizeClass::Medium);
        assert!(SizeClass::Medium < SizeClass::Large);
        assert_eq!(SizeClass::Large.max(SizeClass::Small), SizeClass::Large);
    }

    #[test]
    fn spot_fits_smaller_or_equal() {
        let s = spot("C01", false, 10);
        assert!(s.fits(SizeClass::Small));
        assert!(s.fits(SizeClass::Medium));
        assert!(!s.fits(SizeClass::Large));
    }

    #[test]
    fn preference_jetway_then_distance() {
        let mut spots = vec![
            spot("C03", false, 20),
            spot("C02", true, 90),
            spot("C01", false, 10),
            spot("C04", true, 40),
        ];
        spots.sort_by(Spot::preference);
        let ids: Vec<_> = spots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["C04", "C02", "C01", "C03"]);
    }

    #[test]
    fn flight_status_moves_forward_only() {
        use FlightStatus::*;
        assert!(Scheduled.can_advance_to(Active));
        assert!(Active.can_advance_to(Completed));
        assert!(Active.can_advance_to(Cancelled));
        assert!(!Completed.can_advance_to(Active));
        assert!(!Cancelled.can_advance_to(Active));
        assert!(!Completed.can_advance_to(Cancelled));
        assert!(!Active.can_advance_to(Scheduled));
        assert!(!Active.can_advance_to(Active));
    }

    #[test]
    fn conflict_flag_follows_threshold() {
        let base = NewAllocation {
            flight_id: "abc123".into(),
            spot_id: "C01".into(),
            allocated_at: 0,
            predicted_duration_minutes: 30,
            predicted_end_time: 30 * MINUTE_MS,
            overflow_to_military: false,
            overflow_reason: None,
            conflict_probability: 0.5,
            conflict_resolution: None,
        };
        let a = base.clone().into_allocation(Ulid::new());
        assert!(a.conflict_detected);

        let b = NewAllocation { conflict_probability: 0.4999, ..base.clone() }.into_allocation(Ulid::new());
        assert!(!b.conflict_detected);

        let c = NewAllocation { conflict_probability: 7.0, ..base.clone() }.into_allocation(Ulid::new());
        assert_eq!(c.conflict_probability, 1.0);
        assert!(c.conflict_detected);

        let d = NewAllocation { conflict_probability: f64::NAN, ..base }.into_allocation(Ulid::new());
        assert_eq!(d.conflict_probability, 0.0);
        assert!(!d.conflict_detected);
    }

    #[test]
    fn closure_rounds_to_minutes() {
        let a = NewAllocation {
            flight_id: "abc123".into(),
            spot_id: "C01".into(),
            allocated_at: 1_000,
            predicted_duration_minutes: 30,
            predicted_end_time: 1_000 + 30 * MINUTE_MS,
            overflow_to_military: false,
            overflow_reason: None,
            conflict_probability: 0.0,
            conflict_resolution: None,
        }
        .into_allocation(Ulid::new());
        let closure = Closure::of(&a, 1_000 + 37 * MINUTE_MS + 20_000);
        assert_eq!(closure.actual_start_time, 1_000);
        assert_eq!(closure.actual_duration_minutes, 37);
        let closure = Closure::of(&a, 1_000 + 37 * MINUTE_MS + 40_000);
        assert_eq!(closure.actual_duration_minutes, 38);
    }

    #[test]
    fn occupancy_rate() {
        let occ = Occupancy {
            civil_total: 20,
            civil_available: 3,
            civil_occupied: 17,
            ..Default::default()
        };
        assert_eq!(occ.civil_rate(), 85.0);
        assert_eq!(Occupancy::default().civil_rate(), 0.0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SpotRegistered { spot: spot("C01", true, 50) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn assigned_spot_is_not_persisted() {
        let flight = Flight {
            id: "3c6444".into(),
            callsign: Some("DLH4AB".into()),
            aircraft_type: Some("A320".into()),
            direction: Direction::Arrival,
            status: FlightStatus::Scheduled,
            origin: Some("EDDF".into()),
            destination: Some("DXXX".into()),
            first_seen: 1,
            last_seen: 2,
            telemetry: None,
            predictions: FlightPredictions::default(),
            assigned_spot: Some("C01".into()),
        };
        let bytes = bincode::serialize(&Event::FlightRecorded { flight }).unwrap();
        let Event::FlightRecorded { flight } = bincode::deserialize(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(flight.assigned_spot, None);
        assert_eq!(flight.label(), "DLH4AB");
    }
}
