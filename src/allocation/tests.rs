use std::path::PathBuf;
use std::sync::Arc;

use super::*;
use crate::clock::ManualClock;
use crate::notify::NotifyHub;
use crate::store::Store;

const T0: Ms = 1_700_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("apron_test_allocation");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Fixture {
    store: Arc<Store>,
    hub: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    engine: AllocationEngine,
}

fn fixture(name: &str) -> Fixture {
    let store = Arc::new(Store::open(&test_wal_path(name)).unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let hub = Arc::new(NotifyHub::new(clock.clone()));
    let engine = AllocationEngine::new(store.clone(), hub.clone(), clock.clone());
    Fixture { store, hub, clock, engine }
}

impl Fixture {
    async fn spot(&self, id: &str, spot_type: SpotType, size: SizeClass, jetway: bool, distance: u32) {
        self.store
            .register_spot(Spot {
                id: id.into(),
                spot_type,
                status: SpotStatus::Available,
                size_capacity: size,
                has_jetway: jetway,
                distance_to_terminal: distance,
                admin_configurable: true,
                notes: None,
            })
            .await
            .unwrap();
    }

    async fn flight(&self, id: &str, aircraft_type: &str) -> Flight {
        self.store
            .upsert_flight(Flight {
                id: id.into(),
                callsign: Some(format!("CS{id}")),
                aircraft_type: Some(aircraft_type.into()),
                direction: Direction::Arrival,
                status: FlightStatus::Scheduled,
                origin: None,
                destination: None,
                first_seen: T0,
                last_seen: T0,
                telemetry: None,
                predictions: FlightPredictions::default(),
                assigned_spot: None,
            })
            .await
            .unwrap()
            .flight
    }

    async fn assert_invariants(&self) {
        for s in self.store.list_spots().await {
            let active = self.store.get_active_allocations_by_spot(&s.id);
            if s.status == SpotStatus::Occupied {
                assert_eq!(active.len(), 1, "spot {}", s.id);
            } else {
                assert!(active.is_empty(), "spot {}", s.id);
            }
        }
        for a in self.store.get_active_allocations() {
            assert_eq!(a.conflict_detected, a.conflict_probability >= CONFLICT_THRESHOLD);
            assert!((0.0..=1.0).contains(&a.conflict_probability));
        }
    }
}

#[tokio::test]
async fn civil_spot_preferred_by_jetway_then_distance() {
    let fx = fixture("civil_preferred.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 50).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Medium, true, 400).await;
    fx.spot("C03", SpotType::Civil, SizeClass::Medium, true, 150).await;
    fx.spot("M01", SpotType::Military, SizeClass::Large, false, 900).await;
    let f = fx.flight("a00001", "A320").await;

    let outcome = fx.engine.allocate(&f, 40, 0.1).await.unwrap();
    assert_eq!(outcome.placement, Placement::Civil);
    assert!(outcome.success());
    assert!(!outcome.overflow_to_military());
    assert_eq!(outcome.spot.unwrap().id, "C03");
    let a = outcome.allocation.unwrap();
    assert_eq!(a.predicted_end_time, T0 + 40 * MINUTE_MS);
    assert!(!a.conflict_detected);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Conflict), 0);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn large_aircraft_skips_small_spots() {
    let fx = fixture("large_skips_small.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Large, false, 500).await;
    let f = fx.flight("a00002", "B77W").await;

    let outcome = fx.engine.allocate(&f, 90, 0.0).await.unwrap();
    assert_eq!(outcome.spot.unwrap().id, "C02");
}

#[tokio::test]
async fn second_allocate_is_idempotent() {
    let fx = fixture("idempotent.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Medium, true, 20).await;
    let f = fx.flight("a00003", "A320").await;

    let first = fx.engine.allocate(&f, 30, 0.0).await.unwrap();
    let second = fx.engine.allocate(&f, 30, 0.0).await.unwrap();
    assert_eq!(second.placement, Placement::AlreadyAllocated);
    assert!(second.success());
    assert_eq!(second.allocation.unwrap().id, first.allocation.unwrap().id);
    assert_eq!(fx.store.get_active_allocations().len(), 1);
}

#[tokio::test]
async fn zero_duration_falls_back_to_default() {
    let fx = fixture("zero_duration.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    let f = fx.flight("a00004", "A320").await;

    let a = fx.engine.allocate(&f, 0, 0.0).await.unwrap().allocation.unwrap();
    assert_eq!(a.predicted_duration_minutes, DEFAULT_OCCUPATION_MINUTES);
}

/// Five civil spots full, one military free: the occupant leaving last moves to military
/// and the new flight takes its civil spot.
#[tokio::test]
async fn full_civil_displaces_latest_leaving_occupant() {
    let fx = fixture("scenario_a.wal");
    for i in 1..=5 {
        fx.spot(&format!("C0{i}"), SpotType::Civil, SizeClass::Medium, false, i * 100).await;
    }
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;

    let durations = [30, 200, 60, 90, 45];
    let mut occupants = Vec::new();
    for (i, minutes) in durations.iter().enumerate() {
        let f = fx.flight(&format!("occ{i:03}"), "A320").await;
        let outcome = fx.engine.allocate(&f, *minutes, 0.0).await.unwrap();
        assert_eq!(outcome.placement, Placement::Civil);
        occupants.push(outcome.allocation.unwrap());
    }
    let longest = occupants[1].clone();

    fx.clock.advance_minutes(20);
    let incoming = fx.flight("new001", "A320").await;
    let outcome = fx.engine.allocate(&incoming, 50, 0.0).await.unwrap();

    let Placement::CivilAfterTransfer { displaced } = &outcome.placement else {
        panic!("expected displacement, got {:?}", outcome.placement);
    };
    assert_eq!(displaced.closed.id, longest.id);
    assert_eq!(displaced.closed.actual_duration_minutes, Some(20));
    assert_eq!(displaced.opened.spot_id, "M01");
    assert!(displaced.opened.overflow_to_military);
    assert_eq!(displaced.opened.overflow_reason.as_deref(), Some(REASON_DISPLACED));
    assert_eq!(displaced.opened.predicted_end_time, longest.predicted_end_time);
    assert_eq!(displaced.opened.predicted_duration_minutes, 180);

    assert!(outcome.success());
    assert!(!outcome.overflow_to_military());
    assert_eq!(outcome.spot.as_ref().unwrap().id, longest.spot_id);

    let moved = fx.store.get_active_allocation(&longest.flight_id).unwrap();
    assert_eq!(moved.spot_id, "M01");
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Overflow), 1);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn displaced_flight_keeps_at_least_minimum_duration() {
    let fx = fixture("minimum_remaining.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;
    let first = fx.flight("min001", "A320").await;
    fx.engine.allocate(&first, 15, 0.0).await.unwrap();

    fx.clock.advance_minutes(12);
    let incoming = fx.flight("min002", "A320").await;
    let outcome = fx.engine.allocate(&incoming, 30, 0.0).await.unwrap();
    let Placement::CivilAfterTransfer { displaced } = outcome.placement else {
        panic!("expected displacement");
    };
    assert_eq!(displaced.opened.predicted_duration_minutes, MIN_TRANSFER_DURATION_MINUTES);
}

#[tokio::test]
async fn direct_overflow_when_no_civil_occupant_can_be_displaced() {
    let fx = fixture("direct_overflow.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Small, false, 100).await;
    fx.spot("M01", SpotType::Military, SizeClass::Large, false, 900).await;
    let small = fx.flight("ovf001", "E190").await;
    fx.engine.allocate(&small, 60, 0.0).await.unwrap();

    let medium = fx.flight("ovf002", "A320").await;
    let outcome = fx.engine.allocate(&medium, 60, 0.0).await.unwrap();
    assert_eq!(outcome.placement, Placement::MilitaryOverflow);
    assert!(outcome.overflow_to_military());
    assert_eq!(outcome.reason, REASON_OVERFLOW);
    let a = outcome.allocation.unwrap();
    assert_eq!(a.spot_id, "M01");
    assert_eq!(a.overflow_reason.as_deref(), Some(REASON_OVERFLOW));
    assert_eq!(fx.store.get_active_allocation("ovf001").unwrap().spot_id, "C01");
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Overflow), 1);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn conflict_on_empty_apron_isolates_on_military() {
    let fx = fixture("conflict_isolated.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;
    let f = fx.flight("cfl001", "A320").await;

    let outcome = fx.engine.allocate(&f, 30, 0.8).await.unwrap();
    assert_eq!(outcome.placement, Placement::MilitaryOverflow);
    let a = outcome.allocation.unwrap();
    assert!(a.conflict_detected);
    assert!(a.conflict_resolution.is_some());
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Conflict), 1);
    fx.assert_invariants().await;
}

/// A conflicting flight never takes a civil spot directly: no displacement and no
/// military spot means saturation even with civil capacity free.
#[tokio::test]
async fn conflict_without_military_capacity_saturates() {
    let fx = fixture("conflict_saturated.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    let f = fx.flight("cfl002", "A320").await;

    let outcome = fx.engine.allocate(&f, 30, 0.8).await.unwrap();
    assert_eq!(outcome.placement, Placement::Saturated);
    assert!(!outcome.success());
    assert!(outcome.allocation.is_none());
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Saturation), 1);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Conflict), 0);
    assert!(fx.store.get_active_allocation("cfl002").is_none());
    assert_eq!(fx.store.get_spot("C01").await.unwrap().status, SpotStatus::Available);
    fx.assert_invariants().await;
}

#[tokio::test]
async fn out_of_range_probability_is_clamped() {
    let fx = fixture("clamped.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, true, 10).await;
    let f = fx.flight("clp001", "A320").await;

    let a = fx.engine.allocate(&f, 30, -3.0).await.unwrap().allocation.unwrap();
    assert_eq!(a.conflict_probability, 0.0);
    assert!(!a.conflict_detected);
}

/// Every spot taken: failure, saturation reason, exactly one saturation alert.
#[tokio::test]
async fn complete_saturation_fails_with_one_alert() {
    let fx = fixture("scenario_b.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Medium, false, 200).await;
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;
    for i in 0..3 {
        let f = fx.flight(&format!("sat{i:03}"), "A320").await;
        assert!(fx.engine.allocate(&f, 60, 0.0).await.unwrap().success());
    }
    let before = fx.store.get_active_allocations();

    let f = fx.flight("sat999", "A320").await;
    let outcome = fx.engine.allocate(&f, 60, 0.0).await.unwrap();
    assert!(!outcome.success());
    assert_eq!(outcome.placement, Placement::Saturated);
    assert!(outcome.reason.contains("saturation"));
    assert!(outcome.spot.is_none());
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Saturation), 1);
    assert_eq!(fx.store.get_active_allocations(), before);
    fx.assert_invariants().await;
}

/// Recall of a flight that is not in overflow: false, nothing changes.
#[tokio::test]
async fn recall_requires_overflow() {
    let fx = fixture("scenario_c.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Medium, false, 200).await;
    let f = fx.flight("rcl001", "A320").await;
    let a = fx.engine.allocate(&f, 60, 0.0).await.unwrap().allocation.unwrap();
    let spots_before = fx.store.list_spots().await;

    assert!(!fx.engine.recall("rcl001", "C02").await.unwrap());
    assert!(!fx.engine.recall("missing", "C02").await.unwrap());
    assert_eq!(fx.store.get_active_allocation("rcl001").unwrap(), a);
    assert_eq!(fx.store.list_spots().await, spots_before);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Recall), 0);
}

#[tokio::test]
async fn recall_moves_overflow_flight_back_to_civil() {
    let fx = fixture("recall_ok.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;
    let first = fx.flight("rcl002", "A320").await;
    fx.engine.allocate(&first, 60, 0.0).await.unwrap();
    let second = fx.flight("rcl003", "A320").await;
    // Displaces rcl002 to M01.
    fx.engine.allocate(&second, 120, 0.0).await.unwrap();
    let overflow = fx.store.get_active_allocation("rcl002").unwrap();
    assert!(overflow.overflow_to_military);

    fx.clock.advance_minutes(5);
    assert!(!fx.engine.recall("rcl002", "C01").await.unwrap(), "C01 still occupied");
    assert!(!fx.engine.recall("rcl002", "M01").await.unwrap(), "not a civil spot");

    fx.engine.release("rcl003").await.unwrap();
    assert!(fx.engine.recall("rcl002", "C01").await.unwrap());

    let back = fx.store.get_active_allocation("rcl002").unwrap();
    assert_eq!(back.spot_id, "C01");
    assert!(!back.overflow_to_military);
    assert_eq!(back.predicted_duration_minutes, overflow.predicted_duration_minutes);
    assert_eq!(
        back.predicted_end_time,
        fx.clock.now_ms() + overflow.predicted_duration_minutes as Ms * MINUTE_MS
    );
    assert_eq!(fx.store.get_spot("M01").await.unwrap().status, SpotStatus::Available);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Recall), 1);
    fx.assert_invariants().await;
}

/// Release 37 minutes after allocation records 37 minutes and frees the spot.
#[tokio::test]
async fn release_records_actual_duration() {
    let fx = fixture("scenario_d.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    let f = fx.flight("rel001", "A320").await;
    let a = fx.engine.allocate(&f, 60, 0.0).await.unwrap().allocation.unwrap();
    assert_eq!(a.allocated_at, T0);

    fx.clock.advance_minutes(37);
    assert!(fx.engine.release("rel001").await.unwrap());

    let history = fx.store.get_allocation_history("rel001");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actual_start_time, Some(T0));
    assert_eq!(history[0].actual_end_time, Some(T0 + 37 * MINUTE_MS));
    assert_eq!(history[0].actual_duration_minutes, Some(37));
    assert_eq!(fx.store.get_spot("C01").await.unwrap().status, SpotStatus::Available);
    assert_eq!(fx.store.get_flight("rel001").await.unwrap().assigned_spot, None);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::ParkingFreed), 1);

    assert!(!fx.engine.release("rel001").await.unwrap());
    assert_eq!(fx.hub.count_by_kind(NotificationKind::ParkingFreed), 1);
}

#[tokio::test]
async fn manual_transfer_follows_target_pool() {
    let fx = fixture("manual_transfer.wal");
    fx.spot("C01", SpotType::Civil, SizeClass::Medium, false, 100).await;
    fx.spot("C02", SpotType::Civil, SizeClass::Medium, false, 200).await;
    fx.spot("M01", SpotType::Military, SizeClass::Medium, false, 900).await;
    let f = fx.flight("man001", "A320").await;
    fx.engine.allocate(&f, 60, 0.0).await.unwrap();

    let t = fx.engine.manual_transfer("man001", "M01").await.unwrap().unwrap();
    assert!(t.opened.overflow_to_military);
    let t = fx.engine.manual_transfer("man001", "C02").await.unwrap().unwrap();
    assert!(!t.opened.overflow_to_military);
    assert_eq!(fx.store.get_active_allocation("man001").unwrap().spot_id, "C02");

    assert!(fx.engine.manual_transfer("nobody", "C01").await.unwrap().is_none());
    assert!(matches!(
        fx.engine.manual_transfer("man001", "Z99").await,
        Err(AllocationError::Store(StoreError::SpotNotFound(_)))
    ));
    fx.assert_invariants().await;
}

#[tokio::test]
async fn saturation_check_levels() {
    let fx = fixture("saturation_check.wal");
    for i in 0..10 {
        fx.spot(&format!("C{i:02}"), SpotType::Civil, SizeClass::Medium, false, i * 10).await;
    }
    for i in 0..8 {
        let f = fx.flight(&format!("chk{i:03}"), "A320").await;
        fx.engine.allocate(&f, 60, 0.0).await.unwrap();
    }
    assert!(fx.engine.check_saturation().await.is_none());

    let f = fx.flight("chk900", "A320").await;
    fx.engine.allocate(&f, 60, 0.0).await.unwrap();
    let n = fx.engine.check_saturation().await.unwrap();
    assert_eq!(n.severity, Severity::Warning);

    let f = fx.flight("chk901", "A320").await;
    fx.engine.allocate(&f, 60, 0.0).await.unwrap();
    let n = fx.engine.check_saturation().await.unwrap();
    assert_eq!(n.severity, Severity::Critical);
    assert_eq!(fx.engine.occupancy().await.civil_available, 0);
}

#[tokio::test]
async fn delay_report_thresholds() {
    let fx = fixture("delay_report.wal");
    fx.flight("dly001", "A320").await;
    assert!(fx.engine.report_delay("dly001", 14).await.is_none());
    let n = fx.engine.report_delay("dly001", 15).await.unwrap();
    assert_eq!(n.severity, Severity::Warning);
    assert!(n.message.contains("CSdly001"));
    let n = fx.engine.report_delay("dly001", 30).await.unwrap();
    assert_eq!(n.severity, Severity::Critical);
    assert_eq!(fx.hub.count_by_kind(NotificationKind::Delay), 2);
}
