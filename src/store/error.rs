use thiserror::Error;
use ulid::Ulid;

use crate::model::{FlightStatus, SpotStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("spot not found: {0}")]
    SpotNotFound(String),
    #[error("spot already registered: {0}")]
    SpotExists(String),
    #[error("flight not found: {0}")]
    FlightNotFound(String),
    #[error("allocation not found: {0}")]
    AllocationNotFound(Ulid),
    #[error("spot {spot_id} is not available (status {status:?})")]
    SpotUnavailable { spot_id: String, status: SpotStatus },
    #[error("flight {flight_id} already holds active allocation {allocation_id}")]
    AlreadyAllocated { flight_id: String, allocation_id: Ulid },
    #[error("allocation {0} is already closed")]
    AllocationNotActive(Ulid),
    #[error("status {0:?} cannot be set by an administrator")]
    InvalidStatus(SpotStatus),
    #[error("flight {flight_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        flight_id: String,
        from: FlightStatus,
        to: FlightStatus,
    },
    #[error("spot {0} holds an active allocation")]
    SpotBusy(String),
    #[error("invalid spot: {0}")]
    InvalidSpot(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}
