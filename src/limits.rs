use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// An allocation is flagged as conflicting at or above this probability.
pub const CONFLICT_THRESHOLD: f64 = 0.5;

/// Floor for the predicted duration of a flight displaced to the military pool.
pub const MIN_TRANSFER_DURATION_MINUTES: u32 = 10;

/// Fallback when a prediction yields a non-positive occupation estimate.
pub const DEFAULT_OCCUPATION_MINUTES: u32 = 45;

pub const MIN_SYNC_INTERVAL_MINUTES: u64 = 1;
pub const MAX_SYNC_INTERVAL_MINUTES: u64 = 60;

/// Civil occupancy rate (percent) above which `check_saturation` raises an alert.
pub const SATURATION_WARNING_PERCENT: f64 = 85.0;
pub const SATURATION_CRITICAL_PERCENT: f64 = 90.0;

pub const DELAY_WARNING_MINUTES: i64 = 15;
pub const DELAY_CRITICAL_MINUTES: i64 = 30;

/// Notifications the hub keeps before evicting the oldest read ones. Unread ones are never evicted.
pub const MAX_RETAINED_NOTIFICATIONS: usize = 1000;

/// Errors kept per sync report.
pub const MAX_REPORTED_ERRORS: usize = 10;

pub const MAX_SPOT_ID_LEN: usize = 16;
pub const MAX_NOTES_LEN: usize = 500;
