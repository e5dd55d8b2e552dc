//! Runtime configuration, read from `APRON_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::limits::{MAX_SYNC_INTERVAL_MINUTES, MIN_SYNC_INTERVAL_MINUTES};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
    #[error("{0} is required when prediction mode is remote")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMode {
    Mock,
    Remote,
}

impl FromStr for PredictionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(PredictionMode::Mock),
            "remote" | "real" => Ok(PredictionMode::Remote),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
}

impl StorageConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("apron.wal")
    }
}

#[derive(Debug, Clone)]
pub struct AirportConfig {
    pub icao: String,
    pub iata: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of the live telemetry box.
    pub radius_km: f64,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval_minutes: u64,
    pub lookback: Duration,
    /// Flights processed concurrently within one sync.
    pub batch_width: usize,
    /// Minimum gap between two uses of the secondary source.
    pub secondary_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub recall_interval: Duration,
    pub release_interval: Duration,
    pub sync_misfire_grace: Duration,
    pub sweep_misfire_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub primary_url: String,
    pub primary_token: Option<String>,
    pub secondary_url: Option<String>,
    pub secondary_token: Option<String>,
    pub prediction_mode: PredictionMode,
    pub prediction_url: Option<String>,
    pub call_timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub airport: AirportConfig,
    pub sync: SyncConfig,
    pub jobs: JobsConfig,
    pub providers: ProvidersConfig,
    pub cache: CacheConfig,
    /// JSON spot layout used to seed an empty store.
    pub layout_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let interval_minutes = env.parse("APRON_SYNC_INTERVAL_MINUTES", 5u64)?;
        if !(MIN_SYNC_INTERVAL_MINUTES..=MAX_SYNC_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(ConfigError::OutOfRange {
                key: "APRON_SYNC_INTERVAL_MINUTES",
                reason: format!(
                    "{interval_minutes} not in [{MIN_SYNC_INTERVAL_MINUTES}, {MAX_SYNC_INTERVAL_MINUTES}]"
                ),
            });
        }
        let batch_width = env.parse("APRON_SYNC_BATCH_WIDTH", 10usize)?;
        if batch_width == 0 {
            return Err(ConfigError::OutOfRange {
                key: "APRON_SYNC_BATCH_WIDTH",
                reason: "must be at least 1".into(),
            });
        }

        let prediction_mode = match env.get("APRON_PREDICTION_MODE") {
            None => PredictionMode::Mock,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "APRON_PREDICTION_MODE",
                value: raw,
            })?,
        };
        let prediction_url = env.get("APRON_PREDICTION_URL");
        if prediction_mode == PredictionMode::Remote && prediction_url.is_none() {
            return Err(ConfigError::Missing("APRON_PREDICTION_URL"));
        }

        Ok(Self {
            storage: StorageConfig {
                data_dir: env.get("APRON_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
                compact_threshold: env.parse("APRON_COMPACT_THRESHOLD", 1000)?,
            },
            airport: AirportConfig {
                icao: env.get("APRON_AIRPORT_ICAO").unwrap_or_else(|| "DXXX".into()).to_ascii_uppercase(),
                iata: env.get("APRON_AIRPORT_IATA").unwrap_or_else(|| "LFW".into()).to_ascii_uppercase(),
                latitude: env.parse("APRON_AIRPORT_LAT", 6.165611)?,
                longitude: env.parse("APRON_AIRPORT_LON", 1.254797)?,
                radius_km: env.parse("APRON_TELEMETRY_RADIUS_KM", 60.0)?,
            },
            sync: SyncConfig {
                interval_minutes,
                lookback: minutes(env.parse("APRON_SYNC_LOOKBACK_MINUTES", 120)?),
                batch_width,
                secondary_cooldown: minutes(env.parse("APRON_SECONDARY_COOLDOWN_MINUTES", 12 * 60)?),
            },
            jobs: JobsConfig {
                recall_interval: minutes(env.parse("APRON_RECALL_INTERVAL_MINUTES", 2)?),
                release_interval: minutes(env.parse("APRON_RELEASE_INTERVAL_MINUTES", 3)?),
                sync_misfire_grace: Duration::from_secs(env.parse("APRON_SYNC_MISFIRE_GRACE_SECS", 300)?),
                sweep_misfire_grace: Duration::from_secs(env.parse("APRON_SWEEP_MISFIRE_GRACE_SECS", 60)?),
            },
            providers: ProvidersConfig {
                primary_url: env
                    .get("APRON_PRIMARY_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:8081".into()),
                primary_token: env.get("APRON_PRIMARY_TOKEN"),
                secondary_url: env.get("APRON_SECONDARY_URL"),
                secondary_token: env.get("APRON_SECONDARY_TOKEN"),
                prediction_mode,
                prediction_url,
                call_timeout: Duration::from_secs(env.parse("APRON_CALL_TIMEOUT_SECS", 30)?),
                max_attempts: env.parse("APRON_MAX_ATTEMPTS", 3)?,
            },
            cache: CacheConfig {
                enabled: env.parse("APRON_CACHE_ENABLED", true)?,
                ttl: Duration::from_secs(env.parse("APRON_CACHE_TTL_SECS", 300)?),
            },
            layout_file: env.get("APRON_LAYOUT_FILE").map(PathBuf::from),
            metrics_port: env.parse_opt("APRON_METRICS_PORT")?,
        })
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse_opt<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }
}
