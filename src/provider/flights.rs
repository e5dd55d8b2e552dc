use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::BoundingBox;
use crate::model::{Direction, Flight, FlightPredictions, FlightStatus, Ms, Telemetry};

use super::{ProviderError, check_status, http_client};

/// One flight as reported by a demand feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub id: String,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub aircraft_type: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    pub first_seen: Ms,
    pub last_seen: Ms,
    #[serde(default)]
    pub status: Option<FlightStatus>,
}

fn same_airport(field: Option<&str>, icao: &str) -> bool {
    field.is_some_and(|f| f.trim().eq_ignore_ascii_case(icao))
}

impl FlightRecord {
    /// Arrival if it lands at `airport_icao`, departure if it leaves from it.
    pub fn direction_for(&self, airport_icao: &str) -> Option<Direction> {
        if same_airport(self.destination.as_deref(), airport_icao) {
            Some(Direction::Arrival)
        } else if same_airport(self.origin.as_deref(), airport_icao) {
            Some(Direction::Departure)
        } else {
            None
        }
    }

    pub fn to_flight(&self, direction: Direction) -> Flight {
        Flight {
            id: self.id.trim().to_ascii_lowercase(),
            callsign: self
                .callsign
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            aircraft_type: self.aircraft_type.clone(),
            direction,
            status: FlightStatus::Scheduled,
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            telemetry: None,
            predictions: FlightPredictions::default(),
            assigned_spot: None,
        }
    }
}

/// One live position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: String,
    #[serde(default)]
    pub callsign: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude_m: Option<f64>,
    #[serde(default)]
    pub velocity_ms: Option<f64>,
    #[serde(default)]
    pub heading_deg: Option<f64>,
    #[serde(default)]
    pub on_ground: bool,
    pub updated_at: Ms,
}

impl TelemetryRecord {
    /// `None` when the report carries no position.
    pub fn to_telemetry(&self) -> Option<Telemetry> {
        Some(Telemetry {
            latitude: self.latitude?,
            longitude: self.longitude?,
            altitude_m: self.altitude_m,
            velocity_ms: self.velocity_ms,
            heading_deg: self.heading_deg,
            on_ground: self.on_ground,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub begin: Ms,
    pub end: Ms,
}

impl TimeWindow {
    pub fn lookback(now: Ms, span: Ms) -> Self {
        Self { begin: now - span, end: now }
    }
}

/// A flight data feed. Empty results are `Ok(vec![])`; failures say why.
#[async_trait]
pub trait FlightSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_demand(&self, airport_icao: &str, window: TimeWindow) -> Result<Vec<FlightRecord>, ProviderError>;

    async fn fetch_live_telemetry(&self, bbox: BoundingBox) -> Result<Vec<TelemetryRecord>, ProviderError>;
}

/// JSON-over-HTTP feed: `GET /flights` for demand and `GET /states` for positions.
pub struct HttpFlightSource {
    name: String,
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFlightSource {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl FlightSource for HttpFlightSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_demand(&self, airport_icao: &str, window: TimeWindow) -> Result<Vec<FlightRecord>, ProviderError> {
        let response = self
            .get("/flights")
            .query(&[
                ("airport", airport_icao.to_string()),
                ("begin", window.begin.to_string()),
                ("end", window.end.to_string()),
            ])
            .send()
            .await?;
        let response = check_status(response, "fetch demand").await?;
        let records: Vec<FlightRecord> = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(source = %self.name, count = records.len(), "fetched demand");
        Ok(records)
    }

    async fn fetch_live_telemetry(&self, bbox: BoundingBox) -> Result<Vec<TelemetryRecord>, ProviderError> {
        let response = self
            .get("/states")
            .query(&[
                ("lamin", bbox.lamin),
                ("lamax", bbox.lamax),
                ("lomin", bbox.lomin),
                ("lomax", bbox.lomax),
            ])
            .send()
            .await?;
        let response = check_status(response, "fetch telemetry").await?;
        let states: Vec<TelemetryRecord> = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(source = %self.name, count = states.len(), "fetched telemetry");
        Ok(states)
    }
}
