use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{Direction, SizeClass};

use super::{ProviderError, check_status, http_client};

/// Model input for one flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInput {
    pub flight_id: String,
    pub callsign: Option<String>,
    pub aircraft_type: Option<String>,
    pub size: SizeClass,
    pub direction: Direction,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub hour_of_day: u8,
    pub distance_km: Option<f64>,
    pub altitude_m: Option<f64>,
    pub velocity_ms: Option<f64>,
    /// Civil occupancy in [0, 1].
    pub civil_occupancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayProbabilities {
    pub over_15_minutes: f64,
    pub over_30_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupationBounds {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutput {
    pub eta_minutes: f64,
    pub delay_minutes: f64,
    pub delay_probabilities: DelayProbabilities,
    pub occupation_minutes: f64,
    pub occupation_bounds: OccupationBounds,
    pub conflict_probability: f64,
    pub recommendation: String,
}

impl PredictionOutput {
    fn validate(self) -> Result<Self, ProviderError> {
        let numbers = [
            self.eta_minutes,
            self.delay_minutes,
            self.occupation_minutes,
            self.conflict_probability,
        ];
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(ProviderError::InvalidResponse("non-finite prediction".into()));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub mode: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Timing and conflict estimates for a flight. Mock and remote modes share this contract.
#[async_trait]
pub trait PredictionProvider: Send + Sync {
    /// Model name; scopes cache entries.
    fn name(&self) -> &str;

    async fn predict(&self, input: &PredictionInput) -> Result<PredictionOutput, ProviderError>;

    async fn health(&self) -> ProviderHealth;
}

// ── Mock ─────────────────────────────────────────────────────────

/// Deterministic stand-in: same input, same output.
#[derive(Debug, Default, Clone)]
pub struct MockPredictionProvider;

fn stable_hash(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[async_trait]
impl PredictionProvider for MockPredictionProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn predict(&self, input: &PredictionInput) -> Result<PredictionOutput, ProviderError> {
        let h = stable_hash(&input.flight_id);

        let base = match input.size {
            SizeClass::Small => 35.0,
            SizeClass::Medium => 50.0,
            SizeClass::Large => 90.0,
        };
        let occupation = base + (h % 11) as f64 - 5.0;

        let eta = match (input.distance_km, input.velocity_ms) {
            (Some(d), Some(v)) if v > 1.0 => d / (v * 0.06),
            _ => 15.0 + ((h >> 8) % 30) as f64,
        };
        let delay = ((h >> 16) % 40) as f64 - 5.0;
        let occupancy = input.civil_occupancy.clamp(0.0, 1.0);
        let conflict = ((occupancy - 0.6) / 0.4).clamp(0.0, 1.0) * 0.9;

        let recommendation = if conflict >= 0.5 {
            "isolate"
        } else if occupancy > 0.85 {
            "prefer_overflow"
        } else {
            "standard"
        };

        Ok(PredictionOutput {
            eta_minutes: eta,
            delay_minutes: delay,
            delay_probabilities: DelayProbabilities {
                over_15_minutes: ((delay - 5.0) / 30.0).clamp(0.0, 1.0),
                over_30_minutes: ((delay - 20.0) / 20.0).clamp(0.0, 1.0),
            },
            occupation_minutes: occupation,
            occupation_bounds: OccupationBounds {
                lower: occupation * 0.8,
                upper: occupation * 1.25,
            },
            conflict_probability: conflict,
            recommendation: recommendation.to_string(),
        })
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            healthy: true,
            mode: "mock".into(),
            detail: None,
        }
    }
}

// ── Remote ───────────────────────────────────────────────────────

/// Prediction service over HTTP: `POST /predict`, `GET /health`.
pub struct HttpPredictionProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

impl HttpPredictionProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_health(&self) -> Result<ProviderHealth, ProviderError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let response = check_status(response, "health").await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PredictionProvider for HttpPredictionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, input: &PredictionInput) -> Result<PredictionOutput, ProviderError> {
        let response = self
            .client
            .post(format!("{}/predict", self.base_url))
            .json(input)
            .send()
            .await?;
        let response = check_status(response, "predict").await?;
        let output: PredictionOutput = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        output.validate()
    }

    async fn health(&self) -> ProviderHealth {
        self.fetch_health().await.unwrap_or_else(|e| ProviderHealth {
            healthy: false,
            mode: "remote".into(),
            detail: Some(e.to_string()),
        })
    }
}
