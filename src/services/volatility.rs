//! Volatility service client
//!
//! Advisory stop-distance recommendations keyed by hour-of-day, recent volume
//! and instrument. Every lookup is bounded by a timeout and any failure is
//! reported as a [`VolatilityError`] so the caller can fall back.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Request sent to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatilityRequest {
    pub hour: u32,
    pub recent_volume: u64,
    pub instrument: String,
}

/// Why a lookup produced no usable value
#[derive(Debug, Error)]
pub enum VolatilityError {
    #[error("volatility lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("volatility request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("volatility service returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("volatility service returned unusable value {0}")]
    InvalidValue(f64),
    #[error("volatility service unavailable: {0}")]
    Unavailable(String),
}

/// Source of recommended stop distances (in ticks)
pub trait VolatilityService: Send + Sync {
    fn recommend(&self, request: VolatilityRequest) -> BoxFuture<'_, Result<f64, VolatilityError>>;
}

/// Run one lookup under `timeout` and reject non-positive or non-finite values
pub async fn recommend_within(
    service: &dyn VolatilityService,
    request: VolatilityRequest,
    timeout: Duration,
) -> Result<f64, VolatilityError> {
    let value = tokio::time::timeout(timeout, service.recommend(request))
        .await
        .map_err(|_| VolatilityError::Timeout(timeout))??;

    if !value.is_finite() || value <= 0.0 {
        return Err(VolatilityError::InvalidValue(value));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    stop_ticks: f64,
}

/// HTTP implementation: `GET {base_url}/stop-distance?hour=..&recent_volume=..&instrument=..`
pub struct HttpVolatilityService {
    client: Client,
    base_url: String,
}

impl HttpVolatilityService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create volatility HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, request: VolatilityRequest) -> Result<f64, VolatilityError> {
        let response = self
            .client
            .get(format!("{}/stop-distance", self.base_url))
            .header("Accept", "application/json")
            .query(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VolatilityError::Status(status));
        }

        let body: RecommendationResponse = response.json().await?;
        debug!(
            "Volatility service: hour {} volume {} -> {:.2} ticks",
            request.hour, request.recent_volume, body.stop_ticks
        );
        Ok(body.stop_ticks)
    }
}

impl VolatilityService for HttpVolatilityService {
    fn recommend(&self, request: VolatilityRequest) -> BoxFuture<'_, Result<f64, VolatilityError>> {
        Box::pin(self.fetch(request))
    }
}
