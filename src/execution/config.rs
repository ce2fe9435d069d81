//! Configuration for instrument, stop sizing and external services

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the initial stop distance is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopSizing {
    /// Configured point distance only
    Fixed,
    /// Volatility service (if enabled), then ATR, then fixed
    Dynamic,
}

impl Default for StopSizing {
    fn default() -> Self {
        Self::Fixed
    }
}

impl std::fmt::Display for StopSizing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "Fixed"),
            Self::Dynamic => write!(f, "Dynamic"),
        }
    }
}

/// Configuration for the instrument and everything around the decision rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Instrument identifier sent to the volatility service (e.g., "NQ")
    pub instrument: String,

    /// Minimal price increment; stop distances are expressed in these units
    pub tick_size: f64,

    /// Contracts per entry
    pub quantity: u32,

    /// Stop sizing policy
    pub stop_sizing: StopSizing,

    /// Fixed stop distance in points
    pub fixed_stop_points: f64,

    /// Completed bars averaged for the range-based stop
    pub atr_period: usize,

    /// ATR multiple used as stop distance
    pub atr_multiplier: f64,

    /// Query the volatility service before falling back to ATR
    pub volatility_enabled: bool,

    /// Base URL of the volatility service
    pub volatility_url: Option<String>,

    /// Multiplier applied to the service recommendation
    pub volatility_multiplier: f64,

    /// Hard limit on one volatility lookup
    pub volatility_timeout_ms: u64,

    /// How long a resolved volatility stop is reused for the same hour (bar time)
    pub volatility_cache_secs: i64,

    /// Bars summed for the recent-volume field of the request
    pub volume_lookback: usize,

    /// Timezone used for hour-of-day (e.g., "America/New_York")
    pub session_timezone: String,

    /// Dashboard endpoint for bar snapshots
    pub diagnostics_url: Option<String>,

    /// Hard limit on one diagnostics push
    pub diagnostics_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            instrument: "NQ".to_string(),
            tick_size: 0.25,
            quantity: 1,
            stop_sizing: StopSizing::Fixed,
            fixed_stop_points: 10.0,
            atr_period: 14,
            atr_multiplier: 1.5,
            volatility_enabled: false,
            volatility_url: None,
            volatility_multiplier: 1.0,
            volatility_timeout_ms: 250,
            volatility_cache_secs: 300,
            volume_lookback: 10,
            session_timezone: "America/New_York".to_string(),
            diagnostics_url: None,
            diagnostics_timeout_ms: 250,
        }
    }
}

impl ExecutionConfig {
    /// Load from a JSON file; missing fields take defaults
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read execution config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse execution config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tick_size.is_finite() && self.tick_size > 0.0) {
            bail!("tick_size must be positive, got {}", self.tick_size);
        }
        if self.quantity == 0 {
            bail!("quantity must be at least 1");
        }
        if !self.fixed_stop_points.is_finite() {
            bail!("fixed_stop_points must be finite");
        }
        if self.atr_period == 0 {
            bail!("atr_period must be at least 1");
        }
        if !self.atr_multiplier.is_finite() || !self.volatility_multiplier.is_finite() {
            bail!("stop multipliers must be finite");
        }
        if self.volatility_cache_secs < 0 {
            bail!("volatility_cache_secs must not be negative");
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.session_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Unknown session_timezone {}: {}", self.session_timezone, e))
    }

    pub fn volatility_timeout(&self) -> Duration {
        Duration::from_millis(self.volatility_timeout_ms)
    }

    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostics_timeout_ms)
    }

    /// Bars of OHLCV history the stop calculator needs
    pub fn history_len(&self) -> usize {
        (self.atr_period + 1).max(self.volume_lookback).max(2)
    }
}
