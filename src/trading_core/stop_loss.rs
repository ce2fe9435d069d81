//! Stop-loss distance sizing
//!
//! Dynamic sizing walks a fallback chain: volatility service, then ATR over
//! completed bars, then the fixed distance. Every path ends in at least one
//! tick. A stop is resolved once per new position; only a manual override
//! changes it mid-trade.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::bars::Bar;
use super::cache::{StopCache, StopCacheKey};
use crate::execution::{ExecutionConfig, PositionSide, StopSizing};
use crate::services::volatility::{recommend_within, VolatilityRequest, VolatilityService};

/// Where a stop distance came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    #[default]
    Fixed,
    RangeBased,
    Volatility,
    Manual,
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "Fixed"),
            Self::RangeBased => write!(f, "RangeBased"),
            Self::Volatility => write!(f, "Volatility"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

/// Stop attached to a newly opened position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub side: PositionSide,
    pub ticks: u32,
    pub mode: StopMode,
    pub bar_index: u64,
}

impl std::fmt::Display for StopRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "STOP {} {} ticks ({}) | bar {}",
            self.side, self.ticks, self.mode, self.bar_index
        )
    }
}

/// Last resolved stop plus the service cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossSpec {
    pub mode: StopMode,
    pub resolved_ticks: u32,
    pub cache: StopCache,
}

impl Default for StopLossSpec {
    fn default() -> Self {
        Self {
            mode: StopMode::Fixed,
            resolved_ticks: 1,
            cache: StopCache::default(),
        }
    }
}

/// Convert a point distance into whole ticks, never below 1
pub fn ticks_from_points(points: f64, tick_size: f64) -> u32 {
    if !points.is_finite() || !tick_size.is_finite() || tick_size <= 0.0 {
        return 1;
    }
    let ticks = (points / tick_size).round();
    if ticks < 1.0 {
        1
    } else if ticks >= u32::MAX as f64 {
        u32::MAX
    } else {
        ticks as u32
    }
}

/// Mean true range of the last `period` bars; needs `period + 1` bars so
/// every range has a previous close
pub fn average_true_range(bars: &VecDeque<Bar>, period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let start = bars.len() - (period + 1);
    let mut prev_close = bars[start].close;
    let mut sum_tr = 0.0;

    for bar in bars.iter().skip(start + 1) {
        sum_tr += bar.true_range(prev_close);
        prev_close = bar.close;
    }

    Some(sum_tr / period as f64)
}

/// Stop sizing policy built from [`ExecutionConfig`]
#[derive(Debug, Clone)]
pub struct StopLossCalculator {
    instrument: String,
    tick_size: f64,
    sizing: StopSizing,
    fixed_stop_points: f64,
    atr_period: usize,
    atr_multiplier: f64,
    volatility_enabled: bool,
    volatility_multiplier: f64,
    volatility_timeout: std::time::Duration,
    cache_ttl: Duration,
    volume_lookback: usize,
    timezone: Tz,
}

impl StopLossCalculator {
    pub fn new(config: &ExecutionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            instrument: config.instrument.clone(),
            tick_size: config.tick_size,
            sizing: config.stop_sizing,
            fixed_stop_points: config.fixed_stop_points,
            atr_period: config.atr_period,
            atr_multiplier: config.atr_multiplier,
            volatility_enabled: config.volatility_enabled,
            volatility_multiplier: config.volatility_multiplier,
            volatility_timeout: config.volatility_timeout(),
            cache_ttl: Duration::seconds(config.volatility_cache_secs),
            volume_lookback: config.volume_lookback,
            timezone: config.timezone()?,
        })
    }

    pub fn fixed_ticks(&self) -> u32 {
        ticks_from_points(self.fixed_stop_points, self.tick_size)
    }

    /// ATR stop in ticks; `None` without `atr_period + 1` bars
    pub fn range_ticks(&self, history: &VecDeque<Bar>) -> Option<u32> {
        let atr = average_true_range(history, self.atr_period)?;
        Some(ticks_from_points(atr * self.atr_multiplier, self.tick_size))
    }

    /// Hour-of-day of `time` in the session timezone
    pub fn session_hour(&self, time: DateTime<Utc>) -> u32 {
        time.with_timezone(&self.timezone).hour()
    }

    fn recent_volume(&self, history: &VecDeque<Bar>) -> u64 {
        history
            .iter()
            .rev()
            .take(self.volume_lookback)
            .map(|bar| bar.volume)
            .sum()
    }

    async fn volatility_ticks(
        &self,
        spec: &mut StopLossSpec,
        service: &dyn VolatilityService,
        history: &VecDeque<Bar>,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        let key = StopCacheKey {
            instrument: self.instrument.clone(),
            hour: self.session_hour(now),
        };

        if let Some(ticks) = spec.cache.get(&key, now, self.cache_ttl) {
            debug!("Volatility stop cache hit for hour {}: {} ticks", key.hour, ticks);
            return Some(ticks);
        }

        let request = VolatilityRequest {
            hour: key.hour,
            recent_volume: self.recent_volume(history),
            instrument: self.instrument.clone(),
        };

        match recommend_within(service, request, self.volatility_timeout).await {
            Ok(value) => {
                let ticks = ticks_from_points(value * self.volatility_multiplier, 1.0);
                spec.cache.store(key, ticks, now);
                Some(ticks)
            }
            Err(e) => {
                warn!("Volatility stop unavailable, falling back: {}", e);
                None
            }
        }
    }

    /// Size the stop for a position opened on `bar_index`
    pub async fn resolve(
        &self,
        spec: &mut StopLossSpec,
        side: PositionSide,
        bar_index: u64,
        history: &VecDeque<Bar>,
        now: DateTime<Utc>,
        service: Option<&dyn VolatilityService>,
    ) -> StopRequest {
        let (ticks, mode) = match self.sizing {
            StopSizing::Fixed => (self.fixed_ticks(), StopMode::Fixed),
            StopSizing::Dynamic => {
                let from_service = match service {
                    Some(service) if self.volatility_enabled => {
                        self.volatility_ticks(spec, service, history, now).await
                    }
                    _ => None,
                };

                if let Some(ticks) = from_service {
                    (ticks, StopMode::Volatility)
                } else if let Some(ticks) = self.range_ticks(history) {
                    (ticks, StopMode::RangeBased)
                } else {
                    debug!(
                        "Range stop needs {} bars, have {}; using fixed",
                        self.atr_period + 1,
                        history.len()
                    );
                    (self.fixed_ticks(), StopMode::Fixed)
                }
            }
        };

        spec.mode = mode;
        spec.resolved_ticks = ticks;

        StopRequest { side, ticks, mode, bar_index }
    }

    /// Replace the stop of the open position
    pub fn override_ticks(spec: &mut StopLossSpec, ticks: u32) -> u32 {
        spec.mode = StopMode::Manual;
        spec.resolved_ticks = ticks.max(1);
        spec.resolved_ticks
    }
}
