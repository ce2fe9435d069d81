//! Strategy parameters for the decision rules

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::gradient::GradientMode;
use super::trend::TrendDetector;

/// Valid trend lookback range (bars)
pub const LOOKBACK_RANGE: std::ops::RangeInclusive<usize> = 3..=10;

/// Valid minimum-count range (bars)
pub const MIN_CONSECUTIVE_RANGE: std::ops::RangeInclusive<usize> = 2..=10;

/// Upper clamp for the retrace fraction
pub const MAX_RETRACE_FRACTION: f64 = 0.99;

/// Configuration for the trend decision rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Bars counted for trend detection (3-10)
    pub trend_lookback: usize,
    /// Good/bad bars needed for a trend (2-10)
    pub min_consecutive: usize,
    /// Accept one bar fewer when net body P&L agrees
    pub use_pnl_tiebreaker: bool,

    /// Defer long entries signalled on a bad bar
    pub avoid_longs_on_bad_candle: bool,
    /// Defer short entries signalled on a good bar
    pub avoid_shorts_on_good_candle: bool,

    /// Exit when the held trend disappears
    pub exit_on_trend_break: bool,
    /// Re-enter on the other side when an opposite trend breaks the position
    pub reverse_on_trend_break: bool,
    /// Exit right away when the entry bar closes against the position
    pub exit_if_entry_bar_opposite: bool,

    pub gradient_filter_enabled: bool,
    pub gradient_mode: GradientMode,
    /// Completed bars in the regression (>= 2)
    pub gradient_window: usize,
    /// EMA period of the smoothed value
    pub ema_period: usize,
    /// Longs are skipped while the angle is below this (degrees)
    pub skip_longs_below_gradient: f64,
    /// Shorts are skipped while the angle is above this (degrees)
    pub skip_shorts_above_gradient: f64,

    /// A gradient-blocked entry may fire intra-bar once the live angle recovers
    pub allow_mid_bar_gradient_entry: bool,
    /// A trend-break exit may wait intra-bar while the gradient still favours the position
    pub allow_mid_bar_gradient_exit: bool,

    /// Exit when open profit gives back part of the best excursion
    pub exit_on_retrace: bool,
    /// Share of the best excursion that may be given back (clamped to 0-0.99)
    pub retrace_fraction: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trend_lookback: 5,
            min_consecutive: 3,
            use_pnl_tiebreaker: false,
            avoid_longs_on_bad_candle: true,
            avoid_shorts_on_good_candle: true,
            exit_on_trend_break: true,
            reverse_on_trend_break: false,
            exit_if_entry_bar_opposite: false,
            gradient_filter_enabled: false,
            gradient_mode: GradientMode::Regression,
            gradient_window: 5,
            ema_period: 9,
            skip_longs_below_gradient: 0.0,
            skip_shorts_above_gradient: 0.0,
            allow_mid_bar_gradient_entry: false,
            allow_mid_bar_gradient_exit: false,
            exit_on_retrace: false,
            retrace_fraction: 0.66,
        }
    }
}

impl StrategyConfig {
    /// Gradient-filtered entries with intra-bar recovery and retrace exits
    pub fn momentum_filtered() -> Self {
        Self {
            gradient_filter_enabled: true,
            skip_longs_below_gradient: 5.0,
            skip_shorts_above_gradient: -5.0,
            allow_mid_bar_gradient_entry: true,
            allow_mid_bar_gradient_exit: true,
            exit_on_retrace: true,
            ..Default::default()
        }
    }

    /// Always-in-market reversal flavour
    pub fn reversal() -> Self {
        Self {
            reverse_on_trend_break: true,
            use_pnl_tiebreaker: true,
            exit_if_entry_bar_opposite: true,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take defaults
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read strategy config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse strategy config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !LOOKBACK_RANGE.contains(&self.trend_lookback) {
            bail!("trend_lookback must be within 3-10, got {}", self.trend_lookback);
        }
        if !MIN_CONSECUTIVE_RANGE.contains(&self.min_consecutive) {
            bail!("min_consecutive must be within 2-10, got {}", self.min_consecutive);
        }
        if self.gradient_window < 2 {
            bail!("gradient_window must be at least 2");
        }
        if self.ema_period == 0 {
            bail!("ema_period must be at least 1");
        }
        if !self.skip_longs_below_gradient.is_finite() || !self.skip_shorts_above_gradient.is_finite() {
            bail!("gradient thresholds must be finite");
        }
        if !self.retrace_fraction.is_finite() {
            bail!("retrace_fraction must be finite");
        }
        Ok(())
    }

    pub fn trend_detector(&self) -> TrendDetector {
        TrendDetector::new(self.trend_lookback, self.min_consecutive, self.use_pnl_tiebreaker)
    }

    /// Retrace fraction clamped to [0, 0.99]
    pub fn effective_retrace_fraction(&self) -> f64 {
        self.retrace_fraction.clamp(0.0, MAX_RETRACE_FRACTION)
    }
}
