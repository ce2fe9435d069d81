//! Momentum gradient of a smoothed average
//!
//! The smoothed value is an EMA of closes. Its slope is reported as an angle
//! in one of two ways:
//! - Regression: least-squares slope over the last N completed values
//! - ViewportScaled: two-point angle measured in screen geometry supplied by a
//!   [`ScaleProvider`], falling back to regression when no usable scale exists
//!
//! The forming bar never enters the completed series; [`GradientEstimator::live`]
//! projects it separately for intra-bar checks.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How the angle is derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientMode {
    #[default]
    Regression,
    ViewportScaled,
}

/// One gradient reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientSample {
    /// Value change per bar (per screen unit in viewport mode)
    pub slope: f64,
    pub angle_deg: f64,
    pub mode: GradientMode,
}

/// Maps a (bar delta, value delta) step onto screen distances
pub trait ScaleProvider {
    /// `None` when no viewport is available
    fn to_screen(&self, bar_delta: f64, value_delta: f64) -> Option<(f64, f64)>;
}

/// No viewport attached; viewport mode always falls back to regression
#[derive(Debug, Clone, Copy, Default)]
pub struct NoViewport;

impl ScaleProvider for NoViewport {
    fn to_screen(&self, _bar_delta: f64, _value_delta: f64) -> Option<(f64, f64)> {
        None
    }
}

/// Fixed linear chart geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearViewport {
    /// Horizontal distance between adjacent bars
    pub bar_spacing: f64,
    /// Value span covered by the visible height
    pub value_range: f64,
    /// Visible height in the same units as `bar_spacing`
    pub height: f64,
}

impl ScaleProvider for LinearViewport {
    fn to_screen(&self, bar_delta: f64, value_delta: f64) -> Option<(f64, f64)> {
        if self.bar_spacing <= 0.0 || self.value_range <= 0.0 || self.height <= 0.0 {
            return None;
        }
        Some((
            bar_delta * self.bar_spacing,
            value_delta / self.value_range * self.height,
        ))
    }
}

/// EMA-smoothed slope estimator over completed bars
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientEstimator {
    mode: GradientMode,
    window: usize,
    alpha: f64,
    values: VecDeque<f64>,
}

impl Default for GradientEstimator {
    fn default() -> Self {
        Self::new(GradientMode::Regression, 5, 9)
    }
}

impl GradientEstimator {
    /// `window` is clamped to at least 2, `ema_period` to at least 1
    pub fn new(mode: GradientMode, window: usize, ema_period: usize) -> Self {
        let window = window.max(2);
        Self {
            mode,
            window,
            alpha: 2.0 / (ema_period.max(1) as f64 + 1.0),
            values: VecDeque::with_capacity(window + 1),
        }
    }

    pub fn mode(&self) -> GradientMode {
        self.mode
    }

    /// Latest completed smoothed value
    pub fn last_value(&self) -> Option<f64> {
        self.values.back().copied()
    }

    fn smooth(&self, price: f64) -> f64 {
        match self.last_value() {
            Some(prev) => prev + self.alpha * (price - prev),
            None => price,
        }
    }

    /// Feed a completed bar's close
    pub fn update(&mut self, close: f64) {
        let value = self.smooth(close);
        self.values.push_back(value);
        while self.values.len() > self.window {
            self.values.pop_front();
        }
    }

    /// Gradient over completed bars; `None` until enough history exists
    pub fn sample(&self, scale: &dyn ScaleProvider) -> Option<GradientSample> {
        if self.mode == GradientMode::ViewportScaled && self.values.len() >= 2 {
            let prev = self.values[self.values.len() - 2];
            let last = self.values[self.values.len() - 1];
            if let Some(sample) = viewport_angle(last - prev, scale) {
                return Some(sample);
            }
        }
        self.regression()
    }

    /// Two-point gradient of the forming bar's provisional value against the
    /// last completed value
    pub fn live(&self, price: f64, scale: &dyn ScaleProvider) -> Option<GradientSample> {
        let last = self.last_value()?;
        let delta = self.smooth(price) - last;

        if self.mode == GradientMode::ViewportScaled {
            if let Some(sample) = viewport_angle(delta, scale) {
                return Some(sample);
            }
        }
        Some(GradientSample {
            slope: delta,
            angle_deg: delta.atan().to_degrees(),
            mode: GradientMode::Regression,
        })
    }

    fn regression(&self) -> Option<GradientSample> {
        if self.values.len() < self.window {
            return None;
        }
        let slope = ols_slope(self.values.iter().copied())?;
        Some(GradientSample {
            slope,
            angle_deg: slope.atan().to_degrees(),
            mode: GradientMode::Regression,
        })
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Least-squares slope with x = 0, 1, 2, ...
fn ols_slope(values: impl ExactSizeIterator<Item = f64> + Clone) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.clone().sum::<f64>() / n as f64;

    let (num, den) = values
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });

    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

/// Screen-geometry angle for one bar step; sign follows the value delta
fn viewport_angle(value_delta: f64, scale: &dyn ScaleProvider) -> Option<GradientSample> {
    let (dx, dy) = scale.to_screen(1.0, value_delta)?;
    if !dx.is_finite() || !dy.is_finite() || dx <= 0.0 {
        return None;
    }

    let magnitude = dy.abs().atan2(dx).to_degrees();
    let angle_deg = if value_delta > 0.0 {
        magnitude
    } else if value_delta < 0.0 {
        -magnitude
    } else {
        0.0
    };

    Some(GradientSample {
        slope: dy.abs() / dx * value_delta.signum(),
        angle_deg,
        mode: GradientMode::ViewportScaled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(mode: GradientMode, window: usize, closes: &[f64]) -> GradientEstimator {
        // Period 1 means alpha = 1: the smoothed value equals the close
        let mut est = GradientEstimator::new(mode, window, 1);
        for &c in closes {
            est.update(c);
        }
        est
    }

    #[test]
    fn test_regression_slope_and_angle() {
        let est = fed(GradientMode::Regression, 4, &[10.0, 11.0, 12.0, 13.0]);
        let sample = est.sample(&NoViewport).unwrap();

        assert!((sample.slope - 1.0).abs() < 1e-9);
        assert!((sample.angle_deg - 45.0).abs() < 1e-9);
        assert_eq!(sample.mode, GradientMode::Regression);
    }

    #[test]
    fn test_falling_values_give_negative_angle() {
        let est = fed(GradientMode::Regression, 3, &[20.0, 18.0, 16.0]);
        assert!(est.sample(&NoViewport).unwrap().angle_deg < 0.0);
    }

    #[test]
    fn test_insufficient_history() {
        let est = fed(GradientMode::Regression, 5, &[1.0, 2.0, 3.0]);
        assert!(est.sample(&NoViewport).is_none());
        assert!(GradientEstimator::default().live(100.0, &NoViewport).is_none());
    }

    #[test]
    fn test_viewport_angle_uses_geometry() {
        let est = fed(GradientMode::ViewportScaled, 3, &[100.0, 102.0]);
        // 2 points of a 20-point range on a 100-high chart: dy = 10, dx = 10
        let viewport = LinearViewport { bar_spacing: 10.0, value_range: 20.0, height: 100.0 };
        let sample = est.sample(&viewport).unwrap();

        assert_eq!(sample.mode, GradientMode::ViewportScaled);
        assert!((sample.angle_deg - 45.0).abs() < 1e-9);

        let falling = fed(GradientMode::ViewportScaled, 3, &[102.0, 100.0]);
        assert!((falling.sample(&viewport).unwrap().angle_deg + 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_viewport_falls_back_to_regression() {
        let est = fed(GradientMode::ViewportScaled, 2, &[100.0, 101.0]);

        let without = est.sample(&NoViewport).unwrap();
        assert_eq!(without.mode, GradientMode::Regression);

        let degenerate = LinearViewport { bar_spacing: 0.0, value_range: 20.0, height: 100.0 };
        assert_eq!(est.sample(&degenerate).unwrap().mode, GradientMode::Regression);
    }

    #[test]
    fn test_live_projects_forming_bar() {
        let est = fed(GradientMode::Regression, 3, &[100.0, 100.0, 100.0]);

        let up = est.live(101.0, &NoViewport).unwrap();
        assert!((up.angle_deg - 45.0).abs() < 1e-9);
        let down = est.live(99.0, &NoViewport).unwrap();
        assert!(down.angle_deg < 0.0);

        // Live projection never mutates the completed series
        assert_eq!(est.last_value(), Some(100.0));
    }

    #[test]
    fn test_ema_smoothing() {
        let mut est = GradientEstimator::new(GradientMode::Regression, 2, 3);
        est.update(10.0);
        est.update(20.0);
        // alpha = 0.5
        assert_eq!(est.last_value(), Some(15.0));
    }
}
