//! Trend detection from rolling window counts

use serde::{Deserialize, Serialize};

use super::bars::{RollingBarWindow, WindowCounts};

/// Independent up/down flags; callers give `up` precedence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSignal {
    pub up: bool,
    pub down: bool,
}

impl TrendSignal {
    pub fn any(&self) -> bool {
        self.up || self.down
    }
}

/// Count-threshold trend rule with optional P&L tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendDetector {
    pub lookback: usize,
    pub min_consecutive: usize,
    pub use_pnl_tiebreaker: bool,
}

impl TrendDetector {
    pub fn new(lookback: usize, min_consecutive: usize, use_pnl_tiebreaker: bool) -> Self {
        Self {
            lookback,
            min_consecutive,
            use_pnl_tiebreaker,
        }
    }

    /// Evaluate both directions against pre-computed counts
    pub fn evaluate(&self, counts: &WindowCounts) -> TrendSignal {
        let relaxed = self.min_consecutive.saturating_sub(1);

        let up = counts.good >= self.min_consecutive
            || (self.use_pnl_tiebreaker && counts.good >= relaxed && counts.net_pnl > 0.0);
        let down = counts.bad >= self.min_consecutive
            || (self.use_pnl_tiebreaker && counts.bad >= relaxed && counts.net_pnl < 0.0);

        TrendSignal { up, down }
    }

    /// Evaluate over the window; insufficient history means no trend
    pub fn detect(&self, window: &RollingBarWindow) -> TrendSignal {
        if window.len() < self.lookback {
            return TrendSignal::default();
        }
        self.evaluate(&window.counts(self.lookback))
    }
}
