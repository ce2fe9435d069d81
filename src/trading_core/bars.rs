//! Bar classification and the rolling window of classified bars

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;

/// Smallest window capacity; the marginal-trend check reads the last 4 bars
pub const MIN_WINDOW_CAPACITY: usize = 5;

/// Completed OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    pub fn is_good(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bad(&self) -> bool {
        self.close < self.open
    }

    /// Directional P&L of the body (close - open)
    pub fn body_pnl(&self) -> f64 {
        self.close - self.open
    }

    pub fn color(&self) -> BarColor {
        if self.is_good() {
            BarColor::Good
        } else if self.is_bad() {
            BarColor::Bad
        } else {
            BarColor::Doji
        }
    }

    /// True range against the previous close
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

/// Bar classification by body direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarColor {
    Good,
    Bad,
    Doji,
}

impl BarColor {
    fn code(self) -> char {
        match self {
            BarColor::Good => 'G',
            BarColor::Bad => 'B',
            BarColor::Doji => 'D',
        }
    }
}

impl std::fmt::Display for BarColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarColor::Good => write!(f, "GOOD"),
            BarColor::Bad => write!(f, "BAD"),
            BarColor::Doji => write!(f, "DOJI"),
        }
    }
}

/// One entry in the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedBar {
    pub color: BarColor,
    pub body_pnl: f64,
}

impl From<&Bar> for ClassifiedBar {
    fn from(bar: &Bar) -> Self {
        Self {
            color: bar.color(),
            body_pnl: bar.body_pnl(),
        }
    }
}

/// Good/bad counts and net body P&L over a lookback
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub good: usize,
    pub bad: usize,
    pub net_pnl: f64,
}

impl WindowCounts {
    /// 2 good / 2 bad style split (only meaningful for even lookbacks)
    pub fn is_evenly_split(&self) -> bool {
        self.good > 0 && self.good == self.bad
    }
}

/// Bounded FIFO of classified bars, oldest evicted first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingBarWindow {
    capacity: usize,
    entries: VecDeque<ClassifiedBar>,
}

impl Default for RollingBarWindow {
    fn default() -> Self {
        Self::new(MIN_WINDOW_CAPACITY)
    }
}

impl RollingBarWindow {
    /// Capacity below `MIN_WINDOW_CAPACITY` is raised to it
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_WINDOW_CAPACITY);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Window sized for a trend lookback
    pub fn for_lookback(lookback: usize) -> Self {
        Self::new(lookback)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classify and append a completed bar
    pub fn push(&mut self, bar: &Bar) -> ClassifiedBar {
        let entry = ClassifiedBar::from(bar);
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        entry
    }

    /// Counts over the last `lookback` entries; zero when history is shorter
    pub fn counts(&self, lookback: usize) -> WindowCounts {
        if lookback == 0 || self.entries.len() < lookback {
            return WindowCounts::default();
        }

        let start = self.entries.len() - lookback;
        self.entries
            .iter()
            .skip(start)
            .fold(WindowCounts::default(), |mut acc, entry| {
                match entry.color {
                    BarColor::Good => acc.good += 1,
                    BarColor::Bad => acc.bad += 1,
                    BarColor::Doji => {}
                }
                acc.net_pnl += entry.body_pnl;
                acc
            })
    }

    /// Run-length encoding of the last `min(lookback, len)` colors, e.g. `3G2B`
    pub fn pattern(&self, lookback: usize) -> String {
        let take = lookback.min(self.entries.len());
        let start = self.entries.len() - take;

        let mut out = String::new();
        let mut run: Option<(BarColor, usize)> = None;
        for entry in self.entries.iter().skip(start) {
            run = match run {
                Some((color, n)) if color == entry.color => Some((color, n + 1)),
                Some((color, n)) => {
                    let _ = write!(out, "{}{}", n, color.code());
                    Some((entry.color, 1))
                }
                None => Some((entry.color, 1)),
            };
        }
        if let Some((color, n)) = run {
            let _ = write!(out, "{}{}", n, color.code());
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
