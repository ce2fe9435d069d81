//! Intended vs. filled position tracking
//!
//! `intended` moves as soon as the engine emits a signal; `actual` only moves
//! when a fill arrives. [`PositionTracker::reconcile`] is the single writer
//! for fills and is the only place the two are brought back together.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Fill;

/// Direction of a position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Flat => Self::Flat,
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Side implied by a signed net quantity
    pub fn from_net(net: i64) -> Self {
        match net.signum() {
            1 => Self::Long,
            -1 => Self::Short,
            _ => Self::Flat,
        }
    }

    /// +1.0 long, -1.0 short, 0.0 flat
    pub fn direction(&self) -> f64 {
        match self {
            Self::Flat => 0.0,
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        *self == Self::Flat
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "FLAT"),
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Position state shared by the decision rules and the fill feed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionTracker {
    actual: PositionSide,
    intended: PositionSide,
    /// Signed filled quantity (positive = long)
    net_quantity: i64,
    /// A signal is outstanding and `actual` has not reached `intended` yet
    awaiting_fill: bool,
    entry_bar_index: Option<u64>,
    entry_price: Option<f64>,
    max_favorable_excursion: f64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actual(&self) -> PositionSide {
        self.actual
    }

    pub fn intended(&self) -> PositionSide {
        self.intended
    }

    pub fn net_quantity(&self) -> i64 {
        self.net_quantity
    }

    pub fn entry_bar_index(&self) -> Option<u64> {
        self.entry_bar_index
    }

    pub fn entry_price(&self) -> Option<f64> {
        self.entry_price
    }

    pub fn max_favorable_excursion(&self) -> f64 {
        self.max_favorable_excursion
    }

    /// True while a signal is waiting for its fill
    pub fn is_awaiting_fill(&self) -> bool {
        self.awaiting_fill
    }

    /// Record an entry signal. Returns false (and changes nothing) when the
    /// target side is already intended.
    pub fn intend_entry(&mut self, side: PositionSide, bar_index: u64, price: f64) -> bool {
        if side.is_flat() || self.intended == side {
            return false;
        }
        self.intended = side;
        self.awaiting_fill = self.awaiting_fill || self.actual != side;
        self.entry_bar_index = Some(bar_index);
        self.entry_price = Some(price);
        self.max_favorable_excursion = 0.0;
        true
    }

    /// Record an exit signal; returns the side that was intended before
    pub fn intend_exit(&mut self) -> PositionSide {
        let previous = self.intended;
        self.intended = PositionSide::Flat;
        self.awaiting_fill = self.awaiting_fill || !self.actual.is_flat();
        self.entry_bar_index = None;
        self.entry_price = None;
        self.max_favorable_excursion = 0.0;
        previous
    }

    /// Apply a fill confirmation
    pub fn reconcile(&mut self, fill: &Fill) {
        let signed = fill.side.sign() * fill.quantity as i64;
        let previous_net = self.net_quantity;
        self.net_quantity += signed;
        self.actual = PositionSide::from_net(self.net_quantity);

        let opened = previous_net == 0 || previous_net.signum() != self.net_quantity.signum();
        if !self.actual.is_flat() {
            if opened {
                self.entry_price = Some(fill.price);
                self.max_favorable_excursion = 0.0;
            } else if previous_net.abs() < self.net_quantity.abs() {
                // Adding to the position - weighted average
                let old_value = self.entry_price.unwrap_or(fill.price) * previous_net.abs() as f64;
                let new_value = fill.price * fill.quantity as f64;
                self.entry_price = Some((old_value + new_value) / self.net_quantity.abs() as f64);
            }
        }

        if self.actual == self.intended {
            self.awaiting_fill = false;
        } else if !self.awaiting_fill {
            // No outstanding signal explains this fill (e.g. a broker-side stop)
            info!(
                "Fill {} {} @ {:.2} moved position to {} without a signal; intended was {}",
                fill.side, fill.quantity, fill.price, self.actual, self.intended
            );
            self.intended = self.actual;
            if self.actual.is_flat() {
                self.entry_bar_index = None;
                self.entry_price = None;
                self.max_favorable_excursion = 0.0;
            }
        }

        debug!(
            "Reconciled fill: net {} | actual {} | intended {} | awaiting {}",
            self.net_quantity, self.actual, self.intended, self.awaiting_fill
        );
    }

    /// Track the best excursion seen since entry
    pub fn update_excursion(&mut self, high: f64, low: f64) {
        let Some(entry) = self.entry_price else {
            return;
        };
        let excursion = match self.intended {
            PositionSide::Long => high - entry,
            PositionSide::Short => entry - low,
            PositionSide::Flat => return,
        };
        if excursion > self.max_favorable_excursion {
            self.max_favorable_excursion = excursion;
        }
    }

    /// Open profit in price points at `price`
    pub fn current_profit(&self, price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        if self.intended.is_flat() {
            return None;
        }
        Some((price - entry) * self.intended.direction())
    }
}
