//! Order sides and the signals the engine hands to the order sink

use serde::{Deserialize, Serialize};

use super::position::PositionSide;

/// Tag carried by long entries and the exits that close them
pub const LONG_TAG: &str = "Long";

/// Tag carried by short entries and the exits that close them
pub const SHORT_TAG: &str = "Short";

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// What the sink is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    EnterLong,
    EnterShort,
    ExitLong,
    ExitShort,
}

impl SignalKind {
    pub fn entry(side: PositionSide) -> Option<Self> {
        match side {
            PositionSide::Long => Some(Self::EnterLong),
            PositionSide::Short => Some(Self::EnterShort),
            PositionSide::Flat => None,
        }
    }

    pub fn exit(side: PositionSide) -> Option<Self> {
        match side {
            PositionSide::Long => Some(Self::ExitLong),
            PositionSide::Short => Some(Self::ExitShort),
            PositionSide::Flat => None,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, Self::EnterLong | Self::EnterShort)
    }

    /// Position side this signal opens or closes
    pub fn side(&self) -> PositionSide {
        match self {
            Self::EnterLong | Self::ExitLong => PositionSide::Long,
            Self::EnterShort | Self::ExitShort => PositionSide::Short,
        }
    }

    /// Order side that carries the signal to market
    pub fn order_side(&self) -> OrderSide {
        match self {
            Self::EnterLong | Self::ExitShort => OrderSide::Buy,
            Self::EnterShort | Self::ExitLong => OrderSide::Sell,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnterLong => write!(f, "ENTER LONG"),
            Self::EnterShort => write!(f, "ENTER SHORT"),
            Self::ExitLong => write!(f, "EXIT LONG"),
            Self::ExitShort => write!(f, "EXIT SHORT"),
        }
    }
}

/// Human-readable cause attached to every signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalReason {
    TrendUp,
    TrendDown,
    TrendBreak,
    /// Postponed marginal-trend exit confirmed by an opposite bar
    TrendBreakConfirmed,
    /// Re-entry on the new side right after a trend-break exit
    Reversal,
    /// Deferred entry confirmed by a bar of the right color
    PendingConfirmed,
    /// Deferred entry overtaken by the opposite trend
    PendingReversal,
    GradientWaitEntry,
    GradientWaitExit,
    Retrace,
    EntryBarOpposite,
    ManualFlatten,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendUp => "TrendUp",
            Self::TrendDown => "TrendDown",
            Self::TrendBreak => "TrendBreak",
            Self::TrendBreakConfirmed => "TrendBreakConfirmed",
            Self::Reversal => "Reversal",
            Self::PendingConfirmed => "PendingConfirmed",
            Self::PendingReversal => "PendingReversal",
            Self::GradientWaitEntry => "GradientWaitEntry",
            Self::GradientWaitExit => "GradientWaitExit",
            Self::Retrace => "Retrace",
            Self::EntryBarOpposite => "EntryBarOpposite",
            Self::ManualFlatten => "ManualFlatten",
        }
    }
}

impl std::fmt::Display for SignalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event that produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    BarClose,
    Tick,
    Manual,
}

/// Entry or exit request for the order sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub tag: String,
    pub reason: SignalReason,
    /// Bar the signal belongs to (the forming bar for tick signals)
    pub bar_index: u64,
    /// Close or tick price when the signal fired
    pub price: f64,
    pub source: SignalSource,
}

impl Signal {
    pub fn new(
        kind: SignalKind,
        reason: SignalReason,
        bar_index: u64,
        price: f64,
        source: SignalSource,
    ) -> Self {
        let tag = match kind.side() {
            PositionSide::Short => SHORT_TAG,
            _ => LONG_TAG,
        };
        Self {
            kind,
            tag: tag.to_string(),
            reason,
            bar_index,
            price,
            source,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] @ {:.2} | bar {} | {}",
            self.kind, self.tag, self.price, self.bar_index, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_sign() {
        assert_eq!(OrderSide::Buy.sign(), 1);
        assert_eq!(OrderSide::Sell.sign(), -1);
        assert_eq!(OrderSide::Sell.to_string(), "SELL");
    }

    #[test]
    fn test_signal_kind_mapping() {
        assert_eq!(SignalKind::entry(PositionSide::Long), Some(SignalKind::EnterLong));
        assert_eq!(SignalKind::exit(PositionSide::Short), Some(SignalKind::ExitShort));
        assert_eq!(SignalKind::entry(PositionSide::Flat), None);

        assert_eq!(SignalKind::ExitLong.order_side(), OrderSide::Sell);
        assert_eq!(SignalKind::ExitShort.order_side(), OrderSide::Buy);
        assert!(SignalKind::EnterShort.is_entry());
        assert!(!SignalKind::ExitShort.is_entry());
    }

    #[test]
    fn test_signal_tags_and_reason_strings() {
        let signal = Signal::new(
            SignalKind::ExitShort,
            SignalReason::EntryBarOpposite,
            7,
            101.25,
            SignalSource::BarClose,
        );
        assert_eq!(signal.tag, SHORT_TAG);
        assert_eq!(signal.reason.to_string(), "EntryBarOpposite");
        assert_eq!(SignalReason::TrendUp.as_str(), "TrendUp");
    }
}
