//! Per-bar decision rules
//!
//! Rule evaluation is a pure step: an [`EngineState`] goes in together with
//! one event and comes back out with the signals it produced. Nothing here
//! awaits or touches the network; stop sizing and diagnostics happen in the
//! engine after the rules have run.
//!
//! Order of the bar-close steps (the first one that emits a signal ends the bar):
//! 1. Entry-bar-opposite guard
//! 2. Postponed (marginal) exit
//! 3. Pending entries
//! 4. Fresh trend
//! 5. Trend break
//! 6. Retrace

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::bars::{Bar, BarColor, RollingBarWindow, WindowCounts};
use super::config::StrategyConfig;
use super::gradient::{GradientEstimator, GradientSample, ScaleProvider};
use super::stop_loss::StopLossSpec;
use super::trend::TrendSignal;
use crate::execution::{
    ExecutionConfig, PositionSide, PositionTracker, Signal, SignalKind, SignalReason, SignalSource,
};
use crate::types::Tick;

/// Bars read by the marginal-trend postponement check
pub const MARGINAL_LOOKBACK: usize = 4;

/// Deferred entries and postponed exits
///
/// The two entry flags are mutually exclusive; the exit flags are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingState {
    pub long_from_bad: bool,
    pub short_from_good: bool,
    /// The deferred entry came from a trend-break reversal (bypasses the gradient filter)
    pub from_reversal: bool,
    pub exit_long: bool,
    pub exit_short: bool,
}

impl PendingState {
    /// Defer an entry on `side`, replacing any deferral on the other side
    pub fn defer(&mut self, side: PositionSide, from_reversal: bool) {
        match side {
            PositionSide::Long => {
                self.long_from_bad = true;
                self.short_from_good = false;
            }
            PositionSide::Short => {
                self.short_from_good = true;
                self.long_from_bad = false;
            }
            PositionSide::Flat => return,
        }
        self.from_reversal = from_reversal;
    }

    /// Side of the deferred entry (short is resolved first)
    pub fn entry_side(&self) -> Option<PositionSide> {
        if self.short_from_good {
            Some(PositionSide::Short)
        } else if self.long_from_bad {
            Some(PositionSide::Long)
        } else {
            None
        }
    }

    pub fn clear_entries(&mut self) {
        self.long_from_bad = false;
        self.short_from_good = false;
        self.from_reversal = false;
    }

    pub fn postpone_exit(&mut self, side: PositionSide) {
        match side {
            PositionSide::Long => self.exit_long = true,
            PositionSide::Short => self.exit_short = true,
            PositionSide::Flat => {}
        }
    }

    pub fn exit_postponed(&self, side: PositionSide) -> bool {
        match side {
            PositionSide::Long => self.exit_long,
            PositionSide::Short => self.exit_short,
            PositionSide::Flat => false,
        }
    }

    pub fn clear_exits(&mut self) {
        self.exit_long = false;
        self.exit_short = false;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Decisions handed to the tick path until the bar closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientWait {
    /// Entry blocked by the gradient, taken if the live angle recovers
    pub entry: Option<PositionSide>,
    /// Trend-break exit held while the gradient still favours the position
    pub exit: Option<PositionSide>,
}

impl GradientWait {
    pub fn is_waiting(&self) -> bool {
        self.entry.is_some() || self.exit.is_some()
    }

    pub fn clear(&mut self) {
        self.entry = None;
        self.exit = None;
    }
}

/// The first bar a position is held through, checked once it completes.
///
/// For a bar-close entry that is the bar after the signal bar; for an
/// intra-bar entry it is the bar that was forming when the tick arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMark {
    pub bar_index: u64,
    pub side: PositionSide,
    /// Entered from a tick while the bar was still forming
    pub intrabar: bool,
    /// Recorded when the entry bar closes
    pub color: Option<BarColor>,
}

impl EntryMark {
    fn closed_against(&self) -> bool {
        matches!(
            (self.side, self.color),
            (PositionSide::Long, Some(BarColor::Bad)) | (PositionSide::Short, Some(BarColor::Good))
        )
    }
}

/// Everything the rules carry from one event to the next
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// Completed bars seen; also the index of the forming bar
    pub bar_count: u64,
    pub window: RollingBarWindow,
    /// Recent OHLCV bars for stop sizing
    pub history: VecDeque<Bar>,
    pub history_len: usize,
    pub gradient: GradientEstimator,
    pub last_gradient: Option<GradientSample>,
    pub last_trend: TrendSignal,
    pub last_counts: WindowCounts,
    pub pending: PendingState,
    pub wait: GradientWait,
    pub position: PositionTracker,
    pub entry_mark: Option<EntryMark>,
    pub stop: StopLossSpec,
    /// Signals and skips of the latest event, for diagnostics
    pub last_actions: Vec<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(&StrategyConfig::default(), &ExecutionConfig::default())
    }
}

impl EngineState {
    pub fn new(strategy: &StrategyConfig, execution: &ExecutionConfig) -> Self {
        let history_len = execution.history_len();
        Self {
            bar_count: 0,
            window: RollingBarWindow::for_lookback(strategy.trend_lookback),
            history: VecDeque::with_capacity(history_len + 1),
            history_len,
            gradient: GradientEstimator::new(
                strategy.gradient_mode,
                strategy.gradient_window,
                strategy.ema_period,
            ),
            last_gradient: None,
            last_trend: TrendSignal::default(),
            last_counts: WindowCounts::default(),
            pending: PendingState::default(),
            wait: GradientWait::default(),
            position: PositionTracker::new(),
            entry_mark: None,
            stop: StopLossSpec::default(),
            last_actions: Vec::new(),
        }
    }

    /// Drop trend-tracking history at a session boundary; position state survives
    pub fn reset_session(&mut self) {
        self.window.clear();
        self.history.clear();
        self.gradient.clear();
        self.last_gradient = None;
        self.last_trend = TrendSignal::default();
        self.last_counts = WindowCounts::default();
        self.pending.clear();
        self.wait.clear();
        self.entry_mark = None;
        self.stop.cache.clear();
        self.last_actions.clear();
    }

    fn note(&mut self, action: String) {
        self.last_actions.push(action);
    }
}

/// Where and how a signal is being emitted
#[derive(Debug, Clone, Copy)]
struct At {
    bar_index: u64,
    price: f64,
    source: SignalSource,
}

enum PostponedOutcome {
    Continue,
    /// Continuation confirmed; no trend-break exit this bar
    Held,
    Exited,
}

enum PendingOutcome {
    /// No deferred entry, or it was cleared; later steps run
    Continue,
    /// The deferred entry is still waiting or handed to the tick path
    Waiting,
    Entered,
}

fn trend_side(trend: TrendSignal) -> Option<PositionSide> {
    if trend.up {
        Some(PositionSide::Long)
    } else if trend.down {
        Some(PositionSide::Short)
    } else {
        None
    }
}

fn candle_blocks(cfg: &StrategyConfig, side: PositionSide, color: BarColor) -> bool {
    match side {
        PositionSide::Long => cfg.avoid_longs_on_bad_candle && color == BarColor::Bad,
        PositionSide::Short => cfg.avoid_shorts_on_good_candle && color == BarColor::Good,
        PositionSide::Flat => false,
    }
}

fn angle_supports(cfg: &StrategyConfig, angle_deg: f64, side: PositionSide) -> bool {
    match side {
        PositionSide::Long => angle_deg >= cfg.skip_longs_below_gradient,
        PositionSide::Short => angle_deg <= cfg.skip_shorts_above_gradient,
        PositionSide::Flat => false,
    }
}

/// Entry filter; passes while disabled or before the first sample
fn gradient_allows(cfg: &StrategyConfig, sample: Option<&GradientSample>, side: PositionSide) -> bool {
    if !cfg.gradient_filter_enabled {
        return true;
    }
    match sample {
        Some(sample) => angle_supports(cfg, sample.angle_deg, side),
        None => true,
    }
}

fn entry_reason(side: PositionSide) -> SignalReason {
    match side {
        PositionSide::Short => SignalReason::TrendDown,
        _ => SignalReason::TrendUp,
    }
}

fn enter(
    state: &mut EngineState,
    side: PositionSide,
    reason: SignalReason,
    at: At,
    signals: &mut Vec<Signal>,
) -> bool {
    let Some(kind) = SignalKind::entry(side) else {
        return false;
    };

    let intended = state.position.intended();
    if intended == side {
        info!("SKIPPED: {} entry ({}) - already intended (ConflictingIntent)", side, reason);
        state.note(format!("SKIP ENTER {} {}: ConflictingIntent", side, reason));
        return false;
    }
    if intended == side.opposite() {
        exit(state, reason, at, signals);
    }

    state.position.intend_entry(side, at.bar_index, at.price);
    let signal = Signal::new(kind, reason, at.bar_index, at.price, at.source);
    info!("SIGNAL: {}", signal);
    state.note(signal.to_string());
    signals.push(signal);

    let intrabar = at.source == SignalSource::Tick;
    state.entry_mark = Some(EntryMark {
        bar_index: if intrabar { at.bar_index } else { at.bar_index + 1 },
        side,
        intrabar,
        color: None,
    });
    state.pending.clear();
    state.wait.clear();
    true
}

fn exit(state: &mut EngineState, reason: SignalReason, at: At, signals: &mut Vec<Signal>) -> bool {
    let held = state.position.intended();
    let Some(kind) = SignalKind::exit(held) else {
        return false;
    };

    state.position.intend_exit();
    let signal = Signal::new(kind, reason, at.bar_index, at.price, at.source);
    info!("SIGNAL: {}", signal);
    state.note(signal.to_string());
    signals.push(signal);

    state.entry_mark = None;
    state.pending.clear_exits();
    state.wait.exit = None;
    true
}

/// Entry blocked by the gradient: hand it to the tick path or drop it
fn gradient_blocked(cfg: &StrategyConfig, state: &mut EngineState, side: PositionSide, reason: SignalReason) {
    let angle = state.last_gradient.map(|g| g.angle_deg).unwrap_or(0.0);
    state.pending.clear_entries();
    if cfg.allow_mid_bar_gradient_entry {
        info!("WAIT: {} entry ({}) gradient {:.1} deg - waiting intra-bar", side, reason, angle);
        state.wait.entry = Some(side);
        state.note(format!("WAIT ENTER {} {}: gradient {:.1}", side, reason, angle));
    } else {
        info!("SKIPPED: {} entry ({}) gradient {:.1} deg", side, reason, angle);
        state.note(format!("SKIP ENTER {} {}: gradient {:.1}", side, reason, angle));
    }
}

/// Step 1
fn check_entry_bar(cfg: &StrategyConfig, state: &mut EngineState, at: At, signals: &mut Vec<Signal>) -> bool {
    let Some(mark) = state.entry_mark else {
        return false;
    };
    if at.bar_index < mark.bar_index {
        return false;
    }
    state.entry_mark = None;

    if !cfg.exit_if_entry_bar_opposite
        || state.position.intended() != mark.side
        || !mark.closed_against()
    {
        return false;
    }

    info!("ENTRY BAR OPPOSITE: {} entered on bar {} which closed against it", mark.side, mark.bar_index);
    let exited = exit(state, SignalReason::EntryBarOpposite, at, signals);
    state.pending.clear();
    state.wait.clear();
    exited
}

/// Step 2
fn resolve_postponed_exit(
    state: &mut EngineState,
    color: BarColor,
    at: At,
    signals: &mut Vec<Signal>,
) -> PostponedOutcome {
    let held = state.position.intended();
    let postponed = state.pending.exit_postponed(held);

    // A flag whose position is gone is dropped
    match held {
        PositionSide::Long => state.pending.exit_short = false,
        PositionSide::Short => state.pending.exit_long = false,
        PositionSide::Flat => state.pending.clear_exits(),
    }
    if !postponed {
        return PostponedOutcome::Continue;
    }

    let confirms_break = matches!(
        (held, color),
        (PositionSide::Long, BarColor::Bad) | (PositionSide::Short, BarColor::Good)
    );
    if confirms_break {
        info!("POSTPONED EXIT: {} bar confirms the break", color);
        if exit(state, SignalReason::TrendBreakConfirmed, at, signals) {
            return PostponedOutcome::Exited;
        }
        return PostponedOutcome::Continue;
    }

    if color == BarColor::Doji {
        debug!("POSTPONED EXIT: doji, still waiting");
        return PostponedOutcome::Continue;
    }

    info!("POSTPONED EXIT: {} bar confirms continuation - holding {}", color, held);
    state.pending.clear_exits();
    state.note(format!("HOLD {}: postponed exit cancelled", held));
    PostponedOutcome::Held
}

/// Step 3
fn resolve_pending_entries(
    cfg: &StrategyConfig,
    state: &mut EngineState,
    trend: TrendSignal,
    color: BarColor,
    at: At,
    signals: &mut Vec<Signal>,
) -> PendingOutcome {
    let snapshot = state.pending;
    let Some(side) = snapshot.entry_side() else {
        return PendingOutcome::Continue;
    };

    let held = state.position.intended();
    if !held.is_flat() {
        debug!("PENDING: dropping deferred {} entry, position is {}", side, held);
        state.pending.clear_entries();
        return PendingOutcome::Continue;
    }

    let from_reversal = snapshot.from_reversal;
    match trend_side(trend) {
        Some(target) if target == side.opposite() => {
            if candle_blocks(cfg, target, color) {
                info!("PENDING: {} reversed to {} but {} bar defers it again", side, target, color);
                state.pending.defer(target, from_reversal);
                state.note(format!("PENDING {} (re-deferred)", target));
                return PendingOutcome::Waiting;
            }
            if from_reversal || gradient_allows(cfg, state.last_gradient.as_ref(), target) {
                if enter(state, target, SignalReason::PendingReversal, at, signals) {
                    return PendingOutcome::Entered;
                }
                state.pending.clear_entries();
                return PendingOutcome::Continue;
            }
            gradient_blocked(cfg, state, target, SignalReason::PendingReversal);
            PendingOutcome::Waiting
        }
        Some(target) if target == side => {
            let confirmed = matches!(
                (side, color),
                (PositionSide::Long, BarColor::Good) | (PositionSide::Short, BarColor::Bad)
            );
            if !confirmed {
                debug!("PENDING: {} still waiting for a confirming bar ({} closed)", side, color);
                return PendingOutcome::Waiting;
            }
            if from_reversal || gradient_allows(cfg, state.last_gradient.as_ref(), side) {
                if enter(state, side, SignalReason::PendingConfirmed, at, signals) {
                    return PendingOutcome::Entered;
                }
                state.pending.clear_entries();
                return PendingOutcome::Continue;
            }
            gradient_blocked(cfg, state, side, SignalReason::PendingConfirmed);
            PendingOutcome::Waiting
        }
        _ => {
            info!("PENDING: {} trend gone - clearing deferred entry", side);
            state.pending.clear_entries();
            state.note(format!("CLEAR PENDING {}", side));
            PendingOutcome::Continue
        }
    }
}

/// Step 4
fn follow_trend(
    cfg: &StrategyConfig,
    state: &mut EngineState,
    trend: TrendSignal,
    color: BarColor,
    at: At,
    signals: &mut Vec<Signal>,
) -> bool {
    let Some(side) = trend_side(trend) else {
        return false;
    };
    let held = state.position.intended();

    if held == side {
        if state.pending.exit_postponed(side) {
            debug!("HOLD: {} trend resumed, postponed exit cancelled", side);
        }
        state.pending.clear_exits();
        return false;
    }

    if held == side.opposite() {
        exit(state, SignalReason::TrendBreak, at, signals);
        if cfg.reverse_on_trend_break {
            if candle_blocks(cfg, side, color) {
                info!("PENDING: reversal to {} deferred by {} bar", side, color);
                state.pending.defer(side, true);
                state.note(format!("PENDING {} (reversal)", side));
            } else {
                enter(state, side, SignalReason::Reversal, at, signals);
            }
        }
        return true;
    }

    if candle_blocks(cfg, side, color) {
        info!("PENDING: {} trend on a {} bar - deferring entry", side, color);
        state.pending.defer(side, false);
        state.note(format!("PENDING {}", side));
        return false;
    }

    let reason = entry_reason(side);
    if gradient_allows(cfg, state.last_gradient.as_ref(), side) {
        return enter(state, side, reason, at, signals);
    }
    gradient_blocked(cfg, state, side, reason);
    false
}

/// Step 5
fn exit_on_trend_break(
    cfg: &StrategyConfig,
    state: &mut EngineState,
    trend: TrendSignal,
    marginal: WindowCounts,
    at: At,
    signals: &mut Vec<Signal>,
) -> bool {
    if trend.any() || !cfg.exit_on_trend_break {
        return false;
    }
    let held = state.position.intended();
    if held.is_flat() || state.pending.exit_postponed(held) {
        return false;
    }

    let marginal_split =
        marginal.is_evenly_split() && marginal.good + marginal.bad == MARGINAL_LOOKBACK;
    if marginal_split && marginal.net_pnl * held.direction() > 0.0 {
        info!(
            "POSTPONE EXIT: {} window split 2/2 with net {:.2} in favour",
            held, marginal.net_pnl
        );
        state.pending.postpone_exit(held);
        state.note(format!("POSTPONE EXIT {}", held));
        return false;
    }

    let favoured = state
        .last_gradient
        .map(|g| angle_supports(cfg, g.angle_deg, held))
        .unwrap_or(false);
    if cfg.allow_mid_bar_gradient_exit && favoured {
        info!("WAIT: {} trend broke but gradient still favours it - waiting intra-bar", held);
        state.wait.exit = Some(held);
        state.note(format!("WAIT EXIT {}", held));
        return false;
    }

    exit(state, SignalReason::TrendBreak, at, signals)
}

/// Step 6
fn exit_on_retrace(cfg: &StrategyConfig, state: &mut EngineState, at: At, signals: &mut Vec<Signal>) -> bool {
    if !cfg.exit_on_retrace {
        return false;
    }
    let mfe = state.position.max_favorable_excursion();
    if mfe <= 0.0 {
        return false;
    }
    let Some(profit) = state.position.current_profit(at.price) else {
        return false;
    };

    let floor = mfe * (1.0 - cfg.effective_retrace_fraction());
    if profit > floor {
        return false;
    }

    info!("RETRACE: profit {:.2} <= {:.2} (MFE {:.2})", profit, floor, mfe);
    let exited = exit(state, SignalReason::Retrace, at, signals);
    state.pending.clear();
    state.wait.clear();
    exited
}

/// Apply one completed bar
pub fn evaluate_bar(
    cfg: &StrategyConfig,
    mut state: EngineState,
    bar: &Bar,
    scale: &dyn ScaleProvider,
) -> (EngineState, Vec<Signal>) {
    let bar_index = state.bar_count;
    state.bar_count += 1;
    state.last_actions.clear();

    let color = state.window.push(bar).color;
    state.history.push_back(bar.clone());
    while state.history.len() > state.history_len {
        state.history.pop_front();
    }
    state.gradient.update(bar.close);
    state.last_gradient = state.gradient.sample(scale);

    state.wait.clear();
    match state.entry_mark.as_mut() {
        Some(mark) if mark.bar_index == bar_index => {
            mark.color = Some(color);
            if mark.intrabar {
                // Extremes may predate the entry tick; ticks already tracked the rest
                state.position.update_excursion(bar.close, bar.close);
            } else {
                state.position.update_excursion(bar.high, bar.low);
            }
        }
        _ => state.position.update_excursion(bar.high, bar.low),
    }

    let trend = cfg.trend_detector().detect(&state.window);
    state.last_trend = trend;
    state.last_counts = state.window.counts(cfg.trend_lookback);
    let marginal = state.window.counts(MARGINAL_LOOKBACK);

    debug!(
        "Bar {} {} | {} | up {} down {} | gradient {} | intended {} actual {}",
        bar_index,
        color,
        state.window.pattern(cfg.trend_lookback),
        trend.up,
        trend.down,
        state
            .last_gradient
            .map(|g| format!("{:.1}", g.angle_deg))
            .unwrap_or_else(|| "-".to_string()),
        state.position.intended(),
        state.position.actual(),
    );

    let at = At {
        bar_index,
        price: bar.close,
        source: SignalSource::BarClose,
    };
    let mut signals = Vec::new();

    if check_entry_bar(cfg, &mut state, at, &mut signals) {
        return (state, signals);
    }
    let postponed = resolve_postponed_exit(&mut state, color, at, &mut signals);
    if matches!(postponed, PostponedOutcome::Exited) {
        return (state, signals);
    }
    match resolve_pending_entries(cfg, &mut state, trend, color, at, &mut signals) {
        PendingOutcome::Entered => return (state, signals),
        PendingOutcome::Waiting => {}
        PendingOutcome::Continue => {
            if follow_trend(cfg, &mut state, trend, color, at, &mut signals) {
                return (state, signals);
            }
        }
    }
    let held = matches!(postponed, PostponedOutcome::Held);
    if !held && exit_on_trend_break(cfg, &mut state, trend, marginal, at, &mut signals) {
        return (state, signals);
    }
    exit_on_retrace(cfg, &mut state, at, &mut signals);

    (state, signals)
}

/// Apply one intra-bar tick: excursion tracking and gradient-wait resolution
pub fn evaluate_tick(
    cfg: &StrategyConfig,
    mut state: EngineState,
    tick: &Tick,
    scale: &dyn ScaleProvider,
) -> (EngineState, Vec<Signal>) {
    let mut signals = Vec::new();
    state.position.update_excursion(tick.price, tick.price);

    if !state.wait.is_waiting() {
        return (state, signals);
    }
    let Some(live) = state.gradient.live(tick.price, scale) else {
        return (state, signals);
    };
    state.last_actions.clear();

    let at = At {
        bar_index: state.bar_count,
        price: tick.price,
        source: SignalSource::Tick,
    };

    if let Some(side) = state.wait.entry {
        if angle_supports(cfg, live.angle_deg, side) {
            info!("WAIT: live gradient {:.1} deg recovered for {}", live.angle_deg, side);
            state.wait.entry = None;
            enter(&mut state, side, SignalReason::GradientWaitEntry, at, &mut signals);
        }
    }

    if let Some(side) = state.wait.exit {
        if !angle_supports(cfg, live.angle_deg, side) {
            info!("WAIT: live gradient {:.1} deg no longer favours {}", live.angle_deg, side);
            state.wait.exit = None;
            if state.position.intended() == side {
                exit(&mut state, SignalReason::GradientWaitExit, at, &mut signals);
            }
        }
    }

    (state, signals)
}

/// Exit whatever is intended, outside the bar rules
pub fn evaluate_flatten(mut state: EngineState, price: f64) -> (EngineState, Vec<Signal>) {
    let mut signals = Vec::new();
    state.last_actions.clear();
    let at = At {
        bar_index: state.bar_count,
        price,
        source: SignalSource::Manual,
    };
    exit(&mut state, SignalReason::ManualFlatten, at, &mut signals);
    state.pending.clear();
    state.wait.clear();
    (state, signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::test_bars::{bad, bar, good};
    use crate::trading_core::gradient::NoViewport;
    use proptest::prelude::*;

    /// Five rising good bars: 100->102, 102->104, ... 108->110
    fn rising(count: i64) -> Vec<Bar> {
        (0..count).map(|i| good(i, 100.0 + 2.0 * i as f64)).collect()
    }

    fn run(cfg: &StrategyConfig, state: EngineState, bars: &[Bar]) -> (EngineState, Vec<Vec<Signal>>) {
        bars.iter().fold((state, Vec::new()), |(state, mut all), bar| {
            let (state, signals) = evaluate_bar(cfg, state, bar, &NoViewport);
            all.push(signals);
            (state, all)
        })
    }

    fn start(cfg: &StrategyConfig) -> EngineState {
        EngineState::new(cfg, &ExecutionConfig::default())
    }

    fn tick(price: f64) -> Tick {
        Tick {
            timestamp: chrono::Utc::now(),
            price,
            volume: 1,
        }
    }

    #[test]
    fn test_no_signal_before_window_fills() {
        let cfg = StrategyConfig::default();
        let (state, signals) = run(&cfg, start(&cfg), &rising(4));
        assert!(signals.iter().all(|s| s.is_empty()));
        assert_eq!(state.position.intended(), PositionSide::Flat);
        assert_eq!(state.bar_count, 4);
    }

    #[test]
    fn test_fresh_trend_enters_long() {
        let cfg = StrategyConfig::default();
        let (state, signals) = run(&cfg, start(&cfg), &rising(5));

        let last = &signals[4];
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].kind, SignalKind::EnterLong);
        assert_eq!(last[0].reason, SignalReason::TrendUp);
        assert_eq!(last[0].bar_index, 4);
        assert_eq!(last[0].price, 110.0);
        assert_eq!(state.position.intended(), PositionSide::Long);
    }

    #[test]
    fn test_bad_candle_defers_then_confirms() {
        let cfg = StrategyConfig::default();
        let bars = vec![
            good(0, 100.0),
            good(1, 102.0),
            good(2, 104.0),
            good(3, 106.0),
            bad(4, 108.0),
        ];
        let (state, signals) = run(&cfg, start(&cfg), &bars);
        assert!(signals[4].is_empty());
        assert!(state.pending.long_from_bad);
        assert!(!state.pending.short_from_good);

        let (state, signals) = evaluate_bar(&cfg, state, &good(5, 106.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EnterLong);
        assert_eq!(signals[0].reason, SignalReason::PendingConfirmed);
        assert!(!state.pending.long_from_bad);
    }

    #[test]
    fn test_pending_cleared_when_trend_vanishes() {
        let cfg = StrategyConfig::default();
        let bars = vec![
            good(0, 100.0),
            good(1, 102.0),
            bad(2, 104.0),
            good(3, 102.0),
            bad(4, 104.0),
        ];
        let (state, _) = run(&cfg, start(&cfg), &bars);
        assert!(state.pending.long_from_bad);

        // Window G B G B D: no trend either way
        let (state, signals) = evaluate_bar(&cfg, state, &bar(5, 102.0, 102.0), &NoViewport);
        assert!(signals.is_empty());
        assert!(!state.pending.long_from_bad);
    }

    #[test]
    fn test_pending_long_reverses_on_opposite_trend() {
        let cfg = StrategyConfig {
            trend_lookback: 3,
            min_consecutive: 2,
            ..Default::default()
        };
        let bars = vec![good(0, 100.0), good(1, 102.0), bad(2, 104.0)];
        let (state, signals) = run(&cfg, start(&cfg), &bars);
        assert!(signals[2].is_empty());
        assert!(state.pending.long_from_bad);

        // Window G B B: down, and the bad bar suits a short
        let (state, signals) = evaluate_bar(&cfg, state, &bad(3, 102.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EnterShort);
        assert_eq!(signals[0].reason, SignalReason::PendingReversal);
        assert_eq!(state.pending, PendingState::default());
        assert_eq!(state.position.intended(), PositionSide::Short);
    }

    #[test]
    fn test_pending_reversal_deferred_again_by_candle() {
        let cfg = StrategyConfig {
            trend_lookback: 3,
            min_consecutive: 2,
            ..Default::default()
        };
        let (mut state, _) = run(&cfg, start(&cfg), &[bad(0, 104.0), bad(1, 102.0)]);
        state.pending.defer(PositionSide::Long, false);

        // Window B B G: down, but a short is not taken on a good bar
        let (state, signals) = evaluate_bar(&cfg, state, &good(2, 100.0), &NoViewport);
        assert!(signals.is_empty());
        assert!(state.pending.short_from_good);
        assert!(!state.pending.long_from_bad);
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    #[test]
    fn test_bad_trend_good_candle_defers_short() {
        let cfg = StrategyConfig::default();
        let bars = vec![
            bad(0, 110.0),
            bad(1, 108.0),
            bad(2, 106.0),
            bad(3, 104.0),
            good(4, 102.0),
        ];
        let (state, signals) = run(&cfg, start(&cfg), &bars);
        assert!(signals[4].is_empty());
        assert!(state.pending.short_from_good);
        assert!(!state.pending.long_from_bad);

        // Window B B B G B: still down, bad bar confirms
        let (state, signals) = evaluate_bar(&cfg, state, &bad(5, 104.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EnterShort);
        assert_eq!(signals[0].reason, SignalReason::PendingConfirmed);
        assert!(!state.pending.short_from_good);
    }

    #[test]
    fn test_short_from_good_resolved_first() {
        let both = PendingState {
            long_from_bad: true,
            short_from_good: true,
            ..Default::default()
        };
        assert_eq!(both.entry_side(), Some(PositionSide::Short));

        let mut pending = PendingState::default();
        pending.defer(PositionSide::Long, true);
        assert_eq!(pending.entry_side(), Some(PositionSide::Long));
        assert!(pending.from_reversal);
    }

    #[test]
    fn test_deferred_reversal_bypasses_gradient_filter() {
        let cfg = StrategyConfig {
            gradient_filter_enabled: true,
            skip_longs_below_gradient: 89.0,
            skip_shorts_above_gradient: -89.0,
            ..Default::default()
        };
        let (mut reversal, _) = run(&cfg, start(&cfg), &rising(4));
        let mut plain = reversal.clone();
        reversal.pending.defer(PositionSide::Long, true);
        plain.pending.defer(PositionSide::Long, false);

        let (state, signals) = evaluate_bar(&cfg, reversal, &good(4, 108.0), &NoViewport);
        assert!(state.last_gradient.unwrap().angle_deg < 89.0);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EnterLong);
        assert_eq!(signals[0].reason, SignalReason::PendingConfirmed);

        let (state, signals) = evaluate_bar(&cfg, plain, &good(4, 108.0), &NoViewport);
        assert!(signals.is_empty());
        assert_eq!(state.pending, PendingState::default());
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    #[test]
    fn test_entry_bar_opposite_exits_next_bar() {
        let cfg = StrategyConfig::reversal();
        let (state, signals) = run(&cfg, start(&cfg), &rising(5));
        assert_eq!(signals[4][0].kind, SignalKind::EnterLong);
        assert_eq!(state.entry_mark.unwrap().bar_index, 5);

        // First bar held long closes bad
        let (state, signals) = evaluate_bar(&cfg, state, &bad(5, 110.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::ExitLong);
        assert_eq!(signals[0].reason, SignalReason::EntryBarOpposite);
        assert_eq!(signals[0].bar_index, 5);
        assert_eq!(state.position.intended(), PositionSide::Flat);
        assert!(state.entry_mark.is_none());
        assert_eq!(state.pending, PendingState::default());
    }

    #[test]
    fn test_signal_bar_colour_is_not_the_entry_bar() {
        let cfg = StrategyConfig {
            avoid_longs_on_bad_candle: false,
            exit_if_entry_bar_opposite: true,
            ..Default::default()
        };
        let bars = vec![
            good(0, 100.0),
            good(1, 102.0),
            bad(2, 104.0),
            good(3, 102.0),
            bad(4, 104.0),
        ];
        let (state, signals) = run(&cfg, start(&cfg), &bars);
        assert_eq!(signals[4][0].kind, SignalKind::EnterLong);

        let (state, signals) = evaluate_bar(&cfg, state, &good(5, 102.0), &NoViewport);
        assert!(signals.is_empty());
        assert!(state.entry_mark.is_none());
        assert_eq!(state.position.intended(), PositionSide::Long);
    }

    #[test]
    fn test_intrabar_entry_checks_forming_bar() {
        let cfg = StrategyConfig {
            allow_mid_bar_gradient_entry: true,
            exit_if_entry_bar_opposite: true,
            ..filtered()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        let (state, signals) = evaluate_tick(&cfg, state, &tick(120.0), &NoViewport);
        assert_eq!(signals[0].kind, SignalKind::EnterLong);
        assert_eq!(state.entry_mark.unwrap().bar_index, 5);

        let (state, signals) = evaluate_bar(&cfg, state, &bad(5, 121.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].reason, SignalReason::EntryBarOpposite);
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    #[test]
    fn test_entry_bar_agreeing_is_checked_once() {
        let cfg = StrategyConfig {
            exit_if_entry_bar_opposite: true,
            ..Default::default()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        assert!(state.entry_mark.is_some());

        let (state, signals) = evaluate_bar(&cfg, state, &good(5, 110.0), &NoViewport);
        assert!(signals.is_empty());
        assert!(state.entry_mark.is_none());
    }

    #[test]
    fn test_retrace_exit_resets_tracking() {
        let cfg = StrategyConfig {
            exit_on_retrace: true,
            retrace_fraction: 0.66,
            ..Default::default()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        assert_eq!(state.position.entry_price(), Some(110.0));

        let spike = Bar { high: 120.0, ..bar(5, 110.0, 118.0) };
        let (state, signals) = evaluate_bar(&cfg, state, &spike, &NoViewport);
        assert!(signals.is_empty());
        assert_eq!(state.position.max_favorable_excursion(), 10.0);

        // Profit 3 <= 10 x 0.34
        let (state, signals) = evaluate_bar(&cfg, state, &bar(6, 112.0, 113.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::ExitLong);
        assert_eq!(signals[0].reason, SignalReason::Retrace);
        assert_eq!(state.pending, PendingState::default());
        assert!(!state.wait.is_waiting());
    }

    #[test]
    fn test_intrabar_entry_ignores_extremes_before_entry() {
        let cfg = StrategyConfig {
            allow_mid_bar_gradient_entry: true,
            exit_on_retrace: true,
            ..filtered()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        let (state, signals) = evaluate_tick(&cfg, state, &tick(120.0), &NoViewport);
        assert_eq!(signals[0].reason, SignalReason::GradientWaitEntry);

        // The 130 high printed before the entry tick
        let entry_bar = Bar { high: 130.0, ..bar(5, 119.0, 121.0) };
        let (state, signals) = evaluate_bar(&cfg, state, &entry_bar, &NoViewport);
        assert!(signals.is_empty());
        assert_eq!(state.position.max_favorable_excursion(), 1.0);
        assert_eq!(state.position.intended(), PositionSide::Long);

        // Later bars count their full range
        let next = Bar { high: 125.0, ..bar(6, 121.0, 122.0) };
        let (state, signals) = evaluate_bar(&cfg, state, &next, &NoViewport);
        assert!(signals.is_empty());
        assert_eq!(state.position.max_favorable_excursion(), 5.0);
    }

    #[test]
    fn test_marginal_split_postpones_then_confirms() {
        let cfg = StrategyConfig {
            trend_lookback: 4,
            ..Default::default()
        };
        let (state, signals) = run(&cfg, start(&cfg), &rising(4));
        assert_eq!(signals[3][0].kind, SignalKind::EnterLong);

        let bars = vec![bar(4, 108.0, 107.5), bar(5, 107.5, 107.0)];
        let (state, signals) = run(&cfg, state, &bars);
        assert!(signals.iter().all(|s| s.is_empty()));
        assert!(state.pending.exit_long);
        assert_eq!(state.position.intended(), PositionSide::Long);

        let (state, signals) = evaluate_bar(&cfg, state, &bar(6, 107.0, 106.5), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].reason, SignalReason::TrendBreakConfirmed);
        assert!(!state.pending.exit_long);
    }

    #[test]
    fn test_marginal_split_cancelled_by_continuation() {
        let cfg = StrategyConfig {
            trend_lookback: 4,
            ..Default::default()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(4));
        let (state, _) = run(&cfg, state, &[bar(4, 108.0, 107.5), bar(5, 107.5, 107.0)]);
        assert!(state.pending.exit_long);

        let (state, signals) = evaluate_bar(&cfg, state, &bar(6, 107.0, 107.4), &NoViewport);
        assert!(signals.is_empty());
        assert!(!state.pending.exit_long);
        assert_eq!(state.position.intended(), PositionSide::Long);
    }

    #[test]
    fn test_opposite_trend_reverses() {
        let cfg = StrategyConfig {
            reverse_on_trend_break: true,
            ..Default::default()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        let bars = vec![bad(5, 110.0), bad(6, 108.0), bad(7, 106.0)];
        let (state, signals) = run(&cfg, state, &bars);

        assert!(signals[0].is_empty());
        assert!(signals[1].is_empty());
        let kinds: Vec<_> = signals[2].iter().map(|s| (s.kind, s.reason)).collect();
        assert_eq!(
            kinds,
            vec![
                (SignalKind::ExitLong, SignalReason::TrendBreak),
                (SignalKind::EnterShort, SignalReason::Reversal),
            ]
        );
        assert_eq!(state.position.intended(), PositionSide::Short);
    }

    #[test]
    fn test_trend_break_without_reversal_goes_flat() {
        let cfg = StrategyConfig::default();
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        let bars = vec![bad(5, 110.0), bad(6, 108.0), bad(7, 106.0)];
        let (state, signals) = run(&cfg, state, &bars);

        assert_eq!(signals[2].len(), 1);
        assert_eq!(signals[2][0].kind, SignalKind::ExitLong);
        assert_eq!(signals[2][0].reason, SignalReason::TrendBreak);
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    fn filtered() -> StrategyConfig {
        StrategyConfig {
            gradient_filter_enabled: true,
            skip_longs_below_gradient: 45.0,
            skip_shorts_above_gradient: -45.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_gradient_filter_skips_entry() {
        let cfg = filtered();
        let (state, signals) = run(&cfg, start(&cfg), &rising(5));

        assert!(signals[4].is_empty());
        assert!(state.last_gradient.unwrap().angle_deg < 45.0);
        assert_eq!(state.wait.entry, None);
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    #[test]
    fn test_gradient_wait_enters_on_tick() {
        let cfg = StrategyConfig {
            allow_mid_bar_gradient_entry: true,
            ..filtered()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        assert_eq!(state.wait.entry, Some(PositionSide::Long));

        let (state, signals) = evaluate_tick(&cfg, state, &tick(106.0), &NoViewport);
        assert!(signals.is_empty());

        let (state, signals) = evaluate_tick(&cfg, state, &tick(120.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::EnterLong);
        assert_eq!(signals[0].reason, SignalReason::GradientWaitEntry);
        assert_eq!(signals[0].source, SignalSource::Tick);
        assert_eq!(signals[0].bar_index, 5);
        assert!(state.entry_mark.unwrap().intrabar);
    }

    #[test]
    fn test_wait_reset_at_next_bar() {
        let cfg = StrategyConfig {
            allow_mid_bar_gradient_entry: true,
            ..filtered()
        };
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        assert!(state.wait.is_waiting());

        // Still an up trend, but the bad bar defers the entry instead
        let (state, signals) = evaluate_bar(&cfg, state, &bad(5, 110.0), &NoViewport);
        assert!(signals.is_empty());
        assert_eq!(state.wait.entry, None);
        assert!(state.pending.long_from_bad);
    }

    #[test]
    fn test_gradient_wait_exit_on_tick() {
        let cfg = StrategyConfig {
            gradient_filter_enabled: true,
            skip_longs_below_gradient: 10.0,
            skip_shorts_above_gradient: -10.0,
            allow_mid_bar_gradient_exit: true,
            ..Default::default()
        };
        let (state, signals) = run(&cfg, start(&cfg), &rising(5));
        assert_eq!(signals[4][0].kind, SignalKind::EnterLong);

        let dojis: Vec<Bar> = (5..8).map(|i| bar(i, 110.0, 110.0)).collect();
        let (state, signals) = run(&cfg, state, &dojis);
        assert!(signals.iter().all(|s| s.is_empty()));
        assert_eq!(state.wait.exit, Some(PositionSide::Long));

        let (state, signals) = evaluate_tick(&cfg, state, &tick(100.0), &NoViewport);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::ExitLong);
        assert_eq!(signals[0].reason, SignalReason::GradientWaitExit);
        assert_eq!(state.position.intended(), PositionSide::Flat);
    }

    #[test]
    fn test_duplicate_entry_suppressed() {
        let cfg = StrategyConfig::default();
        let (mut state, _) = run(&cfg, start(&cfg), &rising(5));
        state.wait.entry = Some(PositionSide::Long);

        let (state, signals) = evaluate_tick(&cfg, state, &tick(200.0), &NoViewport);
        assert!(signals.is_empty());
        assert!(state.last_actions[0].contains("ConflictingIntent"));
    }

    #[test]
    fn test_flatten_exits_and_clears() {
        let cfg = StrategyConfig::default();
        let (state, _) = run(&cfg, start(&cfg), &rising(5));
        let (state, signals) = evaluate_flatten(state, 109.0);
        assert_eq!(signals[0].kind, SignalKind::ExitLong);
        assert_eq!(signals[0].reason, SignalReason::ManualFlatten);
        assert_eq!(signals[0].source, SignalSource::Manual);

        let (_, signals) = evaluate_flatten(state, 109.0);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_reset_session_keeps_position() {
        let cfg = StrategyConfig::default();
        let (mut state, _) = run(&cfg, start(&cfg), &rising(5));
        state.reset_session();
        assert!(state.window.is_empty());
        assert!(state.history.is_empty());
        assert_eq!(state.position.intended(), PositionSide::Long);
    }

    fn bar_strategy() -> impl Strategy<Value = Vec<(f64, f64)>> {
        prop::collection::vec((90.0f64..110.0, -3.0f64..3.0), 1..60)
    }

    fn to_bars(raw: &[(f64, f64)]) -> Vec<Bar> {
        raw.iter()
            .enumerate()
            .map(|(i, (open, body))| bar(i as i64, *open, open + body))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_pending_entries_exclusive(
            raw in bar_strategy(),
            reverse in any::<bool>(),
            tiebreak in any::<bool>(),
            lookback in 3usize..=10,
        ) {
            let cfg = StrategyConfig {
                reverse_on_trend_break: reverse,
                use_pnl_tiebreaker: tiebreak,
                trend_lookback: lookback,
                min_consecutive: 2,
                ..Default::default()
            };
            let mut state = start(&cfg);
            for bar in to_bars(&raw) {
                let (next, _) = evaluate_bar(&cfg, state, &bar, &NoViewport);
                prop_assert!(!(next.pending.long_from_bad && next.pending.short_from_good));
                state = next;
            }
        }

        #[test]
        fn prop_same_input_same_signals(raw in bar_strategy()) {
            let cfg = StrategyConfig {
                reverse_on_trend_break: true,
                exit_on_retrace: true,
                ..StrategyConfig::momentum_filtered()
            };
            let bars = to_bars(&raw);
            let (a, sig_a) = run(&cfg, start(&cfg), &bars);
            let (b, sig_b) = run(&cfg, start(&cfg), &bars);
            prop_assert_eq!(sig_a, sig_b);
            prop_assert_eq!(a.pending, b.pending);
            prop_assert_eq!(a.position.intended(), b.position.intended());
        }
    }
}
