//! Decision engine - drives the rules from bar, tick and fill events
//!
//! The engine owns the [`EngineState`] and the collaborators the pure rules
//! must not touch: the viewport scale, the volatility service and the
//! diagnostics sink. Event handlers are synchronous and return the signals
//! at once; an entry also carries a [`StopDue`] which the caller resolves
//! with [`DecisionEngine::resolve_stop`] after it has dispatched them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::bars::Bar;
use super::config::StrategyConfig;
use super::gradient::{NoViewport, ScaleProvider};
use super::rules::{self, EngineState};
use super::stop_loss::{StopLossCalculator, StopRequest};
use crate::execution::{ExecutionConfig, PositionSide, Signal};
use crate::services::{BarSnapshot, DiagnosticsSink, VolatilityService};
use crate::types::{Fill, Tick};

/// An entry whose protective stop has not been sized yet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopDue {
    pub side: PositionSide,
    pub bar_index: u64,
    /// Event time; keys the stop cache
    pub at: DateTime<Utc>,
}

/// Output of one event
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub signals: Vec<Signal>,
    /// Set when this event opened a position
    pub stop_due: Option<StopDue>,
    /// Present for bar closes only
    pub snapshot: Option<BarSnapshot>,
}

pub struct DecisionEngine {
    strategy: StrategyConfig,
    execution: ExecutionConfig,
    state: EngineState,
    stops: StopLossCalculator,
    scale: Box<dyn ScaleProvider + Send + Sync>,
    volatility: Option<Arc<dyn VolatilityService>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl DecisionEngine {
    /// Validate both configurations and start flat
    pub fn new(strategy: StrategyConfig, execution: ExecutionConfig) -> Result<Self> {
        let state = EngineState::new(&strategy, &execution);
        Self::from_state(strategy, execution, state)
    }

    /// Resume from a previously captured state
    pub fn from_state(strategy: StrategyConfig, execution: ExecutionConfig, state: EngineState) -> Result<Self> {
        strategy.validate()?;
        execution.validate()?;
        let stops = StopLossCalculator::new(&execution)?;

        info!(
            "Decision engine: lookback {} min {} | gradient {} | stops {} on {}",
            strategy.trend_lookback,
            strategy.min_consecutive,
            if strategy.gradient_filter_enabled { "on" } else { "off" },
            execution.stop_sizing,
            execution.instrument
        );

        Ok(Self {
            strategy,
            execution,
            state,
            stops,
            scale: Box::new(NoViewport),
            volatility: None,
            diagnostics: None,
        })
    }

    pub fn with_scale_provider(mut self, scale: impl ScaleProvider + Send + Sync + 'static) -> Self {
        self.scale = Box::new(scale);
        self
    }

    pub fn with_volatility_service(mut self, service: Arc<dyn VolatilityService>) -> Self {
        self.volatility = Some(service);
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Evaluate a completed bar
    pub fn on_bar_close(&mut self, bar: &Bar) -> Decision {
        let state = std::mem::take(&mut self.state);
        let (state, signals) = rules::evaluate_bar(&self.strategy, state, bar, self.scale.as_ref());
        self.state = state;

        let snapshot = self.snapshot(bar);
        if let Some(sink) = &self.diagnostics {
            sink.publish(&snapshot);
        }

        Decision {
            stop_due: stop_due(&signals, bar.timestamp),
            signals,
            snapshot: Some(snapshot),
        }
    }

    /// Feed an intra-bar price
    pub fn on_tick(&mut self, tick: &Tick) -> Decision {
        let state = std::mem::take(&mut self.state);
        let (state, signals) = rules::evaluate_tick(&self.strategy, state, tick, self.scale.as_ref());
        self.state = state;

        Decision {
            stop_due: stop_due(&signals, tick.timestamp),
            signals,
            snapshot: None,
        }
    }

    /// Size the stop for an entry handed out by `on_bar_close` or `on_tick`
    pub async fn resolve_stop(&mut self, due: StopDue) -> StopRequest {
        let request = self
            .stops
            .resolve(
                &mut self.state.stop,
                due.side,
                due.bar_index,
                &self.state.history,
                due.at,
                self.volatility.as_deref(),
            )
            .await;
        info!("{}", request);
        request
    }

    /// Apply a broker fill
    pub fn on_fill(&mut self, fill: &Fill) {
        self.state.position.reconcile(fill);

        let intended = self.state.position.intended();
        if self
            .state
            .entry_mark
            .is_some_and(|mark| mark.side != intended)
        {
            self.state.entry_mark = None;
        }
        if intended.is_flat() {
            self.state.pending.clear_exits();
            self.state.wait.exit = None;
        }
    }

    /// Replace the stop of the open position; `None` when flat
    pub fn override_stop(&mut self, ticks: u32) -> Option<StopRequest> {
        let side = self.state.position.intended();
        if side.is_flat() {
            warn!("Stop override ignored: no position");
            return None;
        }

        let ticks = StopLossCalculator::override_ticks(&mut self.state.stop, ticks);
        let request = StopRequest {
            side,
            ticks,
            mode: self.state.stop.mode,
            bar_index: self.state.bar_count,
        };
        info!("{}", request);
        Some(request)
    }

    /// Exit whatever position is intended
    pub fn flatten(&mut self, reason: &str) -> Vec<Signal> {
        let price = self
            .state
            .history
            .back()
            .map(|bar| bar.close)
            .or(self.state.position.entry_price())
            .unwrap_or(0.0);

        info!("FLATTEN: {}", reason);
        let state = std::mem::take(&mut self.state);
        let (state, signals) = rules::evaluate_flatten(state, price);
        self.state = state;
        signals
    }

    /// Session boundary: forget bar history and pending decisions, keep the position
    pub fn reset_session(&mut self) {
        info!("Session reset after {} bars", self.state.bar_count);
        self.state.reset_session();
    }

    fn snapshot(&self, bar: &Bar) -> BarSnapshot {
        let state = &self.state;
        BarSnapshot {
            bar_index: state.bar_count.saturating_sub(1),
            timestamp: bar.timestamp,
            color: bar.color(),
            pattern: state.window.pattern(self.strategy.trend_lookback),
            good_count: state.last_counts.good,
            bad_count: state.last_counts.bad,
            net_pnl: state.last_counts.net_pnl,
            trend_up: state.last_trend.up,
            trend_down: state.last_trend.down,
            gradient_deg: state.last_gradient.map(|g| g.angle_deg),
            pending_long_from_bad: state.pending.long_from_bad,
            pending_short_from_good: state.pending.short_from_good,
            pending_exit_long: state.pending.exit_long,
            pending_exit_short: state.pending.exit_short,
            waiting_entry: state.wait.entry,
            waiting_exit: state.wait.exit,
            intended: state.position.intended(),
            actual: state.position.actual(),
            entry_bar_index: state.position.entry_bar_index(),
            actions: state.last_actions.clone(),
        }
    }
}

fn stop_due(signals: &[Signal], at: DateTime<Utc>) -> Option<StopDue> {
    let entry = signals.iter().rev().find(|s| s.kind.is_entry())?;
    Some(StopDue {
        side: entry.kind.side(),
        bar_index: entry.bar_index,
        at,
    })
}
