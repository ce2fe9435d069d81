//! Trading Core - bar-by-bar trend decisions
//!
//! This module contains the strategy components:
//! - Bar classification and the rolling window
//! - Trend detection from good/bad counts
//! - Momentum gradient of the smoothed close
//! - Stop-loss sizing with a volatility/ATR/fixed fallback chain
//! - The per-bar rule state machine and the engine around it

pub mod bars;
pub mod cache;
pub mod config;
pub mod engine;
pub mod gradient;
pub mod rules;
pub mod stop_loss;
pub mod trend;

// Re-export commonly used types
pub use bars::{Bar, BarColor, RollingBarWindow, WindowCounts};
pub use config::StrategyConfig;
pub use engine::{Decision, DecisionEngine, StopDue};
pub use gradient::{GradientEstimator, GradientMode, GradientSample, LinearViewport, NoViewport, ScaleProvider};
pub use rules::{evaluate_bar, evaluate_tick, EngineState, GradientWait, PendingState};
pub use stop_loss::{StopLossCalculator, StopLossSpec, StopMode, StopRequest};
pub use trend::{TrendDetector, TrendSignal};
