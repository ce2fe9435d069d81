// Library crate - exports the decision engine and its collaborators

pub mod execution;
pub mod replay;
pub mod services;
pub mod trading_core;
pub mod types;

// Re-export commonly used types
pub use trading_core::{Bar, Decision, DecisionEngine, EngineState, StrategyConfig};
pub use types::*;
