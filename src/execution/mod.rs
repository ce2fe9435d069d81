//! Execution-facing types
//!
//! Signals leave the engine through a [`SignalSink`]; fills come back in and
//! are reconciled by the [`PositionTracker`].

mod config;
mod order;
mod position;
mod sink;

pub use config::{ExecutionConfig, StopSizing};
pub use order::{OrderSide, Signal, SignalKind, SignalReason, SignalSource, LONG_TAG, SHORT_TAG};
pub use position::{PositionSide, PositionTracker};
pub use sink::{BroadcastSink, ExecutionEvent, LogSink, SignalSink};
