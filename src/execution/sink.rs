//! Signal sinks - where entry/exit decisions and stop requests go

use tokio::sync::broadcast;
use tracing::info;

use super::order::{Signal, SignalKind, SignalReason};
use crate::trading_core::stop_loss::StopRequest;

/// Receiver of engine output
pub trait SignalSink {
    fn enter_long(&mut self, tag: &str, reason: SignalReason, signal: &Signal);
    fn enter_short(&mut self, tag: &str, reason: SignalReason, signal: &Signal);
    fn exit_long(&mut self, tag: &str, reason: SignalReason, signal: &Signal);
    fn exit_short(&mut self, tag: &str, reason: SignalReason, signal: &Signal);

    /// Stop distance for the position just opened
    fn on_stop(&mut self, stop: &StopRequest);

    /// Route a signal to the matching call
    fn dispatch(&mut self, signal: &Signal) {
        match signal.kind {
            SignalKind::EnterLong => self.enter_long(&signal.tag, signal.reason, signal),
            SignalKind::EnterShort => self.enter_short(&signal.tag, signal.reason, signal),
            SignalKind::ExitLong => self.exit_long(&signal.tag, signal.reason, signal),
            SignalKind::ExitShort => self.exit_short(&signal.tag, signal.reason, signal),
        }
    }
}

/// Logs every call as the market order it stands for
#[derive(Debug)]
pub struct LogSink {
    /// Contracts per order
    pub quantity: u32,
    pub entries: usize,
    pub exits: usize,
}

impl LogSink {
    pub fn new(quantity: u32) -> Self {
        Self {
            quantity,
            entries: 0,
            exits: 0,
        }
    }

    /// e.g. `BUY 2`
    pub fn order(&self, signal: &Signal) -> String {
        format!("{} {}", signal.kind.order_side(), self.quantity)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SignalSink for LogSink {
    fn enter_long(&mut self, tag: &str, reason: SignalReason, signal: &Signal) {
        self.entries += 1;
        info!("ENTER LONG [{}] {} | {} @ {:.2}", tag, reason, self.order(signal), signal.price);
    }

    fn enter_short(&mut self, tag: &str, reason: SignalReason, signal: &Signal) {
        self.entries += 1;
        info!("ENTER SHORT [{}] {} | {} @ {:.2}", tag, reason, self.order(signal), signal.price);
    }

    fn exit_long(&mut self, tag: &str, reason: SignalReason, signal: &Signal) {
        self.exits += 1;
        info!("EXIT LONG [{}] {} | {} @ {:.2}", tag, reason, self.order(signal), signal.price);
    }

    fn exit_short(&mut self, tag: &str, reason: SignalReason, signal: &Signal) {
        self.exits += 1;
        info!("EXIT SHORT [{}] {} | {} @ {:.2}", tag, reason, self.order(signal), signal.price);
    }

    fn on_stop(&mut self, stop: &StopRequest) {
        info!("{}", stop);
    }
}

/// Events published by [`BroadcastSink`]
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Signal(Signal),
    Stop(StopRequest),
}

/// Fans engine output out to any number of subscribers
pub struct BroadcastSink {
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: ExecutionEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}

impl SignalSink for BroadcastSink {
    fn enter_long(&mut self, _tag: &str, _reason: SignalReason, signal: &Signal) {
        self.publish(ExecutionEvent::Signal(signal.clone()));
    }

    fn enter_short(&mut self, _tag: &str, _reason: SignalReason, signal: &Signal) {
        self.publish(ExecutionEvent::Signal(signal.clone()));
    }

    fn exit_long(&mut self, _tag: &str, _reason: SignalReason, signal: &Signal) {
        self.publish(ExecutionEvent::Signal(signal.clone()));
    }

    fn exit_short(&mut self, _tag: &str, _reason: SignalReason, signal: &Signal) {
        self.publish(ExecutionEvent::Signal(signal.clone()));
    }

    fn on_stop(&mut self, stop: &StopRequest) {
        self.publish(ExecutionEvent::Stop(*stop));
    }
}
