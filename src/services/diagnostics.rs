//! Bar snapshots for observability
//!
//! Snapshots are write-only: the engine never reads them back. The HTTP sink
//! pushes each snapshot on a spawned task and drops it on any failure.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::execution::PositionSide;
use crate::trading_core::bars::BarColor;

/// State of the engine after one bar close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSnapshot {
    pub bar_index: u64,
    pub timestamp: DateTime<Utc>,
    pub color: BarColor,
    pub pattern: String,
    pub good_count: usize,
    pub bad_count: usize,
    pub net_pnl: f64,
    pub trend_up: bool,
    pub trend_down: bool,
    pub gradient_deg: Option<f64>,
    pub pending_long_from_bad: bool,
    pub pending_short_from_good: bool,
    pub pending_exit_long: bool,
    pub pending_exit_short: bool,
    pub waiting_entry: Option<PositionSide>,
    pub waiting_exit: Option<PositionSide>,
    pub intended: PositionSide,
    pub actual: PositionSide,
    /// Signal bar of the intended position
    pub entry_bar_index: Option<u64>,
    /// Signals and skips produced on this bar
    pub actions: Vec<String>,
}

/// Receiver of bar snapshots
pub trait DiagnosticsSink: Send + Sync {
    fn publish(&self, snapshot: &BarSnapshot);
}

/// Logs each snapshot as JSON at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn publish(&self, snapshot: &BarSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => debug!(target: "bar_trend::diagnostics", "{}", json),
            Err(e) => debug!("Snapshot serialization failed: {}", e),
        }
    }
}

/// Fire-and-forget POST of each snapshot to a dashboard endpoint
pub struct HttpDiagnostics {
    client: Client,
    url: String,
}

impl HttpDiagnostics {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create diagnostics HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl DiagnosticsSink for HttpDiagnostics {
    fn publish(&self, snapshot: &BarSnapshot) {
        // Outside a runtime there is nowhere to run the push; drop it
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let request = self.client.post(&self.url).json(snapshot);
        let bar_index = snapshot.bar_index;
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("Diagnostics push for bar {} rejected: {}", bar_index, response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("Diagnostics push for bar {} dropped: {}", bar_index, e),
            }
        });
    }
}
