//! Replay of recorded bars, ticks and fills through the decision engine
//!
//! Inputs are CSV files with headers:
//! - bars: `timestamp,open,high,low,close,volume` (timestamp is the bar close, RFC 3339)
//! - ticks: `timestamp,price[,volume]`
//! - fills: `side,quantity,price,time` (side is `Buy` or `Sell`)
//!
//! Events are merged by time. At equal timestamps ticks come first, then the
//! bar close, then fills.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

use crate::execution::{PositionSide, SignalSink};
use crate::trading_core::bars::Bar;
use crate::trading_core::engine::DecisionEngine;
use crate::types::{Fill, Tick};

/// One input event
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Tick(Tick),
    Bar(Bar),
    Fill(Fill),
}

impl ReplayEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Tick(tick) => tick.timestamp,
            Self::Bar(bar) => bar.timestamp,
            Self::Fill(fill) => fill.time,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Tick(_) => 0,
            Self::Bar(_) => 1,
            Self::Fill(_) => 2,
        }
    }
}

fn read_rows<T, R>(reader: R, what: &str) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    R: Read,
{
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for (line, result) in csv_reader.deserialize().enumerate() {
        let row: T = result.with_context(|| format!("Failed to parse {} row {}", what, line + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_bars<R: Read>(reader: R) -> Result<Vec<Bar>> {
    read_rows(reader, "bar")
}

pub fn read_ticks<R: Read>(reader: R) -> Result<Vec<Tick>> {
    read_rows(reader, "tick")
}

pub fn read_fills<R: Read>(reader: R) -> Result<Vec<Fill>> {
    read_rows(reader, "fill")
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    Ok(BufReader::new(file))
}

/// Merge inputs into one time-ordered stream
pub fn merge_events(bars: Vec<Bar>, ticks: Vec<Tick>, fills: Vec<Fill>) -> Vec<ReplayEvent> {
    let mut events: Vec<ReplayEvent> = bars
        .into_iter()
        .map(ReplayEvent::Bar)
        .chain(ticks.into_iter().map(ReplayEvent::Tick))
        .chain(fills.into_iter().map(ReplayEvent::Fill))
        .collect();
    events.sort_by_key(|event| (event.timestamp(), event.rank()));
    events
}

/// Load and merge the CSV inputs
pub fn load_events(bars: &Path, ticks: Option<&Path>, fills: Option<&Path>) -> Result<Vec<ReplayEvent>> {
    let bars = read_bars(open(bars)?)?;
    let ticks = match ticks {
        Some(path) => read_ticks(open(path)?)?,
        None => Vec::new(),
    };
    let fills = match fills {
        Some(path) => read_fills(open(path)?)?,
        None => Vec::new(),
    };
    info!("Loaded {} bars, {} ticks, {} fills", bars.len(), ticks.len(), fills.len());
    Ok(merge_events(bars, ticks, fills))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Reset trend tracking when the session date changes
    pub reset_on_new_session: bool,
    /// Flatten any open position after the last event
    pub flatten_at_end: bool,
}

/// Totals of one replay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub bars: usize,
    pub ticks: usize,
    pub fills: usize,
    pub entries: usize,
    pub exits: usize,
    pub stops: usize,
    pub session_resets: usize,
    pub intended: PositionSide,
    pub actual: PositionSide,
}

/// Drive `engine` through `events`, handing every signal and stop to `sink`.
/// Signals are dispatched before the stop lookup is awaited.
pub async fn run(
    engine: &mut DecisionEngine,
    events: Vec<ReplayEvent>,
    sink: &mut dyn SignalSink,
    options: ReplayOptions,
) -> Result<ReplaySummary> {
    let timezone = engine.execution().timezone()?;
    let mut summary = ReplaySummary::default();
    let mut session: Option<NaiveDate> = None;

    for event in events {
        let decision = match event {
            ReplayEvent::Bar(bar) => {
                let date = bar.timestamp.with_timezone(&timezone).date_naive();
                if options.reset_on_new_session && session.is_some_and(|d| d != date) {
                    engine.reset_session();
                    summary.session_resets += 1;
                }
                session = Some(date);
                summary.bars += 1;
                engine.on_bar_close(&bar)
            }
            ReplayEvent::Tick(tick) => {
                summary.ticks += 1;
                engine.on_tick(&tick)
            }
            ReplayEvent::Fill(fill) => {
                summary.fills += 1;
                engine.on_fill(&fill);
                continue;
            }
        };

        for signal in &decision.signals {
            if signal.kind.is_entry() {
                summary.entries += 1;
            } else {
                summary.exits += 1;
            }
            sink.dispatch(signal);
        }
        if let Some(due) = decision.stop_due {
            let stop = engine.resolve_stop(due).await;
            summary.stops += 1;
            sink.on_stop(&stop);
        }
    }

    if options.flatten_at_end {
        for signal in engine.flatten("end of replay") {
            summary.exits += 1;
            sink.dispatch(&signal);
        }
    }

    summary.intended = engine.state().position.intended();
    summary.actual = engine.state().position.actual();
    debug!("Replay summary: {:?}", summary);
    Ok(summary)
}
