use anyhow::{Context, Result};
use bar_trend::execution::{ExecutionConfig, LogSink};
use bar_trend::replay::{self, ReplayOptions};
use bar_trend::services::{HttpDiagnostics, HttpVolatilityService, TracingDiagnostics};
use bar_trend::trading_core::{DecisionEngine, StrategyConfig};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Momentum,
    Reversal,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay recorded bars through the trend decision engine")]
struct Args {
    /// Bars CSV (timestamp,open,high,low,close,volume)
    #[arg(short, long, env = "BAR_TREND_BARS")]
    bars: PathBuf,

    /// Optional ticks CSV (timestamp,price[,volume])
    #[arg(short, long)]
    ticks: Option<PathBuf>,

    /// Optional fills CSV (side,quantity,price,time)
    #[arg(short, long)]
    fills: Option<PathBuf>,

    /// Strategy config JSON; overrides --preset
    #[arg(long, env = "BAR_TREND_STRATEGY")]
    strategy: Option<PathBuf>,

    /// Strategy preset when no config file is given
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// Execution config JSON (instrument, stops, services)
    #[arg(long, env = "BAR_TREND_EXECUTION")]
    execution: Option<PathBuf>,

    /// Volatility service base URL; enables service-sourced stops
    #[arg(long, env = "VOLATILITY_URL")]
    volatility_url: Option<String>,

    /// Dashboard endpoint for bar snapshots
    #[arg(long, env = "DIAGNOSTICS_URL")]
    diagnostics_url: Option<String>,

    /// Reset trend tracking when the session date changes
    #[arg(long)]
    reset_sessions: bool,

    /// Flatten any open position after the last bar
    #[arg(long)]
    flatten_at_end: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("bar_trend=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let strategy = match &args.strategy {
        Some(path) => StrategyConfig::from_file(path)?,
        None => match args.preset {
            Preset::Default => StrategyConfig::default(),
            Preset::Momentum => StrategyConfig::momentum_filtered(),
            Preset::Reversal => StrategyConfig::reversal(),
        },
    };

    let mut execution = match &args.execution {
        Some(path) => ExecutionConfig::from_file(path)?,
        None => ExecutionConfig::default(),
    };
    if let Some(url) = &args.volatility_url {
        execution.volatility_url = Some(url.clone());
        execution.volatility_enabled = true;
    }
    if let Some(url) = &args.diagnostics_url {
        execution.diagnostics_url = Some(url.clone());
    }

    info!("Starting bar-trend replay");
    info!("Bars: {:?}", args.bars);
    info!("Strategy: {}", serde_json::to_string(&strategy)?);

    let mut engine = DecisionEngine::new(strategy, execution.clone())?;

    if execution.volatility_enabled {
        if let Some(url) = &execution.volatility_url {
            let service = HttpVolatilityService::new(url, execution.volatility_timeout())?;
            engine = engine.with_volatility_service(Arc::new(service));
            info!("Volatility service: {}", url);
        }
    }

    engine = match &execution.diagnostics_url {
        Some(url) => {
            info!("Diagnostics endpoint: {}", url);
            engine.with_diagnostics(Arc::new(HttpDiagnostics::new(url, execution.diagnostics_timeout())?))
        }
        None => engine.with_diagnostics(Arc::new(TracingDiagnostics)),
    };

    let events = replay::load_events(&args.bars, args.ticks.as_deref(), args.fills.as_deref())
        .context("Failed to load replay input")?;

    let options = ReplayOptions {
        reset_on_new_session: args.reset_sessions,
        flatten_at_end: args.flatten_at_end,
    };
    let mut sink = LogSink::new(execution.quantity);
    let summary = replay::run(&mut engine, events, &mut sink, options).await?;

    info!(
        "Replay complete: {} bars, {} ticks, {} fills | {} entries, {} exits, {} stops | {} session resets",
        summary.bars,
        summary.ticks,
        summary.fills,
        summary.entries,
        summary.exits,
        summary.stops,
        summary.session_resets
    );
    info!("Final position: intended {} | actual {}", summary.intended, summary.actual);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // Let in-flight diagnostics pushes finish
    tokio::time::sleep(execution.diagnostics_timeout()).await;

    Ok(())
}
