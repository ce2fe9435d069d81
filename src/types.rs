use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::OrderSide;

/// Intra-bar price update for the forming bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    #[serde(default)]
    pub volume: u64,
}

/// Broker fill confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub side: OrderSide,
    pub quantity: u32,
    pub price: f64,
    pub time: DateTime<Utc>,
}
