//! Short-lived cache for service-sourced stop distances
//!
//! Entries are keyed by instrument and hour-of-day and expire after a TTL
//! measured in bar time, so replays behave the same as live sessions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Cache key for a volatility lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StopCacheKey {
    pub instrument: String,
    pub hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedStop {
    key: StopCacheKey,
    ticks: u32,
    stored_at: DateTime<Utc>,
}

/// Single-slot cache; a new hour replaces the previous entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopCache {
    entry: Option<CachedStop>,
}

impl StopCache {
    /// Cached ticks for `key` if stored less than `ttl` before `now`
    pub fn get(&self, key: &StopCacheKey, now: DateTime<Utc>, ttl: Duration) -> Option<u32> {
        let entry = self.entry.as_ref()?;
        if &entry.key != key {
            return None;
        }
        let age = now - entry.stored_at;
        if age < Duration::zero() || age >= ttl {
            return None;
        }
        Some(entry.ticks)
    }

    pub fn store(&mut self, key: StopCacheKey, ticks: u32, now: DateTime<Utc>) {
        self.entry = Some(CachedStop {
            key,
            ticks,
            stored_at: now,
        });
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}
