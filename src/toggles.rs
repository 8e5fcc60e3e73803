// =============================================================================
// Toggle Store — externally-mutable execution switches in the bus KV
// =============================================================================
//
// Two keys gate the engine at runtime:
//
//   toggles:autoTrade  — "true"/"false" (writers may use 1/0, yes/no, on/off)
//   toggles:mode       — "paper"/"live"
//
// Operators and the ops API write them at any time. Readers hold a cached
// last-known value, refreshed on a sub-second cadence; a read failure keeps
// the last value rather than flapping. Every observed change is logged and
// broadcast on a watch channel so the executor can react to the
// `autoTrade` falling edge by flushing its inflight table.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::{keys, MessageBus};
use crate::config::EngineConfig;
use crate::types::TradeMode;

/// Refresh cadence. The contract is ≤1 s; half that keeps the gate tight
/// without hammering the KV.
pub const TOGGLE_REFRESH_MS: u64 = 500;

/// Point-in-time view of both toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToggleState {
    pub auto_trade: bool,
    pub mode: TradeMode,
}

/// Shared last-known toggle values.
pub struct ToggleCache {
    state: RwLock<ToggleState>,
}

impl ToggleCache {
    pub fn new(initial: ToggleState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub fn auto_trade(&self) -> bool {
        self.state.read().auto_trade
    }

    pub fn mode(&self) -> TradeMode {
        self.state.read().mode
    }

    pub fn snapshot(&self) -> ToggleState {
        *self.state.read()
    }

    fn store(&self, state: ToggleState) {
        *self.state.write() = state;
    }
}

/// Parse an autoTrade value. Canonical is "true"/"false"; the accepted
/// synonyms mirror what operators actually type.
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Write a toggle key in canonical form.
pub async fn write_auto_trade(bus: &dyn MessageBus, value: bool) -> anyhow::Result<()> {
    bus.kv_set(keys::TOGGLE_AUTO_TRADE, if value { "true" } else { "false" })
        .await
}

pub async fn write_mode(bus: &dyn MessageBus, mode: TradeMode) -> anyhow::Result<()> {
    bus.kv_set(keys::TOGGLE_MODE, mode.as_str()).await
}

/// Seed unset toggle keys from the engine config defaults so a fresh bus
/// starts in a well-defined state. Existing values are never overwritten.
pub async fn seed_defaults(bus: &dyn MessageBus, config: &EngineConfig) -> ToggleState {
    let auto_trade = match bus.kv_get(keys::TOGGLE_AUTO_TRADE).await {
        Ok(Some(raw)) => parse_flag(&raw).unwrap_or(config.auto_trade),
        _ => {
            if let Err(e) = write_auto_trade(bus, config.auto_trade).await {
                warn!(error = %e, "failed to seed autoTrade toggle");
            }
            config.auto_trade
        }
    };

    let mode = match bus.kv_get(keys::TOGGLE_MODE).await {
        Ok(Some(raw)) => TradeMode::parse(&raw).unwrap_or(config.mode),
        _ => {
            if let Err(e) = write_mode(bus, config.mode).await {
                warn!(error = %e, "failed to seed mode toggle");
            }
            config.mode
        }
    };

    info!(auto_trade, mode = %mode, "toggle store initialised");
    ToggleState { auto_trade, mode }
}

/// Read both toggle keys once, falling back to `last` per key on absence,
/// parse failure, or KV error.
pub async fn read_toggles(bus: &dyn MessageBus, last: ToggleState) -> ToggleState {
    let auto_trade = match bus.kv_get(keys::TOGGLE_AUTO_TRADE).await {
        Ok(Some(raw)) => match parse_flag(&raw) {
            Some(v) => v,
            None => {
                warn!(value = %raw, "unparseable autoTrade toggle — keeping last");
                last.auto_trade
            }
        },
        Ok(None) => last.auto_trade,
        Err(e) => {
            warn!(error = %e, "autoTrade toggle read failed — keeping last");
            last.auto_trade
        }
    };

    let mode = match bus.kv_get(keys::TOGGLE_MODE).await {
        Ok(Some(raw)) => match TradeMode::parse(&raw) {
            Some(m) => m,
            None => {
                warn!(value = %raw, "unparseable mode toggle — keeping last");
                last.mode
            }
        },
        Ok(None) => last.mode,
        Err(e) => {
            warn!(error = %e, "mode toggle read failed — keeping last");
            last.mode
        }
    };

    ToggleState { auto_trade, mode }
}

/// Long-running refresher: polls the toggle keys, updates the cache, and
/// broadcasts state transitions on the watch channel.
pub async fn run_refresher(
    bus: Arc<dyn MessageBus>,
    cache: Arc<ToggleCache>,
    tx: watch::Sender<ToggleState>,
) {
    let mut last = cache.snapshot();
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(TOGGLE_REFRESH_MS)).await;

        let current = read_toggles(bus.as_ref(), last).await;
        if current != last {
            info!(
                auto_trade = current.auto_trade,
                mode = %current.mode,
                was_auto_trade = last.auto_trade,
                "toggle change observed"
            );
            cache.store(current);
            let _ = tx.send(current);
            last = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn flag_synonyms_parse() {
        for raw in ["true", "TRUE", "1", "yes", "On"] {
            assert_eq!(parse_flag(raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[tokio::test]
    async fn seed_writes_only_missing_keys() {
        let bus = MemoryBus::new();
        bus.kv_set(keys::TOGGLE_AUTO_TRADE, "yes").await.unwrap();

        let mut config = EngineConfig::default();
        config.auto_trade = false;
        config.mode = TradeMode::Live;

        let state = seed_defaults(&bus, &config).await;
        // Existing key wins over the config default.
        assert!(state.auto_trade);
        // Missing key is seeded from config.
        assert_eq!(state.mode, TradeMode::Live);
        assert_eq!(
            bus.kv_get(keys::TOGGLE_MODE).await.unwrap().as_deref(),
            Some("live")
        );
        // The pre-existing key is left as written.
        assert_eq!(
            bus.kv_get(keys::TOGGLE_AUTO_TRADE).await.unwrap().as_deref(),
            Some("yes")
        );
    }

    #[tokio::test]
    async fn read_keeps_last_on_garbage() {
        let bus = MemoryBus::new();
        bus.kv_set(keys::TOGGLE_AUTO_TRADE, "banana").await.unwrap();
        let last = ToggleState {
            auto_trade: true,
            mode: TradeMode::Paper,
        };
        let state = read_toggles(&bus, last).await;
        assert!(state.auto_trade);
        assert_eq!(state.mode, TradeMode::Paper);
    }

    #[tokio::test]
    async fn read_picks_up_external_writes() {
        let bus = MemoryBus::new();
        let last = ToggleState {
            auto_trade: true,
            mode: TradeMode::Paper,
        };
        bus.kv_set(keys::TOGGLE_AUTO_TRADE, "off").await.unwrap();
        bus.kv_set(keys::TOGGLE_MODE, "live").await.unwrap();

        let state = read_toggles(&bus, last).await;
        assert!(!state.auto_trade);
        assert_eq!(state.mode, TradeMode::Live);
    }
}
