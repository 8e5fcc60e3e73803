// =============================================================================
// Central Application State — Meridian Arb Nexus
// =============================================================================
//
// Ties the shared pieces together for the ops API: configuration, pipeline
// counters, the toggle cache, and a bounded ring of recently emitted
// trades. Subsystems hold Arc references and manage their own interior
// mutability; nothing here sits on a consumer hot path.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::Trade;
use crate::toggles::{ToggleCache, ToggleState};

/// Maximum number of recent trades retained for the dashboard.
const MAX_RECENT_TRADES: usize = 100;

pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<Metrics>,
    pub toggles: Arc<ToggleCache>,

    /// Most recent trades, newest last. Bounded ring for the ops API; the
    /// journal is the durable record.
    pub recent_trades: RwLock<Vec<Trade>>,

    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation.
    pub state_version: AtomicU64,

    /// Engine start instant, for uptime reporting.
    pub start_time: std::time::Instant,
}

/// Serialisable snapshot served by `/api/v1/state`.
#[derive(Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub uptime_secs: u64,
    pub toggles: ToggleState,
    pub config: EngineConfig,
    pub metrics: MetricsSnapshot,
    pub recent_trades: Vec<Trade>,
}

impl AppState {
    pub fn new(config: Arc<EngineConfig>, metrics: Arc<Metrics>, toggles: Arc<ToggleCache>) -> Self {
        Self {
            config,
            metrics,
            toggles,
            recent_trades: RwLock::new(Vec::new()),
            state_version: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    /// Record an emitted trade in the bounded ring.
    pub fn push_trade(&self, trade: Trade) {
        let mut trades = self.recent_trades.write();
        trades.push(trade);
        let overflow = trades.len().saturating_sub(MAX_RECENT_TRADES);
        if overflow > 0 {
            trades.drain(0..overflow);
        }
        drop(trades);
        self.increment_version();
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            toggles: self.toggles.snapshot(),
            config: (*self.config).clone(),
            metrics: self.metrics.snapshot(),
            recent_trades: self.recent_trades.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TradeMode, TradeSource};

    fn state() -> AppState {
        let config = Arc::new(EngineConfig::default());
        let metrics = Arc::new(Metrics::default());
        let toggles = Arc::new(ToggleCache::new(ToggleState {
            auto_trade: false,
            mode: TradeMode::Paper,
        }));
        AppState::new(config, metrics, toggles)
    }

    fn trade(pnl: f64) -> Trade {
        Trade {
            ts: 1,
            mode: TradeMode::Paper,
            legs: vec![],
            realized_pnl: pnl,
            taken: true,
            approved: false,
            source: TradeSource::Executor,
        }
    }

    #[test]
    fn push_trade_bumps_version_and_bounds_ring() {
        let state = state();
        for i in 0..150 {
            state.push_trade(trade(i as f64));
        }
        let trades = state.recent_trades.read();
        assert_eq!(trades.len(), 100);
        // Oldest entries were dropped, newest kept.
        assert_eq!(trades.last().unwrap().realized_pnl, 149.0);
        assert_eq!(trades.first().unwrap().realized_pnl, 50.0);
        drop(trades);
        assert_eq!(state.current_state_version(), 150);
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let state = state();
        state.push_trade(trade(2.5));
        let snap = state.build_snapshot();
        assert_eq!(snap.recent_trades.len(), 1);
        assert_eq!(snap.toggles.mode, TradeMode::Paper);
        assert_eq!(snap.state_version, 1);
    }
}
