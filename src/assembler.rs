// =============================================================================
// Trade Assembler — independent fill-join path
// =============================================================================
//
// A second consumer of the fill stream that reconstructs trades purely by
// correlation id, with no knowledge of the executor's state machine. Fills
// may arrive in any order. Once a correlation id has both a BUY and a SELL
// fill, a trade is emitted, persisted to the journal, and the pending
// entry is discarded. This path applies no PnL floor: it is the unfiltered
// record downstream accounting consumes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::bus::{groups, streams, MessageBus, READ_RETRY_BACKOFF_MS};
use crate::config::EngineConfig;
use crate::journal::TradeJournal;
use crate::metrics::Metrics;
use crate::model::{FillMsg, FillPayload, Trade, TradeLeg};
use crate::types::{Side, TradeMode, TradeSource};

struct Pending {
    legs: Vec<FillPayload>,
    first_seen_ts: i64,
    mode: TradeMode,
}

pub struct Assembler {
    bus: Arc<dyn MessageBus>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
    app: Arc<AppState>,
    journal: Arc<TradeJournal>,
    pending: Mutex<HashMap<String, Pending>>,
    consumer: String,
}

impl Assembler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: Arc<EngineConfig>,
        metrics: Arc<Metrics>,
        app: Arc<AppState>,
        journal: Arc<TradeJournal>,
    ) -> Self {
        Self {
            bus,
            config,
            metrics,
            app,
            journal,
            pending: Mutex::new(HashMap::new()),
            consumer: format!("asm-{}", Uuid::new_v4()),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Record one fill; returns the completed trade data when the pending
    /// set now holds both sides.
    fn apply_fill(&self, fill: FillPayload, now_ms: i64) -> Option<(Vec<TradeLeg>, f64, TradeMode)> {
        let mut pending = self.pending.lock();
        let corr_id = fill.corr_id.clone();

        let entry = pending.entry(corr_id.clone()).or_insert_with(|| Pending {
            legs: Vec::new(),
            first_seen_ts: now_ms,
            mode: fill.mode.unwrap_or_default(),
        });
        entry.legs.push(fill);

        if entry.legs.len() < 2 {
            return None;
        }
        // Arrival order is not guaranteed; look the sides up.
        let buy = entry.legs.iter().find(|l| l.side == Side::Buy);
        let sell = entry.legs.iter().find(|l| l.side == Side::Sell);
        let (Some(buy), Some(sell)) = (buy, sell) else {
            return None;
        };

        let size = buy.filled_size.min(sell.filled_size);
        let pnl = (sell.px - buy.px) * size;
        let trade_legs: Vec<TradeLeg> = entry.legs.iter().map(TradeLeg::from).collect();
        let mode = entry.mode;

        pending.remove(&corr_id);
        debug!(corr_id = %corr_id, pnl, "fill pair joined");
        Some((trade_legs, pnl, mode))
    }

    async fn emit_trade(&self, trade_legs: Vec<TradeLeg>, realized_pnl: f64, mode: TradeMode) {
        let ts = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bus clock read failed — trade not emitted");
                return;
            }
        };

        let trade = Trade {
            ts,
            mode,
            legs: trade_legs,
            realized_pnl,
            taken: false,
            approved: false,
            source: TradeSource::Assembler,
        };

        self.journal.append(&trade);
        match serde_json::to_string(&trade) {
            Ok(data) => match self.bus.append(streams::TRADES, &data).await {
                Ok(_) => {
                    self.metrics.trades_assembler.fetch_add(1, Ordering::Relaxed);
                    self.app.push_trade(trade);
                    info!(realized_pnl, "assembled trade emitted");
                }
                Err(e) => warn!(error = %e, "trade append failed — dropped"),
            },
            Err(e) => warn!(error = %e, "trade serialisation failed"),
        }
    }

    pub async fn handle_fill(&self, fill: FillPayload) {
        let now_ms = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bus clock read failed — fill dropped");
                return;
            }
        };
        if let Some((legs, pnl, mode)) = self.apply_fill(fill, now_ms) {
            self.emit_trade(legs, pnl, mode).await;
        }
    }

    /// Evict pending entries whose counterpart fill never arrived.
    pub fn evict_expired(&self, now_ms: i64) {
        let ttl = self.config.inflight_ttl_ms;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|corr_id, entry| {
            let keep = now_ms - entry.first_seen_ts <= ttl;
            if !keep {
                warn!(corr_id = %corr_id, "pending fills expired — discarded");
            }
            keep
        });
        let evicted = (before - pending.len()) as u64;
        if evicted > 0 {
            self.metrics.pending_expired.fetch_add(evicted, Ordering::Relaxed);
        }
    }
}

/// Consumer loop over the fill stream, group `asm`. Every fill is acked
/// after processing regardless of join outcome.
pub async fn run_assembler_loop(assembler: Arc<Assembler>) {
    loop {
        let entries = match assembler
            .bus
            .read_group(
                streams::ORDERS_FILLS,
                groups::ASM,
                &assembler.consumer,
                50,
                1000,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "fill read failed — backing off");
                tokio::time::sleep(tokio::time::Duration::from_millis(READ_RETRY_BACKOFF_MS)).await;
                continue;
            }
        };

        for entry in entries {
            match serde_json::from_str::<FillMsg>(&entry.data) {
                Ok(fill) => assembler.handle_fill(fill.payload).await,
                Err(e) => {
                    warn!(error = %e, "unparseable fill — acked and dropped");
                }
            }
            if let Err(e) = assembler
                .bus
                .ack(streams::ORDERS_FILLS, groups::ASM, &entry.id)
                .await
            {
                warn!(error = %e, "ack failed");
            }
        }

        if let Ok(now) = assembler.bus.now_ms().await {
            assembler.evict_expired(now);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::toggles::{ToggleCache, ToggleState};

    const T0: i64 = 1_710_000_000_000;

    fn fill(corr: &str, leg_index: usize, side: Side, px: f64, filled: f64) -> FillPayload {
        FillPayload {
            corr_id: corr.to_string(),
            leg_index,
            exchange: "binance".to_string(),
            instrument_id: "BTCUSDT".to_string(),
            side,
            px,
            requested_size: filled.max(1.0),
            filled_size: filled,
            mode: Some(TradeMode::Paper),
        }
    }

    fn assembler_on(bus: Arc<MemoryBus>) -> (Assembler, Arc<AppState>) {
        let config = Arc::new(EngineConfig::default());
        let metrics = Arc::new(Metrics::default());
        let toggles = Arc::new(ToggleCache::new(ToggleState {
            auto_trade: false,
            mode: TradeMode::Paper,
        }));
        let app = Arc::new(AppState::new(config.clone(), metrics.clone(), toggles));
        let dir = std::env::temp_dir().join(format!("meridian-asm-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = Arc::new(TradeJournal::new(dir.join("trades.jsonl")));
        (
            Assembler::new(bus, config, metrics, app.clone(), journal),
            app,
        )
    }

    fn trades_on(bus: &MemoryBus) -> Vec<Trade> {
        bus.stream_entries(streams::TRADES)
            .iter()
            .map(|e| serde_json::from_str(&e.data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn joins_buy_sell_pair_into_unfiltered_trade() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, app) = assembler_on(bus.clone());

        assembler.handle_fill(fill("corr-1", 0, Side::Sell, 101.0, 1.0)).await;
        assert_eq!(bus.stream_len(streams::TRADES), 0);
        assembler.handle_fill(fill("corr-1", 1, Side::Buy, 100.0, 1.0)).await;

        let trades = trades_on(&bus);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.realized_pnl, 1.0);
        assert_eq!(t.source, TradeSource::Assembler);
        assert!(!t.taken);
        assert_eq!(t.mode, TradeMode::Paper);
        assert_eq!(t.legs.len(), 2);
        assert_eq!(assembler.pending_len(), 0);
        assert_eq!(app.recent_trades.read().len(), 1);
    }

    #[tokio::test]
    async fn tolerates_either_arrival_order() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, _) = assembler_on(bus.clone());

        // BUY first this time.
        assembler.handle_fill(fill("corr-2", 1, Side::Buy, 100.0, 1.0)).await;
        assembler.handle_fill(fill("corr-2", 0, Side::Sell, 101.0, 1.0)).await;

        let trades = trades_on(&bus);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].realized_pnl, 1.0);
    }

    #[tokio::test]
    async fn pnl_uses_min_filled_size() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, _) = assembler_on(bus.clone());

        assembler.handle_fill(fill("corr-3", 0, Side::Sell, 102.0, 0.4)).await;
        assembler.handle_fill(fill("corr-3", 1, Side::Buy, 100.0, 1.0)).await;

        let trades = trades_on(&bus);
        assert_eq!(trades.len(), 1);
        assert!((trades[0].realized_pnl - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn negative_pnl_is_still_emitted() {
        // No positivity filter on this path.
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, _) = assembler_on(bus.clone());

        assembler.handle_fill(fill("corr-4", 0, Side::Sell, 99.0, 1.0)).await;
        assembler.handle_fill(fill("corr-4", 1, Side::Buy, 100.0, 1.0)).await;

        let trades = trades_on(&bus);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].realized_pnl, -1.0);
    }

    #[tokio::test]
    async fn same_side_fills_stay_pending() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, _) = assembler_on(bus.clone());

        assembler.handle_fill(fill("corr-5", 0, Side::Buy, 100.0, 1.0)).await;
        assembler.handle_fill(fill("corr-5", 1, Side::Buy, 100.5, 1.0)).await;

        assert_eq!(bus.stream_len(streams::TRADES), 0);
        assert_eq!(assembler.pending_len(), 1);
    }

    #[tokio::test]
    async fn expired_pending_entries_are_evicted() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let (assembler, _) = assembler_on(bus.clone());

        assembler.handle_fill(fill("corr-6", 0, Side::Sell, 101.0, 1.0)).await;
        assert_eq!(assembler.pending_len(), 1);

        let ttl = assembler.config.inflight_ttl_ms;
        assembler.evict_expired(T0 + ttl + 1);
        assert_eq!(assembler.pending_len(), 0);
        assert_eq!(assembler.metrics.pending_expired.load(Ordering::Relaxed), 1);

        // A late counterpart finds nothing and stays pending alone.
        assembler.handle_fill(fill("corr-6", 1, Side::Buy, 100.0, 1.0)).await;
        assert_eq!(bus.stream_len(streams::TRADES), 0);
    }
}
