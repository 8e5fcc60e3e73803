// =============================================================================
// Router-Executor — multi-leg state machine from opportunity to trade
// =============================================================================
//
// Input stream selection follows the autoTrade toggle: `true` consumes the
// pre-risk candidate stream directly, `false` consumes only risk-approved
// entries (the manual review path). Each consumed opportunity gets a fresh
// correlation id and an inflight entry; legs are sent one at a time as IOC
// orders, protective (SELL) leg first, and the entry advances as fills
// come back.
//
//         new opportunity
//               │
//               ▼ send leg[0]
//            wait fill@0 ── filledSize=0 ──► abort (entry removed)
//               │
//               ▼ send leg[1]
//            wait fill@1 ──► PnL > floor ──► emit trade
//
// A toggle falling edge (true→false) flushes the whole inflight table;
// fills that arrive afterwards find no entry and are acked and dropped.
// Orders are never retried: IOC semantics make replay incorrect.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::bus::{groups, streams, MessageBus, READ_RETRY_BACKOFF_MS};
use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::model::{FillMsg, FillPayload, Leg, Opportunity, OrderKind, OrderMsg, OrderPayload, Trade, TradeLeg};
use crate::toggles::{ToggleCache, ToggleState};
use crate::types::{Side, TradeMode, TradeSource};

/// How many entries a single blocking read may return.
const READ_COUNT: usize = 20;
/// Blocking-read deadline; also bounds toggle reaction latency.
const READ_BLOCK_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Protective ordering
// ---------------------------------------------------------------------------

/// Reorder legs so the first SELL leg comes first, keeping the remaining
/// legs in their original order. The short side is tested first: if it does
/// not fill, no resting long exposure has been created.
pub fn protective_first(legs: &[Leg]) -> Vec<Leg> {
    let Some(sell_idx) = legs.iter().position(|l| l.side == Side::Sell) else {
        return legs.to_vec();
    };
    let mut out = Vec::with_capacity(legs.len());
    out.push(legs[sell_idx].clone());
    for (i, leg) in legs.iter().enumerate() {
        if i != sell_idx {
            out.push(leg.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Inflight table
// ---------------------------------------------------------------------------

struct Inflight {
    opportunity: Opportunity,
    /// Protective-first ordering; leg indices on orders and fills refer to
    /// positions in this vec.
    legs: Vec<Leg>,
    fills: Vec<Option<FillPayload>>,
    started_ts: i64,
}

/// Outcome of the synchronous part of fill handling; the async emissions
/// happen after the table lock is released.
enum FillAction {
    Ignore,
    SendNext { corr_id: String, leg: Leg, leg_index: usize, paper: bool },
    EmitTrade { trade_legs: Vec<TradeLeg>, realized_pnl: f64, paper: bool, approved: bool },
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    bus: Arc<dyn MessageBus>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
    toggles: Arc<ToggleCache>,
    app: Arc<AppState>,
    inflight: Mutex<HashMap<String, Inflight>>,
    consumer: String,
}

impl Executor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: Arc<EngineConfig>,
        metrics: Arc<Metrics>,
        toggles: Arc<ToggleCache>,
        app: Arc<AppState>,
    ) -> Self {
        Self {
            bus,
            config,
            metrics,
            toggles,
            app,
            inflight: Mutex::new(HashMap::new()),
            consumer: format!("executor-{}", Uuid::new_v4()),
        }
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    // -------------------------------------------------------------------------
    // Opportunity intake
    // -------------------------------------------------------------------------

    /// Start executing one opportunity: register it inflight under a fresh
    /// correlation id and send the protective leg.
    pub async fn handle_opportunity(&self, opportunity: Opportunity) {
        if opportunity.payload.legs.is_empty() {
            self.metrics.exec_drops.incr("no_legs");
            return;
        }

        let started_ts = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bus clock read failed — dropping opportunity");
                return;
            }
        };

        let corr_id = Uuid::new_v4().to_string();
        let legs = protective_first(&opportunity.payload.legs);
        let first_leg = legs[0].clone();
        let paper = opportunity.payload.paper;

        {
            let mut table = self.inflight.lock();
            table.insert(
                corr_id.clone(),
                Inflight {
                    fills: vec![None; legs.len()],
                    legs,
                    opportunity,
                    started_ts,
                },
            );
        }

        debug!(corr_id = %corr_id, "opportunity registered inflight");
        // A failed send aborts this transition but keeps the entry; the TTL
        // sweep reclaims it.
        self.send_order(&corr_id, 0, &first_leg, paper).await;
    }

    async fn send_order(&self, corr_id: &str, leg_index: usize, leg: &Leg, paper: bool) {
        let ts = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(corr_id = %corr_id, error = %e, "bus clock read failed — order not sent");
                self.metrics.exec_drops.incr("order_write_failed");
                return;
            }
        };

        let order = OrderMsg {
            id: Uuid::new_v4().to_string(),
            ts,
            kind: OrderKind::New,
            payload: OrderPayload {
                corr_id: corr_id.to_string(),
                leg_index,
                tif: "IOC".to_string(),
                exchange: leg.exchange.clone(),
                instrument_id: leg.instrument_id.clone(),
                side: leg.side,
                est_px: leg.est_px,
                size: leg.size,
                mode: Some(TradeMode::from_paper_flag(paper)),
            },
        };

        let data = match serde_json::to_string(&order) {
            Ok(d) => d,
            Err(e) => {
                warn!(corr_id = %corr_id, error = %e, "order serialisation failed");
                self.metrics.exec_drops.incr("order_write_failed");
                return;
            }
        };

        match self.bus.append(streams::ORDERS_NEW, &data).await {
            Ok(_) => {
                self.metrics.orders_emitted.fetch_add(1, Ordering::Relaxed);
                info!(
                    corr_id = %corr_id,
                    leg_index,
                    exchange = %leg.exchange,
                    instrument = %leg.instrument_id,
                    side = %leg.side,
                    px = leg.est_px,
                    size = leg.size,
                    "IOC order sent"
                );
            }
            Err(e) => {
                warn!(corr_id = %corr_id, leg_index, error = %e, "order append failed — no retry");
                self.metrics.exec_drops.incr("order_write_failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fill intake
    // -------------------------------------------------------------------------

    pub async fn handle_fill(&self, fill: FillPayload) {
        match self.apply_fill(fill) {
            FillAction::Ignore => {}
            FillAction::SendNext { corr_id, leg, leg_index, paper } => {
                self.send_order(&corr_id, leg_index, &leg, paper).await;
            }
            FillAction::EmitTrade { trade_legs, realized_pnl, paper, approved } => {
                self.emit_trade(trade_legs, realized_pnl, paper, approved).await;
            }
        }
    }

    /// Synchronous state transition under the table lock.
    fn apply_fill(&self, fill: FillPayload) -> FillAction {
        let mut table = self.inflight.lock();

        let corr_id = fill.corr_id.clone();
        let Some(entry) = table.get_mut(&corr_id) else {
            // Expected race after a toggle flush: ack and drop.
            self.metrics.exec_drops.incr("unknown_corr");
            return FillAction::Ignore;
        };

        let idx = fill.leg_index;
        if idx >= entry.legs.len() {
            self.metrics.exec_drops.incr("bad_leg_index");
            return FillAction::Ignore;
        }
        if entry.fills[idx].is_some() {
            self.metrics.exec_drops.incr("duplicate_fill");
            return FillAction::Ignore;
        }
        entry.fills[idx] = Some(fill.clone());

        // Zero fill on the protective leg: abort, nothing resting.
        if idx == 0 && fill.filled_size <= 0.0 {
            table.remove(&corr_id);
            self.metrics.exec_drops.incr("zero_fill_abort");
            debug!(corr_id = %corr_id, "protective leg did not fill — aborted");
            return FillAction::Ignore;
        }

        if idx + 1 < entry.legs.len() {
            let leg = entry.legs[idx + 1].clone();
            let paper = entry.opportunity.payload.paper;
            return FillAction::SendNext {
                corr_id,
                leg,
                leg_index: idx + 1,
                paper,
            };
        }

        // Terminal leg: settle the entry.
        let Some(entry) = table.remove(&corr_id) else {
            return FillAction::Ignore;
        };
        let fills: Vec<FillPayload> = entry.fills.into_iter().flatten().collect();
        let realized_pnl = realized_pnl(&entry.opportunity, &fills);
        if realized_pnl <= self.config.min_realized_pnl {
            self.metrics.exec_drops.incr("pnl_below_floor");
            debug!(corr_id = %corr_id, realized_pnl, "trade discarded below PnL floor");
            return FillAction::Ignore;
        }

        FillAction::EmitTrade {
            trade_legs: fills.iter().map(TradeLeg::from).collect(),
            realized_pnl,
            paper: entry.opportunity.payload.paper,
            approved: entry.opportunity.is_approved(),
        }
    }

    async fn emit_trade(
        &self,
        trade_legs: Vec<TradeLeg>,
        realized_pnl: f64,
        paper: bool,
        approved: bool,
    ) {
        let ts = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bus clock read failed — trade not emitted");
                return;
            }
        };

        let trade = Trade {
            ts,
            mode: TradeMode::from_paper_flag(paper),
            legs: trade_legs,
            realized_pnl,
            taken: true,
            approved,
            source: TradeSource::Executor,
        };

        match serde_json::to_string(&trade) {
            Ok(data) => match self.bus.append(streams::TRADES, &data).await {
                Ok(_) => {
                    self.metrics.trades_executor.fetch_add(1, Ordering::Relaxed);
                    self.app.push_trade(trade);
                    info!(realized_pnl, mode = %TradeMode::from_paper_flag(paper), "trade emitted");
                }
                Err(e) => warn!(error = %e, "trade append failed — dropped"),
            },
            Err(e) => warn!(error = %e, "trade serialisation failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Flush & eviction
    // -------------------------------------------------------------------------

    /// Drop every inflight entry. Called on the autoTrade falling edge so a
    /// paused engine never tracks half-opened positions.
    pub fn flush_inflight(&self) {
        let mut table = self.inflight.lock();
        let dropped = table.len();
        table.clear();
        if dropped > 0 {
            info!(dropped, "inflight table flushed on toggle edge");
        }
    }

    /// Evict entries whose first fill never arrived within the TTL.
    pub fn evict_expired(&self, now_ms: i64) {
        let ttl = self.config.inflight_ttl_ms;
        let mut table = self.inflight.lock();
        let before = table.len();
        table.retain(|corr_id, entry| {
            let keep = now_ms - entry.started_ts <= ttl;
            if !keep {
                warn!(corr_id = %corr_id, "inflight entry expired — abandoned");
            }
            keep
        });
        let evicted = (before - table.len()) as u64;
        if evicted > 0 {
            self.metrics.inflight_expired.fetch_add(evicted, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// PnL
// ---------------------------------------------------------------------------

/// Realized PnL at trade emission. Prices come from fills; the midpoint
/// used for absolute costs comes from the opportunity's own estimates.
fn realized_pnl(opportunity: &Opportunity, fills: &[FillPayload]) -> f64 {
    let gross: f64 = fills.iter().map(|f| f.side.sign() * f.px * f.filled_size).sum();
    let qty: f64 = fills.iter().map(|f| f.filled_size).sum();

    let fees_abs = opportunity
        .payload
        .costs
        .as_ref()
        .map(|c| c.fees + c.slippage + c.borrow)
        .unwrap_or(0.0);

    let total_fees = match opportunity.payload.est_mid() {
        Some(mid) if qty > 0.0 => fees_abs * qty * mid,
        _ => 0.0,
    };

    gross - total_fees
}

// ---------------------------------------------------------------------------
// Consumer loops
// ---------------------------------------------------------------------------

/// Consume opportunities from the toggle-selected input stream.
pub async fn run_opportunity_loop(executor: Arc<Executor>) {
    loop {
        let stream = if executor.toggles.auto_trade() {
            streams::OPPORTUNITIES
        } else {
            streams::APPROVED
        };

        let entries = match executor
            .bus
            .read_group(stream, groups::EXECUTOR, &executor.consumer, READ_COUNT, READ_BLOCK_MS)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(stream = %stream, error = %e, "opportunity read failed — backing off");
                tokio::time::sleep(tokio::time::Duration::from_millis(READ_RETRY_BACKOFF_MS)).await;
                continue;
            }
        };

        for entry in entries {
            // The toggle may have flipped while this batch was blocked on
            // the old stream selection; entries read under a stale
            // selection are acked and dropped without emitting legs.
            let selection_stale = executor.toggles.auto_trade() != (stream == streams::OPPORTUNITIES);
            if selection_stale {
                executor.metrics.exec_drops.incr("toggle_raced");
            } else {
                match serde_json::from_str::<Opportunity>(&entry.data) {
                    Ok(opportunity) => executor.handle_opportunity(opportunity).await,
                    Err(e) => {
                        executor.metrics.exec_drops.incr("parse_error");
                        warn!(stream = %stream, error = %e, "unparseable opportunity — acked and dropped");
                    }
                }
            }
            if let Err(e) = executor.bus.ack(stream, groups::EXECUTOR, &entry.id).await {
                warn!(stream = %stream, error = %e, "ack failed");
            }
        }
    }
}

/// Consume fills and drive the state machines; also runs the TTL sweep.
pub async fn run_fill_loop(executor: Arc<Executor>) {
    loop {
        let entries = match executor
            .bus
            .read_group(
                streams::ORDERS_FILLS,
                groups::EXECUTOR,
                &executor.consumer,
                READ_COUNT,
                READ_BLOCK_MS,
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
                Ok(fill) => executor.handle_fill(fill.payload).await,
                Err(e) => {
                    executor.metrics.exec_drops.incr("parse_error");
                    warn!(error = %e, "unparseable fill — acked and dropped");
                }
            }
            if let Err(e) = executor
                .bus
                .ack(streams::ORDERS_FILLS, groups::EXECUTOR, &entry.id)
                .await
            {
                warn!(error = %e, "ack failed");
            }
        }

        if let Ok(now) = executor.bus.now_ms().await {
            executor.evict_expired(now);
        }
    }
}

/// React to toggle transitions: the autoTrade falling edge flushes inflight.
pub async fn run_toggle_watcher(executor: Arc<Executor>, mut rx: watch::Receiver<ToggleState>) {
    let mut last_auto = rx.borrow().auto_trade;
    while rx.changed().await.is_ok() {
        let now_auto = rx.borrow().auto_trade;
        if last_auto && !now_auto {
            info!("autoTrade disabled — flushing inflight work");
            executor.flush_inflight();
        }
        last_auto = now_auto;
    }
}
