// =============================================================================
// Bus message schema — typed payloads for every stream
// =============================================================================
//
// Each stream carries JSON in a single `data` field. The schemas here are
// explicit tagged types per stream; unknown `type` tags fail at parse time
// rather than flowing through as duck-shaped values.
//
// All `ts` fields are milliseconds since epoch read from the bus wall-clock,
// so staleness checks survive clock skew between processes.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Side, TradeMode, TradeSource};

// ---------------------------------------------------------------------------
// Quote view
// ---------------------------------------------------------------------------

/// Top-of-book snapshot written by the market-data adapters to
/// `quote:<venue>:<instrumentId>`. Read-only to this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub bid: f64,
    pub ask: f64,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// One side of a multi-venue round trip. Immutable inside an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leg {
    pub exchange: String,
    pub instrument_id: String,
    pub side: Side,
    pub est_px: f64,
    #[serde(default)]
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_bps: Option<f64>,
}

/// Optional absolute cost fractions attached by the scanner (each a plain
/// fraction, not bps).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Costs {
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub slippage: f64,
    #[serde(default)]
    pub borrow: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityPayload {
    pub paper: bool,
    pub edge_bps: f64,
    pub legs: Vec<Leg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub costs: Option<Costs>,
}

/// Values the risk engine stamps onto an approved opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskBlock {
    pub net_bps: f64,
    pub total_fees_like_bps: f64,
    pub edge_min_bps: f64,
    pub net_min_bps: f64,
    pub max_total_size: f64,
}

/// Candidate (or approved) arbitrage opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskBlock>,
    pub payload: OpportunityPayload,
}

impl Opportunity {
    /// `approved` may be absent on the pre-risk stream; absent means false.
    pub fn is_approved(&self) -> bool {
        self.approved.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Order / Fill
// ---------------------------------------------------------------------------

/// Tag for order messages. A single variant today; the enum exists so an
/// unknown tag is rejected during deserialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    #[serde(rename = "order.new")]
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    #[serde(rename = "order.fill")]
    Fill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub corr_id: String,
    pub leg_index: usize,
    /// Always IOC in this engine; unfilled remainder cancels immediately.
    pub tif: String,
    pub exchange: String,
    pub instrument_id: String,
    pub side: Side,
    pub est_px: f64,
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TradeMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMsg {
    pub id: String,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: OrderKind,
    pub payload: OrderPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillPayload {
    pub corr_id: String,
    pub leg_index: usize,
    pub exchange: String,
    pub instrument_id: String,
    pub side: Side,
    pub px: f64,
    pub requested_size: f64,
    pub filled_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TradeMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMsg {
    pub id: String,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: FillKind,
    pub payload: FillPayload,
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// One executed leg as recorded on a trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLeg {
    pub exchange: String,
    pub instrument_id: String,
    pub side: Side,
    pub px: f64,
    pub filled_size: f64,
}

impl From<&FillPayload> for TradeLeg {
    fn from(f: &FillPayload) -> Self {
        Self {
            exchange: f.exchange.clone(),
            instrument_id: f.instrument_id.clone(),
            side: f.side,
            px: f.px,
            filled_size: f.filled_size,
        }
    }
}

/// Completed round trip emitted on `arb.trades` and persisted to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub ts: i64,
    pub mode: TradeMode,
    pub legs: Vec<TradeLeg>,
    pub realized_pnl: f64,
    pub taken: bool,
    pub approved: bool,
    pub source: TradeSource,
}

// ---------------------------------------------------------------------------
// Edge math
// ---------------------------------------------------------------------------

/// Midpoint of the round trip used as the bps denominator.
pub fn mid_px(buy_px: f64, sell_px: f64) -> f64 {
    (buy_px + sell_px) / 2.0
}

/// Gross edge in basis points: `(sell − buy) / mid × 10_000`.
pub fn gross_bps(buy_px: f64, sell_px: f64) -> f64 {
    let mid = mid_px(buy_px, sell_px);
    if mid <= 0.0 {
        return 0.0;
    }
    (sell_px - buy_px) / mid * 10_000.0
}

impl OpportunityPayload {
    /// Fee-like costs in bps: the per-leg `feeBps` sum when any leg carries
    /// one, otherwise the `costs` fractions converted to bps.
    pub fn fees_like_bps(&self) -> f64 {
        let leg_fees: f64 = self.legs.iter().filter_map(|l| l.fee_bps).sum();
        let any_leg_fee = self.legs.iter().any(|l| l.fee_bps.is_some());

        let (fees_bps, slippage_bps, borrow_bps) = match &self.costs {
            Some(c) => (c.fees * 10_000.0, c.slippage * 10_000.0, c.borrow * 10_000.0),
            None => (0.0, 0.0, 0.0),
        };

        let base = if any_leg_fee { leg_fees } else { fees_bps };
        base + slippage_bps + borrow_bps
    }

    /// Net edge after fee-like costs, relative to `edgeBps` (the gross edge
    /// stamped at scan time).
    pub fn net_bps(&self) -> f64 {
        self.edge_bps - self.fees_like_bps()
    }

    pub fn buy_leg(&self) -> Option<&Leg> {
        self.legs.iter().find(|l| l.side == Side::Buy)
    }

    pub fn sell_leg(&self) -> Option<&Leg> {
        self.legs.iter().find(|l| l.side == Side::Sell)
    }

    /// Estimated midpoint from the opportunity's own legs (not from fills).
    pub fn est_mid(&self) -> Option<f64> {
        match (self.buy_leg(), self.sell_leg()) {
            (Some(b), Some(s)) => Some(mid_px(b.est_px, s.est_px)),
            _ => None,
        }
    }
}
