// =============================================================================
// Pipeline Metrics — lock-free counters with labeled reason maps
// =============================================================================
//
// Failures in this engine never propagate across component boundaries; they
// become counters and logs. These counters are the observable surface the
// ops API serves. Exposition format is a downstream concern.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Labeled counter map, e.g. `drops_total{reason=...}`.
#[derive(Default)]
pub struct ReasonCounter {
    counts: RwLock<HashMap<&'static str, u64>>,
}

impl ReasonCounter {
    pub fn incr(&self, reason: &'static str) {
        *self.counts.write().entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: &str) -> u64 {
        self.counts.read().get(reason).copied().unwrap_or(0)
    }

    fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}

/// All pipeline counters. Shared as `Arc<Metrics>` across every component.
#[derive(Default)]
pub struct Metrics {
    pub opportunities_emitted: AtomicU64,
    pub orders_emitted: AtomicU64,
    pub fills_emitted: AtomicU64,
    pub trades_executor: AtomicU64,
    pub trades_assembler: AtomicU64,
    pub risk_approved: AtomicU64,
    pub inflight_expired: AtomicU64,
    pub pending_expired: AtomicU64,

    /// Scanner drop reasons: stale_book, missing_quote, quote_parse,
    /// below_threshold, rate_limited, empty_universe.
    pub scan_drops: ReasonCounter,
    /// Risk rejection reasons per the policy table.
    pub risk_rejects: ReasonCounter,
    /// Executor drop reasons: parse_error, unknown_corr, zero_fill_abort,
    /// pnl_below_floor, order_write_failed.
    pub exec_drops: ReasonCounter,
}

/// Serialisable snapshot for the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub opportunities_emitted: u64,
    pub orders_emitted: u64,
    pub fills_emitted: u64,
    pub trades_executor: u64,
    pub trades_assembler: u64,
    pub risk_approved: u64,
    pub inflight_expired: u64,
    pub pending_expired: u64,
    pub scan_drops: HashMap<String, u64>,
    pub risk_rejects: HashMap<String, u64>,
    pub exec_drops: HashMap<String, u64>,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            opportunities_emitted: self.opportunities_emitted.load(Ordering::Relaxed),
            orders_emitted: self.orders_emitted.load(Ordering::Relaxed),
            fills_emitted: self.fills_emitted.load(Ordering::Relaxed),
            trades_executor: self.trades_executor.load(Ordering::Relaxed),
            trades_assembler: self.trades_assembler.load(Ordering::Relaxed),
            risk_approved: self.risk_approved.load(Ordering::Relaxed),
            inflight_expired: self.inflight_expired.load(Ordering::Relaxed),
            pending_expired: self.pending_expired.load(Ordering::Relaxed),
            scan_drops: self.scan_drops.snapshot(),
            risk_rejects: self.risk_rejects.snapshot(),
            exec_drops: self.exec_drops.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_counter_accumulates_per_label() {
        let c = ReasonCounter::default();
        c.incr("stale_book");
        c.incr("stale_book");
        c.incr("missing_quote");
        assert_eq!(c.get("stale_book"), 2);
        assert_eq!(c.get("missing_quote"), 1);
        assert_eq!(c.get("never_seen"), 0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::default();
        m.orders_emitted.fetch_add(3, Ordering::Relaxed);
        m.risk_rejects.incr("edge_below_threshold");
        let snap = m.snapshot();
        assert_eq!(snap.orders_emitted, 3);
        assert_eq!(snap.risk_rejects["edge_below_threshold"], 1);
    }
}
