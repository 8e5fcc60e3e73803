// =============================================================================
// Scanner — cross-venue edge detection over the quote view
// =============================================================================
//
// Every tick the scanner batch-reads the top-of-book for its instrument
// universe from the bus KV, computes both directional round trips per
// instrument, and appends qualifying opportunities to the bus. Nothing in
// the tick aborts the loop: parse failures, missing sides, stale books and
// an absent universe all become drop counters.
//
// The universe is the intersection of the two venues' advertised symbol
// lists, matched on canonical instrument ids so that venues using
// different option encodings still pair up. Quotes are read under each
// venue's native id; emitted opportunities carry the canonical id.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{keys, streams, MessageBus};
use crate::config::EngineConfig;
use crate::instruments::canonicalize;
use crate::metrics::Metrics;
use crate::model::{gross_bps, mid_px, Leg, Opportunity, OpportunityPayload, QuoteSnapshot};
use crate::toggles::ToggleCache;
use crate::types::{Side, TradeMode};

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Emission rate limiter: `(capacity, tokensPerSec)` with a timestamped
/// refill. Drops are silent and counted by the caller, never queued.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64, now_ms: i64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec,
            last_refill_ms: now_ms,
        }
    }

    /// Take one token if available. Non-blocking.
    pub fn try_take(&mut self, now_ms: i64) -> bool {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0);
        self.tokens = (self.tokens + elapsed_ms as f64 / 1000.0 * self.rate_per_sec)
            .min(self.capacity);
        self.last_refill_ms = now_ms;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Universe
// ---------------------------------------------------------------------------

/// One instrument tradable on both venues: the canonical id plus each
/// venue's native id for quote lookups.
#[derive(Debug, Clone)]
struct UniverseEntry {
    canonical: String,
    native_a: String,
    native_b: String,
}

/// A directional round trip: buy at one venue's ask, sell at the other's bid.
struct DirectionalPath<'a> {
    buy_venue: &'a str,
    buy_native: &'a str,
    buy_px: f64,
    sell_venue: &'a str,
    sell_native: &'a str,
    sell_px: f64,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    bus: Arc<dyn MessageBus>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
    toggles: Arc<ToggleCache>,
    universe: Vec<UniverseEntry>,
    last_discover_ms: Option<i64>,
    limiter: TokenBucket,
}

impl Scanner {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: Arc<EngineConfig>,
        metrics: Arc<Metrics>,
        toggles: Arc<ToggleCache>,
    ) -> Self {
        let limiter = TokenBucket::new(config.emit_burst, config.emit_rate_per_sec, 0);
        Self {
            bus,
            config,
            metrics,
            toggles,
            universe: Vec::new(),
            last_discover_ms: None,
            limiter,
        }
    }

    /// Fixed-cadence scan loop. Bus failures inside a tick are logged and
    /// the next tick proceeds normally.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.scan_interval_ms,
            venues = ?self.config.venues,
            "scanner starting"
        );
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(self.config.scan_interval_ms));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One scan pass. Public so the tests can drive it tick by tick.
    pub async fn tick(&mut self) {
        if self.config.venues.len() < 2 {
            warn!("scanner needs two venues configured — idle");
            return;
        }
        let t_now = match self.bus.now_ms().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "bus clock read failed — skipping tick");
                return;
            }
        };

        self.maybe_discover(t_now).await;
        if self.universe.is_empty() {
            return;
        }

        let venue_a = self.config.venues[0].clone();
        let venue_b = self.config.venues[1].clone();

        // Single multi-get for every quote key in the universe.
        let mut quote_keys = Vec::with_capacity(self.universe.len() * 2);
        for entry in &self.universe {
            quote_keys.push(keys::quote(&venue_a, &entry.native_a));
            quote_keys.push(keys::quote(&venue_b, &entry.native_b));
        }
        let values = match self.bus.kv_mget(&quote_keys).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "quote multi-get failed — skipping tick");
                return;
            }
        };

        let universe = self.universe.clone();
        for (i, entry) in universe.iter().enumerate() {
            let raw_a = values.get(i * 2).cloned().flatten();
            let raw_b = values.get(i * 2 + 1).cloned().flatten();
            self.evaluate_symbol(t_now, &venue_a, &venue_b, entry, raw_a, raw_b)
                .await;
        }
    }

    // -------------------------------------------------------------------------
    // Universe discovery
    // -------------------------------------------------------------------------

    async fn maybe_discover(&mut self, t_now: i64) {
        let due = match self.last_discover_ms {
            None => true,
            Some(last) => t_now - last >= (self.config.discover_every_sec as i64) * 1000,
        };
        if !due {
            return;
        }
        self.last_discover_ms = Some(t_now);

        let venue_a = &self.config.venues[0];
        let venue_b = &self.config.venues[1];
        let symbols_a = self.read_symbols(venue_a).await;
        let symbols_b = self.read_symbols(venue_b).await;

        if symbols_a.is_empty() || symbols_b.is_empty() {
            self.metrics.scan_drops.incr("empty_universe");
            self.universe.clear();
            debug!(
                venue_a = %venue_a,
                venue_b = %venue_b,
                "one side has no symbols — universe empty"
            );
            return;
        }

        // canonical id -> native id, first native wins per venue
        let mut map_a: HashMap<String, String> = HashMap::new();
        for s in symbols_a {
            map_a.entry(canonicalize(&s)).or_insert(s);
        }
        let mut map_b: HashMap<String, String> = HashMap::new();
        for s in symbols_b {
            map_b.entry(canonicalize(&s)).or_insert(s);
        }

        let mut universe: Vec<UniverseEntry> = map_a
            .into_iter()
            .filter_map(|(canonical, native_a)| {
                map_b.get(&canonical).map(|native_b| UniverseEntry {
                    canonical,
                    native_a,
                    native_b: native_b.clone(),
                })
            })
            .collect();
        universe.sort_by(|x, y| x.canonical.cmp(&y.canonical));
        universe.truncate(self.config.max_symbols);

        info!(size = universe.len(), "instrument universe refreshed");
        self.universe = universe;
    }

    async fn read_symbols(&self, venue: &str) -> Vec<String> {
        match self.bus.kv_get(&keys::symbols(venue)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(list) => list,
                Err(e) => {
                    warn!(venue = %venue, error = %e, "symbol list parse failed");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(venue = %venue, error = %e, "symbol list read failed");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-symbol evaluation
    // -------------------------------------------------------------------------

    async fn evaluate_symbol(
        &mut self,
        t_now: i64,
        venue_a: &str,
        venue_b: &str,
        entry: &UniverseEntry,
        raw_a: Option<String>,
        raw_b: Option<String>,
    ) {
        let (raw_a, raw_b) = match (raw_a, raw_b) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                self.metrics.scan_drops.incr("missing_quote");
                return;
            }
        };

        let (q_a, q_b) = match (
            serde_json::from_str::<QuoteSnapshot>(&raw_a),
            serde_json::from_str::<QuoteSnapshot>(&raw_b),
        ) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                self.metrics.scan_drops.incr("quote_parse");
                return;
            }
        };

        if q_a.bid <= 0.0 || q_a.ask <= 0.0 || q_b.bid <= 0.0 || q_b.ask <= 0.0 {
            self.metrics.scan_drops.incr("missing_quote");
            return;
        }

        // Strictly older than the cap is stale; the boundary itself passes.
        let oldest_age = (t_now - q_a.ts).max(t_now - q_b.ts);
        if oldest_age > self.config.max_book_age_ms {
            self.metrics.scan_drops.incr("stale_book");
            return;
        }

        let paths = [
            // Path A: buy on venue A at its ask, sell on venue B at its bid.
            DirectionalPath {
                buy_venue: venue_a,
                buy_native: &entry.native_a,
                buy_px: q_a.ask,
                sell_venue: venue_b,
                sell_native: &entry.native_b,
                sell_px: q_b.bid,
            },
            // Path B: the reverse direction.
            DirectionalPath {
                buy_venue: venue_b,
                buy_native: &entry.native_b,
                buy_px: q_b.ask,
                sell_venue: venue_a,
                sell_native: &entry.native_a,
                sell_px: q_a.bid,
            },
        ];

        for path in paths {
            self.evaluate_path(t_now, &entry.canonical, &path).await;
        }
    }

    async fn evaluate_path(&mut self, t_now: i64, canonical: &str, path: &DirectionalPath<'_>) {
        let gross = gross_bps(path.buy_px, path.sell_px);
        let fees = self.config.taker_bps_for(path.buy_venue)
            + self.config.taker_bps_for(path.sell_venue);
        let net = gross - fees;
        let abs = path.sell_px - path.buy_px;
        let mid = mid_px(path.buy_px, path.sell_px);

        let admitted = gross >= self.config.min_gross_bps
            && net >= self.config.min_net_bps
            && abs >= self.config.min_abs_spread
            && mid >= self.config.min_notional;
        if !admitted {
            self.metrics.scan_drops.incr("below_threshold");
            return;
        }

        if !self.limiter.try_take(t_now) {
            self.metrics.scan_drops.incr("rate_limited");
            return;
        }

        let paper = self.toggles.mode() == TradeMode::Paper;
        let opportunity = Opportunity {
            id: Uuid::new_v4().to_string(),
            ts: t_now,
            approved: None,
            risk: None,
            payload: OpportunityPayload {
                paper,
                edge_bps: gross,
                legs: vec![
                    Leg {
                        exchange: path.buy_venue.to_string(),
                        instrument_id: canonical.to_string(),
                        side: Side::Buy,
                        est_px: path.buy_px,
                        size: self.config.leg_size,
                        fee_bps: Some(self.config.taker_bps_for(path.buy_venue)),
                    },
                    Leg {
                        exchange: path.sell_venue.to_string(),
                        instrument_id: canonical.to_string(),
                        side: Side::Sell,
                        est_px: path.sell_px,
                        size: self.config.leg_size,
                        fee_bps: Some(self.config.taker_bps_for(path.sell_venue)),
                    },
                ],
                costs: None,
            },
        };

        let data = match serde_json::to_string(&opportunity) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "opportunity serialisation failed");
                return;
            }
        };

        debug!(
            instrument = %canonical,
            buy_venue = %path.buy_venue,
            buy_native = %path.buy_native,
            sell_venue = %path.sell_venue,
            sell_native = %path.sell_native,
            gross_bps = gross,
            net_bps = net,
            "opportunity admitted"
        );

        // Dual emission: the executor's pre-risk path and the risk engine's
        // input both carry every candidate.
        let mut appended = false;
        for stream in [streams::OPPORTUNITIES, streams::SCANNER_TO_RISK] {
            match self.bus.append(stream, &data).await {
                Ok(_) => appended = true,
                Err(e) => warn!(stream = %stream, error = %e, "opportunity append failed"),
            }
        }
        if appended {
            self.metrics
                .opportunities_emitted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
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
    use crate::toggles::ToggleState;

    const T0: i64 = 1_710_000_000_000;

    async fn write_quote(bus: &MemoryBus, venue: &str, native: &str, bid: f64, ask: f64, ts: i64) {
        let snap = serde_json::json!({ "bid": bid, "ask": ask, "ts": ts });
        bus.kv_set(&keys::quote(venue, native), &snap.to_string())
            .await
            .unwrap();
    }

    async fn write_symbols(bus: &MemoryBus, venue: &str, symbols: &[&str]) {
        let raw = serde_json::to_string(symbols).unwrap();
        bus.kv_set(&keys::symbols(venue), &raw).await.unwrap();
    }

    fn scanner_with(bus: Arc<MemoryBus>, mut mutate: impl FnMut(&mut EngineConfig)) -> Scanner {
        let mut config = EngineConfig::default();
        config.min_gross_bps = 10.0;
        config.min_net_bps = 0.0;
        config.default_taker_bps = 0.0;
        config.max_book_age_ms = 5_000;
        mutate(&mut config);
        let toggles = Arc::new(ToggleCache::new(ToggleState {
            auto_trade: false,
            mode: TradeMode::Paper,
        }));
        Scanner::new(bus, Arc::new(config), Arc::new(Metrics::default()), toggles)
    }

    fn opportunities_on(bus: &MemoryBus, stream: &str) -> Vec<Opportunity> {
        bus.stream_entries(stream)
            .iter()
            .map(|e| serde_json::from_str(&e.data).unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_on_qualifying_spread_to_both_streams() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus, "bybit", &["BTCUSDT"]).await;
        // binance ask 100, bybit bid 101 -> path A earns ~99.5 bps
        write_quote(&bus, "binance", "BTCUSDT", 99.5, 100.0, T0).await;
        write_quote(&bus, "bybit", "BTCUSDT", 101.0, 101.5, T0).await;

        let mut scanner = scanner_with(bus.clone(), |_| {});
        scanner.tick().await;

        let candidates = opportunities_on(&bus, streams::OPPORTUNITIES);
        assert_eq!(candidates.len(), 1);
        let opp = &candidates[0];
        assert!(opp.payload.paper);
        assert_eq!(opp.ts, T0);
        assert_eq!(opp.payload.legs.len(), 2);
        assert_eq!(opp.payload.legs[0].side, Side::Buy);
        assert_eq!(opp.payload.legs[0].exchange, "binance");
        assert_eq!(opp.payload.legs[0].est_px, 100.0);
        assert_eq!(opp.payload.legs[1].side, Side::Sell);
        assert_eq!(opp.payload.legs[1].est_px, 101.0);

        // Same candidate also lands on the risk input stream.
        assert_eq!(opportunities_on(&bus, streams::SCANNER_TO_RISK).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn path_symmetry_on_swapped_venues() {
        // Same two books assigned to opposite venues must produce the same
        // |grossBps| via the mirrored path.
        let bus1 = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus1, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus1, "bybit", &["BTCUSDT"]).await;
        write_quote(&bus1, "binance", "BTCUSDT", 99.5, 100.0, T0).await;
        write_quote(&bus1, "bybit", "BTCUSDT", 101.0, 101.5, T0).await;
        let mut s1 = scanner_with(bus1.clone(), |_| {});
        s1.tick().await;

        let bus2 = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus2, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus2, "bybit", &["BTCUSDT"]).await;
        write_quote(&bus2, "bybit", "BTCUSDT", 99.5, 100.0, T0).await;
        write_quote(&bus2, "binance", "BTCUSDT", 101.0, 101.5, T0).await;
        let mut s2 = scanner_with(bus2.clone(), |_| {});
        s2.tick().await;

        let o1 = opportunities_on(&bus1, streams::OPPORTUNITIES);
        let o2 = opportunities_on(&bus2, streams::OPPORTUNITIES);
        assert_eq!(o1.len(), 1);
        assert_eq!(o2.len(), 1);
        assert!((o1[0].payload.edge_bps - o2[0].payload.edge_bps).abs() < 1e-9);
        // Mirrored direction: buy venue flips.
        assert_eq!(o1[0].payload.legs[0].exchange, "binance");
        assert_eq!(o2[0].payload.legs[0].exchange, "bybit");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_quote_is_dropped_and_counted() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus, "bybit", &["BTCUSDT"]).await;
        write_quote(&bus, "binance", "BTCUSDT", 99.5, 100.0, T0).await;
        // One quote aged exactly one past the cap.
        write_quote(&bus, "bybit", "BTCUSDT", 101.0, 101.5, T0 - 5_001).await;

        let mut scanner = scanner_with(bus.clone(), |_| {});
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 0);
        assert_eq!(scanner.metrics.scan_drops.get("stale_book"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn age_exactly_at_cap_is_fresh() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus, "bybit", &["BTCUSDT"]).await;
        write_quote(&bus, "binance", "BTCUSDT", 99.5, 100.0, T0 - 5_000).await;
        write_quote(&bus, "bybit", "BTCUSDT", 101.0, 101.5, T0).await;

        let mut scanner = scanner_with(bus.clone(), |_| {});
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 1);
        assert_eq!(scanner.metrics.scan_drops.get("stale_book"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edge_exactly_at_min_gross_admits() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus, "bybit", &["BTCUSDT"]).await;
        // Pin the admission threshold to the exact computed gross so the
        // inclusive >= boundary is what decides.
        let buy = 100.0;
        let sell = 100.2;
        let exact_gross = crate::model::gross_bps(buy, sell);
        write_quote(&bus, "binance", "BTCUSDT", buy - 0.5, buy, T0).await;
        write_quote(&bus, "bybit", "BTCUSDT", sell, sell + 0.5, T0).await;

        let mut scanner = scanner_with(bus.clone(), |c| c.min_gross_bps = exact_gross);
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn below_threshold_spread_is_not_emitted() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        write_symbols(&bus, "bybit", &["BTCUSDT"]).await;
        // Books in line: no edge either way.
        write_quote(&bus, "binance", "BTCUSDT", 99.9, 100.0, T0).await;
        write_quote(&bus, "bybit", "BTCUSDT", 99.9, 100.0, T0).await;

        let mut scanner = scanner_with(bus.clone(), |_| {});
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 0);
        assert!(scanner.metrics.scan_drops.get("below_threshold") >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_universe_side_does_no_work() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        write_symbols(&bus, "binance", &["BTCUSDT"]).await;
        // bybit never advertises symbols.

        let mut scanner = scanner_with(bus.clone(), |_| {});
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 0);
        assert_eq!(scanner.metrics.scan_drops.get("empty_universe"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn option_universe_intersects_on_canonical_id() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        // Venue A uses YYMMDD, venue B uses DDMMMYY: same contract.
        write_symbols(&bus, "binance", &["BTC-240927-19000-C"]).await;
        write_symbols(&bus, "bybit", &["BTC-27SEP24-19000-C"]).await;
        write_quote(&bus, "binance", "BTC-240927-19000-C", 0.049, 0.05, T0).await;
        write_quote(&bus, "bybit", "BTC-27SEP24-19000-C", 0.056, 0.057, T0).await;

        let mut scanner = scanner_with(bus.clone(), |c| {
            c.min_abs_spread = 0.0;
            c.min_notional = 0.0;
        });
        scanner.tick().await;

        let opps = opportunities_on(&bus, streams::OPPORTUNITIES);
        assert_eq!(opps.len(), 1);
        // Emitted instrument id is canonical, regardless of native encodings.
        assert_eq!(opps[0].payload.legs[0].instrument_id, "BTC-2024-09-27-19000-C");
        assert_eq!(opps[0].payload.legs[1].instrument_id, "BTC-2024-09-27-19000-C");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rate_limiter_caps_burst() {
        let bus = Arc::new(MemoryBus::with_manual_clock(T0));
        let symbols: Vec<String> = (0..5).map(|i| format!("SYM{i}USDT")).collect();
        let refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        write_symbols(&bus, "binance", &refs).await;
        write_symbols(&bus, "bybit", &refs).await;
        for s in &symbols {
            write_quote(&bus, "binance", s, 99.5, 100.0, T0).await;
            write_quote(&bus, "bybit", s, 101.0, 101.5, T0).await;
        }

        let mut scanner = scanner_with(bus.clone(), |c| {
            c.emit_burst = 2.0;
            c.emit_rate_per_sec = 0.0;
        });
        scanner.limiter = TokenBucket::new(2.0, 0.0, T0);
        scanner.tick().await;

        assert_eq!(bus.stream_len(streams::OPPORTUNITIES), 2);
        assert_eq!(scanner.metrics.scan_drops.get("rate_limited"), 3);
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(2.0, 1.0, 0);
        assert!(bucket.try_take(0));
        assert!(bucket.try_take(0));
        assert!(!bucket.try_take(0));
        // One second refills one token.
        assert!(bucket.try_take(1_000));
        assert!(!bucket.try_take(1_000));
        // Refill never exceeds capacity.
        assert!(bucket.try_take(100_000));
        assert!(bucket.try_take(100_000));
        assert!(!bucket.try_take(100_000));
    }
}
