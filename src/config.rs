// =============================================================================
// Engine Configuration — file defaults with environment overrides
// =============================================================================
//
// Every tunable of the pipeline lives here. Values come from three layers,
// lowest priority first: compiled defaults, an optional JSON config file,
// and environment variables named exactly after the recognized options
// (SCAN_INTERVAL_MS, RISK_EDGE_MIN_BPS, ...). All fields carry
// `#[serde(default)]` so an older config file never breaks loading.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradeMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_scan_interval_ms() -> u64 {
    500
}

fn default_max_symbols() -> usize {
    50
}

fn default_discover_every_sec() -> u64 {
    60
}

fn default_min_gross_bps() -> f64 {
    10.0
}

fn default_min_net_bps() -> f64 {
    2.0
}

fn default_max_book_age_ms() -> i64 {
    5_000
}

fn default_emit_rate_per_sec() -> f64 {
    5.0
}

fn default_emit_burst() -> f64 {
    10.0
}

fn default_taker_bps() -> f64 {
    10.0
}

fn default_leg_size() -> f64 {
    1.0
}

fn default_venues() -> Vec<String> {
    vec!["binance".to_string(), "bybit".to_string()]
}

fn default_risk_edge_min_bps() -> f64 {
    20.0
}

fn default_risk_net_min_bps() -> f64 {
    5.0
}

fn default_risk_max_total_size() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_inflight_ttl_ms() -> i64 {
    30_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_journal_path() -> String {
    "trades.jsonl".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine. Immutable after startup;
/// runtime behaviour switches (auto-trade, paper/live) live in the toggle
/// store on the bus instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Scanner -------------------------------------------------------------

    /// Scanner tick period in milliseconds.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Cap on the discovered instrument universe.
    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,

    /// How often the symbol universe is re-derived from the adapters' meta
    /// keys, in seconds.
    #[serde(default = "default_discover_every_sec")]
    pub discover_every_sec: u64,

    /// Minimum gross edge (bps, inclusive) for admission.
    #[serde(default = "default_min_gross_bps")]
    pub min_gross_bps: f64,

    /// Minimum net edge (bps, inclusive) after fee-like costs.
    #[serde(default = "default_min_net_bps")]
    pub min_net_bps: f64,

    /// Minimum absolute spread (quote currency).
    #[serde(default)]
    pub min_abs_spread: f64,

    /// Minimum midpoint for the pair to be worth trading.
    #[serde(default)]
    pub min_notional: f64,

    /// Quotes older than this (against the bus clock) are stale. The
    /// boundary itself is still fresh; only strictly older is dropped.
    #[serde(default = "default_max_book_age_ms")]
    pub max_book_age_ms: i64,

    /// Token-bucket refill rate for opportunity emission.
    #[serde(default = "default_emit_rate_per_sec")]
    pub emit_rate_per_sec: f64,

    /// Token-bucket capacity (burst size).
    #[serde(default = "default_emit_burst")]
    pub emit_burst: f64,

    /// Taker fee per venue in bps, keyed by lowercase venue name. Venues
    /// without an entry fall back to `default_taker_bps`.
    #[serde(default)]
    pub taker_bps: HashMap<String, f64>,

    /// Fallback taker fee in bps.
    #[serde(default = "default_taker_bps")]
    pub default_taker_bps: f64,

    /// Size stamped on each emitted leg.
    #[serde(default = "default_leg_size")]
    pub leg_size: f64,

    /// The two venues scanned against each other.
    #[serde(default = "default_venues")]
    pub venues: Vec<String>,

    // --- Risk policy ----------------------------------------------------------

    #[serde(default = "default_risk_edge_min_bps")]
    pub risk_edge_min_bps: f64,

    #[serde(default = "default_risk_net_min_bps")]
    pub risk_net_min_bps: f64,

    #[serde(default = "default_risk_max_total_size")]
    pub risk_max_total_size: f64,

    /// Require one BUY and one SELL leg before approval.
    #[serde(default = "default_true")]
    pub risk_require_both_sides: bool,

    /// When false, paper-mode opportunities are rejected. The counter-
    /// intuitive polarity is inherited configuration surface; do not flip it.
    #[serde(default = "default_true")]
    pub risk_allow_paper_only: bool,

    // --- Executor --------------------------------------------------------------

    /// A trade is emitted only when realized PnL strictly exceeds this.
    #[serde(default)]
    pub min_realized_pnl: f64,

    /// Inflight/pending entries older than this are evicted; protects the
    /// tables when a fill never arrives.
    #[serde(default = "default_inflight_ttl_ms")]
    pub inflight_ttl_ms: i64,

    // --- Toggle defaults (used only to seed unset store keys) ------------------

    #[serde(default)]
    pub auto_trade: bool,

    #[serde(default)]
    pub mode: TradeMode,

    // --- Infrastructure ---------------------------------------------------------

    /// Bus backend. `memory` selects the in-process bus (standalone runs);
    /// anything else is treated as a Redis URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Append-only JSONL file the assembler persists trades to.
    #[serde(default = "default_journal_path")]
    pub trade_journal_path: String,

    /// Ops API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            max_symbols: default_max_symbols(),
            discover_every_sec: default_discover_every_sec(),
            min_gross_bps: default_min_gross_bps(),
            min_net_bps: default_min_net_bps(),
            min_abs_spread: 0.0,
            min_notional: 0.0,
            max_book_age_ms: default_max_book_age_ms(),
            emit_rate_per_sec: default_emit_rate_per_sec(),
            emit_burst: default_emit_burst(),
            taker_bps: HashMap::new(),
            default_taker_bps: default_taker_bps(),
            leg_size: default_leg_size(),
            venues: default_venues(),
            risk_edge_min_bps: default_risk_edge_min_bps(),
            risk_net_min_bps: default_risk_net_min_bps(),
            risk_max_total_size: default_risk_max_total_size(),
            risk_require_both_sides: true,
            risk_allow_paper_only: true,
            min_realized_pnl: 0.0,
            inflight_ttl_ms: default_inflight_ttl_ms(),
            auto_trade: false,
            mode: TradeMode::default(),
            redis_url: default_redis_url(),
            trade_journal_path: default_journal_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: optional JSON file, then environment overrides.
    ///
    /// A missing file is not an error — defaults apply and the env layer
    /// still runs on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?;
            info!(path = %path.display(), "engine config loaded from file");
            config
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Taker fee for a venue in bps (case-insensitive lookup).
    pub fn taker_bps_for(&self, venue: &str) -> f64 {
        self.taker_bps
            .get(&venue.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_taker_bps)
    }

    /// Apply the recognized environment options over the current values.
    pub fn apply_env_overrides(&mut self) {
        env_override(&mut self.scan_interval_ms, "SCAN_INTERVAL_MS");
        env_override(&mut self.max_symbols, "MAX_SYMBOLS");
        env_override(&mut self.discover_every_sec, "DISCOVER_EVERY_SEC");
        env_override(&mut self.min_gross_bps, "MIN_GROSS_BPS");
        env_override(&mut self.min_net_bps, "MIN_NET_BPS");
        env_override(&mut self.min_abs_spread, "MIN_ABS_SPREAD");
        env_override(&mut self.min_notional, "MIN_NOTIONAL");
        env_override(&mut self.max_book_age_ms, "MAX_BOOK_AGE_MS");
        env_override(&mut self.emit_rate_per_sec, "EMIT_RATE_PER_SEC");
        env_override(&mut self.emit_burst, "EMIT_BURST");
        env_override(&mut self.leg_size, "LEG_SIZE");
        env_override(&mut self.risk_edge_min_bps, "RISK_EDGE_MIN_BPS");
        env_override(&mut self.risk_net_min_bps, "RISK_NET_MIN_BPS");
        env_override(&mut self.risk_max_total_size, "RISK_MAX_TOTAL_SIZE");
        env_override(&mut self.risk_require_both_sides, "RISK_REQUIRE_BOTH_SIDES");
        env_override(&mut self.risk_allow_paper_only, "RISK_ALLOW_PAPER_ONLY");
        env_override(&mut self.min_realized_pnl, "MIN_REALIZED_PNL");
        env_override(&mut self.inflight_ttl_ms, "INFLIGHT_TTL_MS");
        env_override(&mut self.auto_trade, "AUTO_TRADE");

        if let Ok(raw) = std::env::var("MODE") {
            match TradeMode::parse(&raw) {
                Some(mode) => self.mode = mode,
                None => warn!(value = %raw, "MODE is not 'paper' or 'live' — keeping current"),
            }
        }

        if let Ok(raw) = std::env::var("VENUES") {
            let venues: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if venues.len() >= 2 {
                self.venues = venues;
            } else {
                warn!(value = %raw, "VENUES needs at least two entries — keeping current");
            }
        }

        // Per-venue taker fees: <VENUE>_TAKER_BPS, e.g. BINANCE_TAKER_BPS=7.5
        for venue in self.venues.clone() {
            let key = format!("{}_TAKER_BPS", venue.to_ascii_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                match raw.parse::<f64>() {
                    Ok(bps) => {
                        self.taker_bps.insert(venue.clone(), bps);
                    }
                    Err(_) => warn!(var = %key, value = %raw, "unparseable taker bps — ignoring"),
                }
            }
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(path) = std::env::var("TRADE_JOURNAL_PATH") {
            self.trade_journal_path = path;
        }
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }
}

/// Overwrite `slot` from the environment variable `key` when set and
/// parseable; otherwise leave it alone (with a warning on parse failure).
fn env_override<T: FromStr>(slot: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = %key, value = %raw, "unparseable env override — ignoring"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.scan_interval_ms, 500);
        assert_eq!(cfg.max_symbols, 50);
        assert_eq!(cfg.venues, vec!["binance", "bybit"]);
        assert!((cfg.min_gross_bps - 10.0).abs() < f64::EPSILON);
        assert!((cfg.emit_burst - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_book_age_ms, 5_000);
        assert_eq!(cfg.inflight_ttl_ms, 30_000);
        assert!(!cfg.auto_trade);
        assert_eq!(cfg.mode, TradeMode::Paper);
        assert!(cfg.risk_require_both_sides);
        assert!(cfg.risk_allow_paper_only);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.scan_interval_ms, 500);
        assert_eq!(cfg.trade_journal_path, "trades.jsonl");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "scan_interval_ms": 250, "venues": ["okx", "deribit"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.scan_interval_ms, 250);
        assert_eq!(cfg.venues, vec!["okx", "deribit"]);
        assert_eq!(cfg.discover_every_sec, 60);
    }

    #[test]
    fn taker_bps_lookup_falls_back() {
        let mut cfg = EngineConfig::default();
        cfg.taker_bps.insert("binance".to_string(), 7.5);
        assert!((cfg.taker_bps_for("BINANCE") - 7.5).abs() < f64::EPSILON);
        assert!((cfg.taker_bps_for("bybit") - cfg.default_taker_bps).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.venues, cfg2.venues);
        assert_eq!(cfg.scan_interval_ms, cfg2.scan_interval_ms);
        assert_eq!(cfg.mode, cfg2.mode);
    }
}
