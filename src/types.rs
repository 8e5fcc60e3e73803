// =============================================================================
// Shared types used across the Meridian arb engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a single trade leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// Sign convention used in PnL arithmetic: SELL adds, BUY subtracts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Sell => 1.0,
            Self::Buy => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Whether a trade was produced against simulated or real venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    #[serde(rename = "paper")]
    Paper,
    #[serde(rename = "live")]
    Live,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl TradeMode {
    pub fn from_paper_flag(paper: bool) -> Self {
        if paper {
            Self::Paper
        } else {
            Self::Live
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }

    /// Parse the canonical toggle-store string. Unknown values yield `None`
    /// so the caller can keep its last-known value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Some(Self::Paper),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which component emitted a trade. The dashboard filters on `Executor`;
/// accounting consumes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    #[serde(rename = "executor")]
    Executor,
    #[serde(rename = "assembler")]
    Assembler,
}

impl std::fmt::Display for TradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executor => write!(f, "executor"),
            Self::Assembler => write!(f, "assembler"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
        let s: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn side_sign_convention() {
        assert_eq!(Side::Sell.sign(), 1.0);
        assert_eq!(Side::Buy.sign(), -1.0);
    }

    #[test]
    fn trade_mode_from_paper_flag() {
        assert_eq!(TradeMode::from_paper_flag(true), TradeMode::Paper);
        assert_eq!(TradeMode::from_paper_flag(false), TradeMode::Live);
    }

    #[test]
    fn trade_mode_parse_is_case_insensitive() {
        assert_eq!(TradeMode::parse("PAPER"), Some(TradeMode::Paper));
        assert_eq!(TradeMode::parse(" live "), Some(TradeMode::Live));
        assert_eq!(TradeMode::parse("shadow"), None);
    }
}
