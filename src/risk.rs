// =============================================================================
// Risk Engine — policy gate between candidate and approved opportunities
// =============================================================================
//
// Checks, in order (first failure wins, tagged for the rejection counter):
//   1. paper mode allowed by configuration      -> paper_mode_not_allowed
//   2. both a BUY and a SELL leg exist          -> missing_side
//   3. total size under the cap (when supplied) -> size_exceeds_cap
//   4. gross edge at or above the minimum       -> edge_below_threshold
//   5. net edge at or above the minimum         -> net_below_threshold
//
// Approved opportunities are re-published verbatim (unknown fields
// preserved) with `approved=true` and a `risk` block recording the
// computed numbers and the active policy values. Every consumed entry is
// acknowledged whether approved, rejected, or unparseable.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{groups, streams, MessageBus, READ_RETRY_BACKOFF_MS};
use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::model::{Opportunity, RiskBlock};
use crate::types::Side;

/// BLOCK / COUNT parameters pinned by the consumer contract.
const READ_COUNT: usize = 50;
const READ_BLOCK_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approve {
        net_bps: f64,
        total_fees_like_bps: f64,
    },
    Reject(&'static str),
}

/// The policy values, copied out of the engine config at startup.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    pub edge_min_bps: f64,
    pub net_min_bps: f64,
    pub max_total_size: f64,
    pub require_both_sides: bool,
    pub allow_paper: bool,
}

impl RiskPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            edge_min_bps: config.risk_edge_min_bps,
            net_min_bps: config.risk_net_min_bps,
            max_total_size: config.risk_max_total_size,
            require_both_sides: config.risk_require_both_sides,
            allow_paper: config.risk_allow_paper_only,
        }
    }

    /// Evaluate one opportunity against the policy.
    pub fn evaluate(&self, opportunity: &Opportunity) -> RiskDecision {
        let payload = &opportunity.payload;

        if payload.paper && !self.allow_paper {
            return RiskDecision::Reject("paper_mode_not_allowed");
        }

        if self.require_both_sides {
            let has_buy = payload.legs.iter().any(|l| l.side == Side::Buy);
            let has_sell = payload.legs.iter().any(|l| l.side == Side::Sell);
            if !has_buy || !has_sell {
                return RiskDecision::Reject("missing_side");
            }
        }

        let total_size: f64 = payload.legs.iter().map(|l| l.size).sum();
        if total_size > 0.0 && total_size > self.max_total_size {
            return RiskDecision::Reject("size_exceeds_cap");
        }

        if payload.edge_bps < self.edge_min_bps {
            return RiskDecision::Reject("edge_below_threshold");
        }

        let total_fees_like_bps = payload.fees_like_bps();
        let net_bps = payload.net_bps();
        if net_bps < self.net_min_bps {
            return RiskDecision::Reject("net_below_threshold");
        }

        RiskDecision::Approve {
            net_bps,
            total_fees_like_bps,
        }
    }

    fn risk_block(&self, net_bps: f64, total_fees_like_bps: f64) -> RiskBlock {
        RiskBlock {
            net_bps,
            total_fees_like_bps,
            edge_min_bps: self.edge_min_bps,
            net_min_bps: self.net_min_bps,
            max_total_size: self.max_total_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Approved re-emission
// ---------------------------------------------------------------------------

/// Stamp `approved=true` and the risk block onto the raw entry JSON. Works
/// on the raw value so fields this engine does not model survive verbatim.
fn stamp_approval(raw: &str, block: &RiskBlock) -> anyhow::Result<String> {
    let mut value: serde_json::Value = serde_json::from_str(raw)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("opportunity is not a JSON object"))?;
    obj.insert("approved".to_string(), serde_json::Value::Bool(true));
    obj.insert("risk".to_string(), serde_json::to_value(block)?);
    Ok(value.to_string())
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

pub async fn run_risk_loop(
    bus: Arc<dyn MessageBus>,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
) {
    let policy = RiskPolicy::from_config(&config);
    let consumer = format!("risk-{}", Uuid::new_v4());
    info!(
        edge_min_bps = policy.edge_min_bps,
        net_min_bps = policy.net_min_bps,
        max_total_size = policy.max_total_size,
        allow_paper = policy.allow_paper,
        "risk engine starting"
    );

    loop {
        let entries = match bus
            .read_group(
                streams::SCANNER_TO_RISK,
                groups::RISK,
                &consumer,
                READ_COUNT,
                READ_BLOCK_MS,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "candidate read failed — backing off");
                tokio::time::sleep(tokio::time::Duration::from_millis(READ_RETRY_BACKOFF_MS)).await;
                continue;
            }
        };

        for entry in entries {
            process_entry(bus.as_ref(), &policy, &metrics, &entry.data).await;
            // Ack whatever the outcome — rejections and poison messages
            // must never block the group.
            if let Err(e) = bus.ack(streams::SCANNER_TO_RISK, groups::RISK, &entry.id).await {
                warn!(error = %e, "ack failed");
            }
        }
    }
}

async fn process_entry(
    bus: &dyn MessageBus,
    policy: &RiskPolicy,
    metrics: &Metrics,
    raw: &str,
) {
    let opportunity: Opportunity = match serde_json::from_str(raw) {
        Ok(o) => o,
        Err(e) => {
            metrics.risk_rejects.incr("parse_error");
            warn!(error = %e, "unparseable candidate — acked and dropped");
            return;
        }
    };

    match policy.evaluate(&opportunity) {
        RiskDecision::Approve {
            net_bps,
            total_fees_like_bps,
        } => {
            let block = policy.risk_block(net_bps, total_fees_like_bps);
            match stamp_approval(raw, &block) {
                Ok(data) => match bus.append(streams::APPROVED, &data).await {
                    Ok(_) => {
                        metrics.risk_approved.fetch_add(1, Ordering::Relaxed);
                        debug!(id = %opportunity.id, net_bps, "opportunity approved");
                    }
                    Err(e) => warn!(id = %opportunity.id, error = %e, "approved append failed — dropped"),
                },
                Err(e) => warn!(id = %opportunity.id, error = %e, "approval stamping failed"),
            }
        }
        RiskDecision::Reject(reason) => {
            metrics.risk_rejects.incr(reason);
            debug!(id = %opportunity.id, reason, "opportunity rejected");
        }
    }
}
