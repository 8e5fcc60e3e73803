// =============================================================================
// Order Simulator — deterministic stand-in venue
// =============================================================================
//
// Consumes IOC orders and answers each with exactly one full fill at the
// order's estimated price. No liquidity model: the point is to make the
// executor's state machine exercisable end to end. At most one fill is
// ever produced per (corrId, legIndex) because each order is consumed
// exactly once by the `sim` group.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{groups, streams, MessageBus, READ_RETRY_BACKOFF_MS};
use crate::metrics::Metrics;
use crate::model::{FillKind, FillMsg, FillPayload, OrderMsg};

/// Build the full fill answering one order.
pub fn fill_for(order: &OrderMsg, id: String, ts: i64) -> FillMsg {
    let p = &order.payload;
    FillMsg {
        id,
        ts,
        kind: FillKind::Fill,
        payload: FillPayload {
            corr_id: p.corr_id.clone(),
            leg_index: p.leg_index,
            exchange: p.exchange.clone(),
            instrument_id: p.instrument_id.clone(),
            side: p.side,
            px: p.est_px,
            requested_size: p.size,
            filled_size: p.size,
            mode: p.mode,
        },
    }
}

/// Consumer loop: one fill per order, ack always.
pub async fn run_sim_loop(bus: Arc<dyn MessageBus>, metrics: Arc<Metrics>) {
    let consumer = format!("sim-{}", Uuid::new_v4());
    loop {
        let entries = match bus
            .read_group(streams::ORDERS_NEW, groups::SIM, &consumer, 50, 1000)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "order read failed — backing off");
                tokio::time::sleep(tokio::time::Duration::from_millis(READ_RETRY_BACKOFF_MS)).await;
                continue;
            }
        };

        for entry in entries {
            match serde_json::from_str::<OrderMsg>(&entry.data) {
                Ok(order) => {
                    let ts = match bus.now_ms().await {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "bus clock read failed — order skipped");
                            // Still ack below; the order is consumed either way.
                            order.ts
                        }
                    };
                    let fill = fill_for(&order, Uuid::new_v4().to_string(), ts);
                    match serde_json::to_string(&fill) {
                        Ok(data) => match bus.append(streams::ORDERS_FILLS, &data).await {
                            Ok(_) => {
                                metrics.fills_emitted.fetch_add(1, Ordering::Relaxed);
                                debug!(
                                    corr_id = %fill.payload.corr_id,
                                    leg_index = fill.payload.leg_index,
                                    px = fill.payload.px,
                                    size = fill.payload.filled_size,
                                    "fill emitted"
                                );
                            }
                            Err(e) => warn!(error = %e, "fill append failed — dropped"),
                        },
                        Err(e) => warn!(error = %e, "fill serialisation failed"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "unparseable order — acked and dropped");
                }
            }
            if let Err(e) = bus.ack(streams::ORDERS_NEW, groups::SIM, &entry.id).await {
                warn!(error = %e, "ack failed");
            }
        }
    }
}
