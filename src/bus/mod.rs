// =============================================================================
// Message Bus — append-only streams + consumer groups + key-value view
// =============================================================================
//
// The bus is the only inter-process shared state. The trait hides the
// stream / group / ack / wall-clock operations so the backing log store is
// replaceable: `RedisBus` in deployment, `MemoryBus` in tests and
// standalone runs.
//
// Delivery contract: within a consumer group each entry is delivered to
// exactly one consumer until acknowledged; acknowledgement happens exactly
// once per consumed entry, including for entries that fail to parse.
// =============================================================================

pub mod memory;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

// ---------------------------------------------------------------------------
// Stream / group / key names
// ---------------------------------------------------------------------------

pub mod streams {
    /// Candidate opportunities (pre-risk path).
    pub const OPPORTUNITIES: &str = "arb.opportunities";
    /// Scanner output consumed by the risk engine.
    pub const SCANNER_TO_RISK: &str = "scanner.to.risk";
    /// Risk-approved opportunities.
    pub const APPROVED: &str = "arb.approved";
    /// Orders from the executor to the venue (simulator).
    pub const ORDERS_NEW: &str = "orders.new";
    /// Fills from the venue back to the executor and assembler.
    pub const ORDERS_FILLS: &str = "orders.fills";
    /// Completed trades.
    pub const TRADES: &str = "arb.trades";
}

pub mod groups {
    pub const RISK: &str = "risk";
    pub const EXECUTOR: &str = "executor";
    pub const SIM: &str = "sim";
    pub const ASM: &str = "asm";
}

pub mod keys {
    pub const TOGGLE_AUTO_TRADE: &str = "toggles:autoTrade";
    pub const TOGGLE_MODE: &str = "toggles:mode";

    pub fn quote(venue: &str, instrument_id: &str) -> String {
        format!("quote:{venue}:{instrument_id}")
    }

    pub fn symbols(venue: &str) -> String {
        format!("meta:{venue}:symbols")
    }
}

/// The single field name every stream entry stores its JSON under.
pub const DATA_FIELD: &str = "data";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One delivered stream entry: the bus-assigned id plus the `data` JSON.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub data: String,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Milliseconds since epoch from the bus backend's wall-clock. All
    /// producer `ts` fields must come from here, never from the host clock.
    async fn now_ms(&self) -> Result<i64>;

    /// Append one entry to a stream, returning the assigned entry id.
    async fn append(&self, stream: &str, data: &str) -> Result<String>;

    /// Idempotently create a consumer group (MKSTREAM semantics). Creating
    /// a group that already exists is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Blocking group read: up to `count` undelivered entries, waiting at
    /// most `block_ms`. Returns an empty vec on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge one delivered entry.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    // --- Key-value view -----------------------------------------------------

    async fn kv_get(&self, key: &str) -> Result<Option<String>>;

    async fn kv_mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a TTL in seconds (adapter-owned keys like quotes use this).
    async fn kv_set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
}

/// Backoff applied by consumer loops after a transient bus read failure.
pub const READ_RETRY_BACKOFF_MS: u64 = 300;
