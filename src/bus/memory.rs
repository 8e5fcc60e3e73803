// =============================================================================
// MemoryBus — in-process Redis-Streams-shaped store
// =============================================================================
//
// Used by the test suite and by standalone runs (`REDIS_URL=memory`).
// Implements the same contract as the Redis backend: per-group exclusive
// delivery with pending-until-ack, KV with TTL, and a wall-clock that the
// tests can pin and advance manually to exercise staleness and TTL paths.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MessageBus, StreamEntry};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Stream {
    /// Append order is entry order; ids are `<seq>-0`.
    entries: Vec<(String, String)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Index of the next entry not yet delivered to this group.
    cursor: usize,
    /// Delivered-but-unacknowledged entry ids.
    pending: HashMap<String, usize>,
}

struct KvEntry {
    value: String,
    expires_at_ms: Option<i64>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    kv: HashMap<String, KvEntry>,
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

pub struct MemoryBus {
    inner: Mutex<Inner>,
    /// Manual clock value; negative means "use the host clock".
    clock_ms: AtomicI64,
}

impl MemoryBus {
    /// Bus with a real wall-clock.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock_ms: AtomicI64::new(-1),
        }
    }

    /// Bus with a manually driven clock, pinned at `start_ms`.
    pub fn with_manual_clock(start_ms: i64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock_ms: AtomicI64::new(start_ms),
        }
    }

    /// Advance the manual clock. No-op warning-free on a real-clock bus is
    /// not provided: callers that advance must have built with
    /// `with_manual_clock`.
    pub fn advance_clock(&self, delta_ms: i64) {
        self.clock_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    fn current_ms(&self) -> i64 {
        let manual = self.clock_ms.load(Ordering::SeqCst);
        if manual >= 0 {
            return manual;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Total entries on a stream (test helper).
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// All entries on a stream, oldest first (test helper).
    pub fn stream_entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, data)| StreamEntry {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Unacknowledged delivered entries for a group (test helper; property 4
    /// of the ack discipline asserts this drains to zero).
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut inner = self.inner.lock();
        let st = match inner.streams.get_mut(stream) {
            Some(st) => st,
            None => return Vec::new(),
        };
        let grp = match st.groups.get_mut(group) {
            Some(g) => g,
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        while grp.cursor < st.entries.len() && out.len() < count {
            let idx = grp.cursor;
            let (id, data) = &st.entries[idx];
            grp.pending.insert(id.clone(), idx);
            out.push(StreamEntry {
                id: id.clone(),
                data: data.clone(),
            });
            grp.cursor += 1;
        }
        out
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn now_ms(&self) -> Result<i64> {
        Ok(self.current_ms())
    }

    async fn append(&self, stream: &str, data: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        let st = inner.streams.entry(stream.to_string()).or_default();
        let id = format!("{}-0", st.entries.len() + 1);
        st.entries.push((id.clone(), data.to_string()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let st = inner.streams.entry(stream.to_string()).or_default();
        st.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        // Emulate BLOCK by polling in short slices until the deadline.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(block_ms);
        loop {
            let out = self.try_read(stream, group, count);
            if !out.is_empty() {
                return Ok(out);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(st) = inner.streams.get_mut(stream) {
            if let Some(grp) = st.groups.get_mut(group) {
                grp.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let now = self.current_ms();
        let mut inner = self.inner.lock();
        let expired = match inner.kv.get(key) {
            Some(entry) => entry.expires_at_ms.map(|e| now >= e).unwrap_or(false),
            None => return Ok(None),
        };
        if expired {
            inner.kv.remove(key);
            return Ok(None);
        }
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn kv_mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.kv_get(key).await?);
        }
        Ok(out)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at_ms: None,
            },
        );
        Ok(())
    }

    async fn kv_set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires = self.current_ms() + (ttl_secs as i64) * 1000;
        self.inner.lock().kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at_ms: Some(expires),
            },
        );
        Ok(())
    }
}
