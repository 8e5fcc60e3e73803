// =============================================================================
// RedisBus — Redis Streams backend for the message bus
// =============================================================================
//
// Streams map onto XADD / XREADGROUP / XACK, group creation uses
// XGROUP CREATE ... MKSTREAM from position 0 so groups created after a
// producer has already written still see the full history, and the
// wall-clock is the server's TIME so every process stamps comparable
// timestamps regardless of host clock skew.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use super::{MessageBus, StreamEntry, DATA_FIELD};

pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .context("redis connection failed")
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn now_ms(&self) -> Result<i64> {
        let mut con = self.conn().await?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut con)
            .await
            .context("TIME failed")?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn append(&self, stream: &str, data: &str) -> Result<String> {
        let mut con = self.conn().await?;
        let id: String = con
            .xadd(stream, "*", &[(DATA_FIELD, data)])
            .await
            .with_context(|| format!("XADD {stream} failed"))?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let res: redis::RedisResult<()> = con.xgroup_create_mkstream(stream, group, "0").await;
        match res {
            Ok(()) => Ok(()),
            // Duplicate group creation is expected at every startup.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).with_context(|| format!("XGROUP CREATE {stream}/{group} failed")),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut con = self.conn().await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = con
            .xread_options(&[stream], &[">"], &opts)
            .await
            .with_context(|| format!("XREADGROUP {stream}/{group} failed"))?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                // Entries missing the data field are skipped here and left
                // pending; the consumer never sees them so it cannot ack
                // them, which keeps the malformation visible in XPENDING.
                if let Some(data) = entry.get::<String>(DATA_FIELD) {
                    out.push(StreamEntry { id: entry.id, data });
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let _: i64 = con
            .xack(stream, group, &[id])
            .await
            .with_context(|| format!("XACK {stream}/{group} failed"))?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.conn().await?;
        let val: Option<String> = con.get(key).await.with_context(|| format!("GET {key} failed"))?;
        Ok(val)
    }

    async fn kv_mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.conn().await?;
        // MGET of a single key returns a scalar, not an array; go through
        // the explicit command form so the reply always parses as a vec.
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let vals: Vec<Option<String>> = cmd
            .query_async(&mut con)
            .await
            .context("MGET failed")?;
        Ok(vals)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let _: () = con
            .set(key, value)
            .await
            .with_context(|| format!("SET {key} failed"))?;
        Ok(())
    }

    async fn kv_set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut con = self.conn().await?;
        let _: () = con
            .set_ex(key, value, ttl_secs as usize)
            .await
            .with_context(|| format!("SETEX {key} failed"))?;
        Ok(())
    }
}
