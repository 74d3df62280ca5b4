//! Redis adapter for the KV port.
//!
//! Chunks land under `chunk:<job_id>` as hashes with a TTL; `chunk_index`
//! and the response-embedding history are sorted sets scored by timestamp.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{ChunkRecord, KvStore};
use crate::types::{MemoryError, OffloadJob};

const CHUNK_KEY_PREFIX: &str = "chunk:";
const CHUNK_INDEX_KEY: &str = "chunk_index";

fn store_err(e: redis::RedisError) -> MemoryError {
    MemoryError::Store {
        reason: format!("redis: {e}"),
    }
}

pub struct RedisKvStore {
    manager: ConnectionManager,
    chunk_ttl_secs: i64,
}

impl RedisKvStore {
    /// Connect and verify with a PING.
    pub async fn connect(url: &str, chunk_ttl_secs: i64) -> Result<Self, MemoryError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let mut manager = ConnectionManager::new(client).await.map_err(store_err)?;
        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .map_err(store_err)?;
        info!(url, "redis connected");
        Ok(Self {
            manager,
            chunk_ttl_secs,
        })
    }

    fn record_from_hash(fields: HashMap<String, String>) -> Option<ChunkRecord> {
        let job_id = fields.get("job_id")?.clone();
        Some(ChunkRecord {
            job_id,
            chunk_text: fields.get("chunk_text").cloned().unwrap_or_default(),
            summary: fields.get("summary").cloned().unwrap_or_default(),
            metadata: fields
                .get("metadata")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(serde_json::Value::Null),
            timestamp: fields
                .get("timestamp")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            token_count: fields
                .get("token_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            message_count: fields
                .get("message_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn store_chunk(&self, job: &OffloadJob, summary: &str) -> Result<(), MemoryError> {
        let mut con = self.manager.clone();
        let key = format!("{CHUNK_KEY_PREFIX}{}", job.job_id);

        let fields: Vec<(&str, String)> = vec![
            ("job_id", job.job_id.clone()),
            ("chunk_text", job.chunk_text.clone()),
            ("summary", summary.to_string()),
            ("metadata", serde_json::to_string(&job.metadata)?),
            ("timestamp", job.timestamp.to_string()),
            ("token_count", job.token_count.to_string()),
            ("message_count", job.message_count.to_string()),
        ];

        let _: () = con.hset_multiple(&key, &fields).await.map_err(store_err)?;
        let _: () = con.expire(&key, self.chunk_ttl_secs).await.map_err(store_err)?;
        let _: () = con
            .zadd(CHUNK_INDEX_KEY, &job.job_id, job.timestamp)
            .await
            .map_err(store_err)?;

        debug!(job_id = %job.job_id, "stored chunk in redis");
        Ok(())
    }

    async fn chunks_by_ids(&self, job_ids: &[String]) -> Result<Vec<ChunkRecord>, MemoryError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let mut records = Vec::new();
        for job_id in job_ids {
            let key = format!("{CHUNK_KEY_PREFIX}{job_id}");
            let fields: HashMap<String, String> =
                con.hgetall(&key).await.map_err(store_err)?;
            if let Some(record) = Self::record_from_hash(fields) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn recent_chunks(&self, limit: usize) -> Result<Vec<ChunkRecord>, MemoryError> {
        if limit == 0 {
            // ZREVRANGE key 0 -1 would mean "everything", not "nothing"
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let job_ids: Vec<String> = con
            .zrevrange(CHUNK_INDEX_KEY, 0, limit as isize - 1)
            .await
            .map_err(store_err)?;
        self.chunks_by_ids(&job_ids).await
    }

    async fn chunk_count(&self) -> Result<usize, MemoryError> {
        let mut con = self.manager.clone();
        let count: usize = con.zcard(CHUNK_INDEX_KEY).await.map_err(store_err)?;
        Ok(count)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), MemoryError> {
        let mut con = self.manager.clone();
        let _: () = con.zadd(key, member, score).await.map_err(store_err)?;
        Ok(())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, MemoryError> {
        let mut con = self.manager.clone();
        let members: Vec<String> = con.zrange(key, 0, -1).await.map_err(store_err)?;
        Ok(members)
    }

    async fn ztrim_oldest(&self, key: &str, keep: usize) -> Result<(), MemoryError> {
        let mut con = self.manager.clone();
        let _: () = con
            .zremrangebyrank(key, 0, -(keep as isize) - 1)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn shutdown(&self) {
        // The multiplexed connection closes when its last clone drops.
        info!("redis connection released");
    }
}
