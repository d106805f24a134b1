use anyhow::Result;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};

/// Durable subset of a run target, one record per known identity,
/// independent of current connection state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub identity: String,
    pub display_name: String,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn new(identity: String, display_name: String) -> Self {
        Self {
            identity,
            display_name,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    redis: ConnectionManager,
}

impl Storage {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    /// Load every known record. Used once at startup to pre-populate the
    /// registry with known-but-disconnected targets.
    pub async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("run_target:*")
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
                for value in values.into_iter().flatten() {
                    match serde_json::from_str::<PersistedRecord>(&value) {
                        Ok(record) => results.push(record),
                        Err(err) => {
                            tracing::warn!("skipping unreadable run target record: {err}")
                        }
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(results)
    }

    pub async fn upsert(&self, record: &PersistedRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = record_key(&record.identity);
        let value = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(&key, value).await?;
        Ok(())
    }

    pub async fn delete(&self, identity: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(record_key(identity)).await?;
        Ok(())
    }
}

fn record_key(identity: &str) -> String {
    format!("run_target:{}", identity)
}
