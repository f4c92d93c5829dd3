use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};

use crate::error::BotError;
use crate::models::PositionRecord;
use crate::Result;

/// Storage for the open position of each symbol
///
/// Only what is needed to resume trailing stops after a restart.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn save(&self, record: &PositionRecord) -> Result<()>;

    async fn load(&self, symbol: &str) -> Result<Option<PositionRecord>>;

    async fn remove(&self, symbol: &str) -> Result<()>;
}

/// Redis-backed position store
///
/// One JSON value per symbol under `position:{symbol}`.
#[derive(Clone)]
pub struct RedisPositionStore {
    conn: ConnectionManager,
}

impl RedisPositionStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| BotError::NetworkFailure("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(symbol: &str) -> String {
        format!("position:{}", symbol)
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn save(&self, record: &PositionRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(&record.position.symbol), value)
            .await?;

        tracing::debug!(
            symbol = %record.position.symbol,
            state = ?record.position.state,
            "Saved position to Redis"
        );
        Ok(())
    }

    async fn load(&self, symbol: &str) -> Result<Option<PositionRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::key(symbol)).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(symbol)).await?;
        tracing::debug!(symbol = %symbol, "Removed position from Redis");
        Ok(())
    }
}

/// Process-local store, used when Redis is not configured or unreachable
#[derive(Default)]
pub struct MemoryPositionStore {
    records: RwLock<HashMap<String, PositionRecord>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save(&self, record: &PositionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.position.symbol.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, symbol: &str) -> Result<Option<PositionRecord>> {
        Ok(self.records.read().await.get(symbol).cloned())
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        self.records.write().await.remove(symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, PositionState, TrailingStopState};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn record(symbol: &str) -> PositionRecord {
        let id = Uuid::new_v4();
        PositionRecord {
            position: Position {
                id,
                symbol: symbol.to_string(),
                venue: "kucoin".to_string(),
                entry_price: dec!(100),
                quantity: dec!(10),
                state: PositionState::TrailingActive,
                opened_at: Some(Utc::now()),
            },
            trailing: Some(TrailingStopState {
                position_id: id,
                peak_price: dec!(120),
                activation_price: dec!(110),
                trailing_distance_pct: dec!(2),
            }),
        }
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryPositionStore::new();
        assert!(store.load("POLS-USDT").await.unwrap().is_none());

        let rec = record("POLS-USDT");
        store.save(&rec).await.unwrap();
        assert_eq!(store.load("POLS-USDT").await.unwrap(), Some(rec));
        assert!(store.load("BTC-USDT").await.unwrap().is_none());

        store.remove("POLS-USDT").await.unwrap();
        assert!(store.load("POLS-USDT").await.unwrap().is_none());
    }

    #[test]
    fn test_record_json_keeps_decimals_exact() {
        let rec = record("POLS-USDT");
        let json = serde_json::to_string(&rec).unwrap();
        let back: PositionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trailing.unwrap().trigger_price(), dec!(117.6));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_redis_connection() {
        let result = RedisPositionStore::new("redis://127.0.0.1:6379").await;
        assert!(result.is_ok(), "Failed to connect to Redis");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_redis_save_load_remove() {
        let store = RedisPositionStore::new("redis://127.0.0.1:6379")
            .await
            .unwrap();
        let symbol = format!("TEST{}-USDT", Uuid::new_v4().simple());
        let rec = record(&symbol);

        store.save(&rec).await.unwrap();
        assert_eq!(store.load(&symbol).await.unwrap(), Some(rec));

        store.remove(&symbol).await.unwrap();
        assert!(store.load(&symbol).await.unwrap().is_none());
    }
}
