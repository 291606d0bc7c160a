//! Position snapshot provider client and the shared read-through cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::KeeperError;
use crate::models::{PosSide, Position, PositionKey};

use super::types::PositionsEnvelope;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of live position snapshots.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// All open positions for one account.
    async fn positions(&self, account: &str) -> Result<Vec<Position>, KeeperError>;

    /// Look up a single position. `None` means the position is absent
    /// from the snapshot; callers treat that as already closed.
    async fn find(
        &self,
        account: &str,
        key: &PositionKey,
    ) -> Result<Option<Position>, KeeperError> {
        let positions = self.positions(account).await?;
        Ok(positions.into_iter().find(|p| &p.key() == key))
    }

    /// Like [`find`](Self::find), but absence is an error for callers
    /// that expected the position to exist.
    async fn require(&self, account: &str, key: &PositionKey) -> Result<Position, KeeperError> {
        self.find(account, key)
            .await?
            .ok_or_else(|| KeeperError::DataUnavailable(key.to_string()))
    }
}

/// HTTP client for the snapshot provider.
pub struct SnapshotClient {
    client: Client,
    base_url: String,
}

impl SnapshotClient {
    pub fn new(base_url: String) -> Result<Self, KeeperError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| KeeperError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PositionProvider for SnapshotClient {
    async fn positions(&self, account: &str) -> Result<Vec<Position>, KeeperError> {
        let url = format!("{}/positions?account={}", self.base_url, account);
        debug!(url = %url, "Fetching position snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeeperError::Transport(format!("snapshot fetch failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KeeperError::Transport(format!(
                "snapshot request failed: {status} - {body}"
            )));
        }

        let envelope: PositionsEnvelope = response
            .json()
            .await
            .map_err(|e| KeeperError::Transport(format!("bad snapshot payload: {e}")))?;

        if !envelope.success {
            return Err(KeeperError::Transport(format!(
                "snapshot provider rejected request: {}",
                envelope.message.unwrap_or_default()
            )));
        }

        let fetched_at = Utc::now();
        let positions = envelope
            .positions
            .into_iter()
            .filter_map(|row| {
                let Some(pos_side) = PosSide::parse(&row.pos_side) else {
                    warn!(pos_side = %row.pos_side, inst_id = %row.inst_id, "Unknown position side");
                    return None;
                };

                Some(Position {
                    account: account.to_string(),
                    inst_id: row.inst_id,
                    pos_side,
                    pos_size: row.pos_size,
                    avg_price: row.avg_price,
                    mark_price: row.mark_price,
                    leverage: row.lever,
                    margin: row.margin,
                    profit_rate: row.profit_rate,
                    fetched_at,
                })
            })
            .filter(|p| p.is_open())
            .collect();

        Ok(positions)
    }
}

/// Short-TTL read-through cache in front of a provider.
///
/// Every loop that ticks within one TTL window sees the same snapshot,
/// cutting duplicate provider calls while keeping loop autonomy. The
/// TTL is short enough (~2s) that a fresh tick always re-reads.
pub struct SnapshotCache {
    inner: Arc<dyn PositionProvider>,
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Arc<Vec<Position>>)>>,
}

impl SnapshotCache {
    pub fn new(inner: Arc<dyn PositionProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop all cached entries, forcing the next read through.
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl PositionProvider for SnapshotCache {
    async fn positions(&self, account: &str) -> Result<Vec<Position>, KeeperError> {
        {
            let entries = self.entries.read().await;
            if let Some((at, cached)) = entries.get(account) {
                if at.elapsed() < self.ttl {
                    return Ok(cached.as_ref().clone());
                }
            }
        }

        let fresh = self.inner.positions(account).await?;

        let mut entries = self.entries.write().await;
        entries.insert(
            account.to_string(),
            (Instant::now(), Arc::new(fresh.clone())),
        );

        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PositionProvider for CountingProvider {
        async fn positions(&self, account: &str) -> Result<Vec<Position>, KeeperError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Position {
                account: account.to_string(),
                inst_id: "CFX-USDT-SWAP".to_string(),
                pos_side: PosSide::Long,
                pos_size: dec!(100),
                avg_price: dec!(0.2),
                mark_price: dec!(0.2),
                leverage: dec!(10),
                margin: dec!(2),
                profit_rate: dec!(1),
                fetched_at: Utc::now(),
            }])
        }
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = SnapshotCache::new(provider.clone(), Duration::from_secs(60));

        cache.positions("sub1").await.unwrap();
        cache.positions("sub1").await.unwrap();
        cache.positions("sub1").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_is_per_account() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = SnapshotCache::new(provider.clone(), Duration::from_secs(60));

        cache.positions("sub1").await.unwrap();
        cache.positions("primary").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
        };
        let key = PositionKey::new("BTC-USDT-SWAP", PosSide::Short);

        let found = provider.find("sub1", &key).await.unwrap();
        assert!(found.is_none());
    }
}
