//! JSON-RPC provider with multi-RPC support and automatic failover

use super::{BalanceSource, Block, BlockUpdate, BroadcastSink, NetworkClient, TxLookup};
use crate::config::NetworkConfig;
use crate::error::{KeeperError, KeeperResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

/// Capacity of the block update channel
const BLOCK_CHANNEL_CAPACITY: usize = 64;

/// Multi-provider wrapper with automatic failover
pub struct EthProvider {
    /// Network configuration
    config: NetworkConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Latest known block
    block_cache: watch::Sender<Option<Block>>,
    /// Block arrival notifications
    block_tx: broadcast::Sender<BlockUpdate>,
}

impl EthProvider {
    /// Create a new provider from the configured RPC URLs
    pub fn new(config: NetworkConfig) -> KeeperResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(KeeperError::Network(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        let (block_cache, _) = watch::channel(None);
        let (block_tx, _) = broadcast::channel(BLOCK_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            block_cache,
            block_tx,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> KeeperResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(KeeperError::Network(format!(
            "All providers failed for chain {}",
            self.config.chain_id
        )))
    }

    /// Get a block with its transaction hashes
    pub async fn get_block(&self, block_number: u64) -> KeeperResult<Option<Block>> {
        let block = self
            .http()
            .get_block(block_number)
            .await
            .map_err(|e| KeeperError::Network(e.to_string()))?;

        Ok(block.map(|b| Block {
            number: b.number.map(|n| n.as_u64()).unwrap_or(block_number),
            hash: b.hash,
            transactions: b.transactions,
        }))
    }

    /// Store a new head and notify subscribers
    pub fn publish_block(&self, block: Block) {
        let old = self.block_cache.send_replace(Some(block.clone()));
        crate::metrics::record_block_height(block.number);

        // No subscribers is fine
        let _ = self.block_tx.send(BlockUpdate { old, new: block });
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

#[async_trait]
impl NetworkClient for EthProvider {
    fn cached_block(&self) -> Option<Block> {
        self.block_cache.borrow().clone()
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockUpdate> {
        self.block_tx.subscribe()
    }

    async fn transaction_count(&self, address: Address, block_number: u64) -> KeeperResult<U256> {
        let block = BlockId::Number(BlockNumber::Number(block_number.into()));
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(address, Some(block)).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count for {:?} on chain {}: {}",
                        address, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(KeeperError::Network(format!(
            "All providers failed to get transaction count for {:?}",
            address
        )))
    }

    async fn transaction_by_hash(&self, tx_hash: H256) -> KeeperResult<Option<TxLookup>> {
        let tx = self
            .http()
            .get_transaction(tx_hash)
            .await
            .map_err(|e| KeeperError::Network(e.to_string()))?;

        Ok(tx.map(|tx| TxLookup {
            block_number: tx.block_number.map(|n| n.as_u64()),
        }))
    }
}

#[async_trait]
impl BalanceSource for EthProvider {
    async fn balance(&self, address: Address) -> KeeperResult<Option<U256>> {
        self.http()
            .get_balance(address, None)
            .await
            .map(Some)
            .map_err(|e| KeeperError::Network(e.to_string()))
    }
}

#[async_trait]
impl BroadcastSink for EthProvider {
    async fn publish_transaction(&self, raw: Bytes) -> KeeperResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| KeeperError::Broadcast(e.to_string()))?;

        Ok(pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EthProvider {
        EthProvider::new(NetworkConfig {
            chain_id: 1,
            rpc_urls: vec!["http://127.0.0.1:8545".to_string()],
            poll_interval_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_urls() {
        let result = EthProvider::new(NetworkConfig {
            chain_id: 1,
            rpc_urls: vec!["not a url".to_string()],
            poll_interval_ms: 1000,
        });
        assert!(matches!(result, Err(KeeperError::Network(_))));
    }

    #[tokio::test]
    async fn test_publish_block_updates_cache_and_notifies() {
        let provider = provider();
        assert!(provider.cached_block().is_none());

        let mut updates = provider.subscribe_blocks();
        provider.publish_block(Block {
            number: 7,
            ..Default::default()
        });
        provider.publish_block(Block {
            number: 8,
            ..Default::default()
        });

        let first = updates.recv().await.unwrap();
        assert!(first.old.is_none());
        assert_eq!(first.new.number, 7);

        let second = updates.recv().await.unwrap();
        assert_eq!(second.old.map(|b| b.number), Some(7));
        assert_eq!(provider.cached_block().map(|b| b.number), Some(8));
    }
}
