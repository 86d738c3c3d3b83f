//! Chain module - network collaborators consumed by the keeper
//!
//! This module provides:
//! - The `NetworkClient`, `BalanceSource` and `BroadcastSink` seams
//! - Block and lookup types shared by the allocator and the supervisor
//! - A JSON-RPC provider with multi-URL failover implementing all three seams
//! - A polling block listener feeding the block cache and update stream

pub mod listener;
pub mod provider;

pub use listener::BlockListener;
pub use provider::EthProvider;

use crate::error::KeeperResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[cfg(test)]
use mockall::automock;

/// A mined block as seen by the keeper
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: Option<H256>,
    /// Hashes of the transactions included in the block
    pub transactions: Vec<H256>,
}

impl Block {
    pub fn contains(&self, tx_hash: &H256) -> bool {
        self.transactions.contains(tx_hash)
    }
}

/// New head notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUpdate {
    pub old: Option<Block>,
    pub new: Block,
}

/// Result of a transaction-by-hash lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxLookup {
    /// Set once the transaction is mined
    pub block_number: Option<u64>,
}

/// Block and transaction queries
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Latest block already known to the client, if any
    fn cached_block(&self) -> Option<Block>;

    /// Stream of block arrivals
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockUpdate>;

    async fn transaction_count(&self, address: Address, block_number: u64) -> KeeperResult<U256>;

    async fn transaction_by_hash(&self, tx_hash: H256) -> KeeperResult<Option<TxLookup>>;
}

/// Account balance queries
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Balance in wei, `None` while the balance is not known yet
    async fn balance(&self, address: Address) -> KeeperResult<Option<U256>>;
}

/// Raw transaction broadcast
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn publish_transaction(&self, raw: Bytes) -> KeeperResult<H256>;
}
