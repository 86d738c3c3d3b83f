//! Transaction history store
//!
//! Handles:
//! - The `TransactionStore` seam read by the allocator and the supervisor
//! - An in-memory store that applies supervisor events

mod memory;

pub use memory::{InMemoryStore, StoreStats};

use crate::tx::TransactionRecord;

use async_trait::async_trait;
use ethers::types::Address;

/// Snapshot queries over the transaction history
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Submitted, not yet resolved transactions sent from `address`
    async fn pending_transactions(&self, address: Address) -> Vec<TransactionRecord>;

    /// Transactions from `address` observed in a block
    async fn confirmed_transactions(&self, address: Address) -> Vec<TransactionRecord>;

    /// Pending transactions across every address
    async fn all_pending_transactions(&self) -> Vec<TransactionRecord>;
}
