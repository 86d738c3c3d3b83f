//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Per-address serialization of nonce requests
//! - Reconciling local history with the network transaction count
//! - A global lock that pauses allocation for every address

use crate::chain::{Block, NetworkClient};
use crate::error::{KeeperError, KeeperResult};
use crate::lock::{KeyGuard, KeyedMutex, GLOBAL_LOCK_KEY};
use crate::state::TransactionStore;
use crate::tx::TransactionRecord;

use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Numbers used to compute a nonce, kept for collision debugging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceDetails {
    /// Transaction count reported by the network
    pub network_nonce: u64,
    /// Block the count was read at
    pub block_number: u64,
    /// Next nonce after the highest locally known one
    pub local_next_nonce: u64,
    /// Highest nonce among pending transactions only
    pub highest_pending_nonce: Option<u64>,
}

/// Permission to use `nonce` for `address`
///
/// Other requests for the same address wait until this is released or dropped.
/// Release it right after the signed transaction is recorded as pending, or
/// when the attempt is abandoned.
#[must_use = "dropping the lock releases the nonce immediately"]
#[derive(Debug)]
pub struct NonceLock {
    address: Address,
    nonce: u64,
    details: NonceDetails,
    guard: KeyGuard,
}

impl NonceLock {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn details(&self) -> &NonceDetails {
        &self.details
    }

    pub fn release(self) {
        debug!("Releasing nonce lock for {:?}", self.address);
        self.guard.release();
    }
}

/// Pauses nonce allocation for every address while held
#[must_use = "dropping the lock releases it immediately"]
#[derive(Debug)]
pub struct GlobalLock {
    guard: KeyGuard,
}

impl GlobalLock {
    pub fn release(self) {
        debug!("Releasing global nonce lock");
        self.guard.release();
    }
}

/// Hands out nonces for any number of addresses
pub struct NonceAllocator {
    /// Lock entries, one per address plus the global key
    locks: KeyedMutex,
    store: Arc<dyn TransactionStore>,
    network: Arc<dyn NetworkClient>,
    rpc_timeout: Duration,
    block_wait_timeout: Duration,
}

impl NonceAllocator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        network: Arc<dyn NetworkClient>,
        rpc_timeout: Duration,
        block_wait_timeout: Duration,
    ) -> Self {
        Self {
            locks: KeyedMutex::new(),
            store,
            network,
            rpc_timeout,
            block_wait_timeout,
        }
    }

    /// Block all nonce issuance until the returned lock is released
    pub async fn acquire_global_lock(&self) -> GlobalLock {
        let guard = self.locks.acquire(GLOBAL_LOCK_KEY).await;
        debug!("Acquired global nonce lock");
        GlobalLock { guard }
    }

    /// Compute the next nonce for `address` and hold its lock
    ///
    /// The global key is only used as a barrier: a global lock taken after the
    /// barrier passes does not stop this call.
    pub async fn acquire_nonce(&self, address: Address) -> KeeperResult<NonceLock> {
        self.locks.acquire(GLOBAL_LOCK_KEY).await.release();

        let guard = self.locks.acquire(&lock_key(&address)).await;

        let confirmed = self.store.confirmed_transactions(address).await;
        let pending = self.store.pending_transactions(address).await;

        let local_next_nonce =
            local_next_nonce(&confirmed, &pending).ok_or_else(|| KeeperError::InvalidNonce {
                address,
                message: "local next nonce overflows u64".to_string(),
            })?;

        let (network_nonce, block_number) = self.network_nonce(address).await?;
        let nonce = network_nonce.max(local_next_nonce);
        let highest_pending_nonce = highest_nonce(unique_nonces(&pending));

        if local_next_nonce > network_nonce {
            debug!(
                "Local history for {:?} is ahead of the network: {} > {}",
                address, local_next_nonce, network_nonce
            );
        }

        debug!(
            "Allocated nonce {} for {:?} (network {}, local {}, block {})",
            nonce, address, network_nonce, local_next_nonce, block_number
        );
        crate::metrics::record_nonce_allocated();

        Ok(NonceLock {
            address,
            nonce,
            details: NonceDetails {
                network_nonce,
                block_number,
                local_next_nonce,
                highest_pending_nonce,
            },
            guard,
        })
    }

    /// Transaction count at the current block
    async fn network_nonce(&self, address: Address) -> KeeperResult<(u64, u64)> {
        let block = self.current_block().await?;

        let count = timeout(
            self.rpc_timeout,
            self.network.transaction_count(address, block.number),
        )
        .await
        .map_err(|_| KeeperError::Timeout {
            operation: format!("transaction count for {:?}", address),
        })??;

        if count > U256::from(u64::MAX) {
            return Err(KeeperError::InvalidNonce {
                address,
                message: format!("network transaction count {} is not a valid nonce", count),
            });
        }

        Ok((count.as_u64(), block.number))
    }

    /// Cached block, or the next block to arrive
    async fn current_block(&self) -> KeeperResult<Block> {
        // subscribe before reading the cache so a block landing in between is not missed
        let mut blocks = self.network.subscribe_blocks();
        if let Some(block) = self.network.cached_block() {
            return Ok(block);
        }

        debug!("No cached block, waiting for the next one");
        let wait = async {
            loop {
                match blocks.recv().await {
                    Ok(update) => return Ok(update.new),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Block stream lagged by {} while waiting", skipped);
                    }
                    Err(RecvError::Closed) => {
                        return Err(KeeperError::Network("block stream closed".to_string()))
                    }
                }
            }
        };

        timeout(self.block_wait_timeout, wait)
            .await
            .map_err(|_| KeeperError::Timeout {
                operation: "next block".to_string(),
            })?
    }
}

fn lock_key(address: &Address) -> String {
    format!("{:?}", address)
}

/// Keep one record per nonce value, the first one seen wins
fn unique_nonces<'a, I>(records: I) -> Vec<&'a TransactionRecord>
where
    I: IntoIterator<Item = &'a TransactionRecord>,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|tx| seen.insert(tx.nonce))
        .collect()
}

fn highest_nonce(records: Vec<&TransactionRecord>) -> Option<u64> {
    records.iter().filter_map(|tx| tx.nonce).max()
}

/// Next nonce implied by local history, `None` on overflow
fn local_next_nonce(
    confirmed: &[TransactionRecord],
    pending: &[TransactionRecord],
) -> Option<u64> {
    let confirmed = unique_nonces(confirmed);
    let pending = unique_nonces(pending);
    let has_history = !confirmed.is_empty() || !pending.is_empty();

    let combined = unique_nonces(confirmed.into_iter().chain(pending));
    let highest = highest_nonce(combined).unwrap_or(0);

    if highest != 0 || has_history {
        highest.checked_add(1)
    } else {
        Some(0)
    }
}
