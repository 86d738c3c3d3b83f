//! In-memory transaction store

use super::TransactionStore;
use crate::error::{KeeperError, KeeperResult};
use crate::events::TxEvent;
use crate::tx::{TransactionRecord, TxStatus};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Transaction history kept in memory, ordered by id
pub struct InMemoryStore {
    transactions: RwLock<BTreeMap<u64, TransactionRecord>>,
    next_id: AtomicU64,
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub unapproved: u64,
    pub signed: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh record id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert or replace a record
    pub async fn insert(&self, record: TransactionRecord) {
        self.next_id.fetch_max(record.id.saturating_add(1), Ordering::SeqCst);
        self.transactions.write().await.insert(record.id, record);
    }

    /// Get transaction by id
    pub async fn get(&self, id: u64) -> Option<TransactionRecord> {
        self.transactions.read().await.get(&id).cloned()
    }

    /// Every record sent from `address`
    pub async fn transactions_for(&self, address: Address) -> Vec<TransactionRecord> {
        self.filtered(|tx| tx.from == address).await
    }

    /// Mark a transaction as failed
    pub async fn mark_failed(&self, id: u64, error: &str) -> KeeperResult<()> {
        let mut txs = self.transactions.write().await;
        let tx = txs
            .get_mut(&id)
            .ok_or(KeeperError::TransactionNotFound { id })?;
        tx.status = TxStatus::Failed;
        tx.error = Some(error.to_string());
        Ok(())
    }

    /// Apply a supervisor outcome
    pub async fn apply(&self, event: &TxEvent) -> KeeperResult<()> {
        let id = event.tx_id();
        let mut txs = self.transactions.write().await;
        let tx = txs
            .get_mut(&id)
            .ok_or(KeeperError::TransactionNotFound { id })?;

        match event {
            TxEvent::Confirmed { .. } | TxEvent::Failed { .. } if tx.status.is_terminal() => {
                debug!("Ignoring {} for already resolved tx {}", event.name(), id);
            }
            TxEvent::Confirmed { .. } => {
                tx.status = TxStatus::Confirmed;
                tx.warning = None;
                info!("Transaction {} confirmed", id);
            }
            TxEvent::Failed { error, .. } => {
                tx.status = TxStatus::Failed;
                tx.error = Some(error.clone());
                warn!("Transaction {} failed: {}", id, error);
            }
            TxEvent::Warning { record } => {
                tx.warning = record.warning.clone();
            }
            TxEvent::Resubmitted { tx_hash, .. } => {
                tx.retry_count += 1;
                tx.last_resubmitted_at = Some(Utc::now());
                if !tx.hash_history.contains(tx_hash) {
                    tx.hash_history.push(*tx_hash);
                }
            }
        }

        Ok(())
    }

    /// Apply events until the channel closes
    pub async fn run_event_sink(&self, mut events: broadcast::Receiver<TxEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.apply(&event).await {
                        warn!("Failed to apply {}: {}", event.name(), e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event sink lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Event sink stopped");
    }

    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for tx in self.transactions.read().await.values() {
            match tx.status {
                TxStatus::Unapproved => stats.unapproved += 1,
                TxStatus::Signed => stats.signed += 1,
                TxStatus::Submitted => stats.submitted += 1,
                TxStatus::Confirmed => stats.confirmed += 1,
                TxStatus::Failed => stats.failed += 1,
                TxStatus::Dropped => stats.dropped += 1,
            }
        }
        stats
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<TransactionRecord>
    where
        F: Fn(&TransactionRecord) -> bool,
    {
        self.transactions
            .read()
            .await
            .values()
            .filter(|tx| predicate(tx))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn pending_transactions(&self, address: Address) -> Vec<TransactionRecord> {
        self.filtered(|tx| tx.from == address && tx.status == TxStatus::Submitted)
            .await
    }

    async fn confirmed_transactions(&self, address: Address) -> Vec<TransactionRecord> {
        self.filtered(|tx| tx.from == address && tx.status == TxStatus::Confirmed)
            .await
    }

    async fn all_pending_transactions(&self) -> Vec<TransactionRecord> {
        self.filtered(|tx| tx.status == TxStatus::Submitted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxWarning;
    use ethers::types::H256;

    fn submitted(id: u64, from: Address) -> TransactionRecord {
        TransactionRecord::new(id, from, TxStatus::Submitted).with_nonce(id)
    }

    #[tokio::test]
    async fn test_pending_and_confirmed_views() {
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let store = InMemoryStore::new();

        store.insert(submitted(1, alice)).await;
        store.insert(submitted(2, bob)).await;
        store
            .insert(TransactionRecord::new(3, alice, TxStatus::Confirmed).with_nonce(0))
            .await;
        store
            .insert(TransactionRecord::new(4, alice, TxStatus::Signed).with_nonce(5))
            .await;

        let pending: Vec<u64> = store.pending_transactions(alice).await.iter().map(|t| t.id).collect();
        assert_eq!(pending, vec![1]);

        let confirmed: Vec<u64> = store.confirmed_transactions(alice).await.iter().map(|t| t.id).collect();
        assert_eq!(confirmed, vec![3]);

        assert_eq!(store.all_pending_transactions().await.len(), 2);
        assert_eq!(store.next_id(), 5);
    }

    #[tokio::test]
    async fn test_apply_status_transitions() {
        let store = InMemoryStore::new();
        store.insert(submitted(1, Address::zero())).await;
        store.insert(submitted(2, Address::zero())).await;

        store.apply(&TxEvent::Confirmed { id: 1 }).await.unwrap();
        store
            .apply(&TxEvent::Failed {
                id: 2,
                error: "boom".to_string(),
            })
            .await
            .unwrap();
        // terminal records stay terminal
        store
            .apply(&TxEvent::Failed {
                id: 1,
                error: "late".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(store.get(1).await.unwrap().status, TxStatus::Confirmed);
        let failed = store.get(2).await.unwrap();
        assert_eq!(failed.status, TxStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let missing = store.apply(&TxEvent::Confirmed { id: 99 }).await;
        assert!(matches!(missing, Err(KeeperError::TransactionNotFound { id: 99 })));
    }

    #[tokio::test]
    async fn test_apply_warning_and_resubmission() {
        let store = InMemoryStore::new();
        store.insert(submitted(1, Address::zero())).await;

        let mut warned = submitted(1, Address::zero());
        warned.warning = Some(TxWarning {
            error: "insufficient".to_string(),
            message: "Insufficient balance during rebroadcast.".to_string(),
        });
        store.apply(&TxEvent::Warning { record: warned }).await.unwrap();

        let hash = H256::repeat_byte(0x11);
        store
            .apply(&TxEvent::Resubmitted { id: 1, tx_hash: hash })
            .await
            .unwrap();
        store
            .apply(&TxEvent::Resubmitted { id: 1, tx_hash: hash })
            .await
            .unwrap();

        let tx = store.get(1).await.unwrap();
        assert_eq!(tx.status, TxStatus::Submitted);
        assert!(tx.warning.is_some());
        assert_eq!(tx.retry_count, 2);
        assert_eq!(tx.hash_history, vec![hash]);
        assert!(tx.last_resubmitted_at.is_some());
    }

    #[tokio::test]
    async fn test_event_sink_applies_until_closed() {
        let store = InMemoryStore::new();
        store.insert(submitted(1, Address::zero())).await;

        let (tx, rx) = broadcast::channel(16);
        tx.send(TxEvent::Confirmed { id: 1 }).unwrap();
        drop(tx);

        store.run_event_sink(rx).await;
        assert_eq!(store.get(1).await.unwrap().status, TxStatus::Confirmed);
        assert_eq!(store.stats().await.confirmed, 1);
    }
}
