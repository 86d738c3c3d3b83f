//! Recording signed transactions under the nonce lock

use super::supervisor::is_known_broadcast_error;
use super::{NonceAllocator, TransactionRecord, TxStatus};
use crate::chain::BroadcastSink;
use crate::error::{KeeperError, KeeperResult};
use crate::state::InMemoryStore;

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A transaction signed by the wallet, ready to be tracked
#[derive(Debug, Clone, Deserialize)]
pub struct SignedTransaction {
    pub from: Address,
    pub nonce: u64,
    #[serde(default)]
    pub value: U256,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTransaction {
    pub id: u64,
    pub hash: H256,
    pub nonce: u64,
    pub status: TxStatus,
    pub error: Option<String>,
}

/// Entry point for new transactions
pub struct SubmissionTracker {
    allocator: Arc<NonceAllocator>,
    store: Arc<InMemoryStore>,
    sink: Arc<dyn BroadcastSink>,
    rpc_timeout: Duration,
}

impl SubmissionTracker {
    pub fn new(
        allocator: Arc<NonceAllocator>,
        store: Arc<InMemoryStore>,
        sink: Arc<dyn BroadcastSink>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            allocator,
            store,
            sink,
            rpc_timeout,
        }
    }

    /// Record a signed transaction as pending, then broadcast it
    ///
    /// The nonce lock is held only until the record is stored, so the
    /// broadcast never blocks other requests for the sender.
    pub async fn track(&self, signed: SignedTransaction) -> KeeperResult<TrackedTransaction> {
        let lock = self.allocator.acquire_nonce(signed.from).await?;
        if signed.nonce != lock.nonce() {
            return Err(KeeperError::NonceConflict {
                address: signed.from,
                requested: signed.nonce,
                expected: lock.nonce(),
            });
        }

        let hash = H256::from(keccak256(&signed.raw));
        let id = self.store.next_id();

        let mut record = TransactionRecord::new(id, signed.from, TxStatus::Submitted)
            .with_nonce(signed.nonce)
            .with_hash(hash)
            .with_raw(signed.raw.clone())
            .with_value(signed.value);
        record.gas_limit = signed.gas_limit;
        record.gas_price = signed.gas_price;
        record.hash_history.push(hash);

        self.store.insert(record).await;
        lock.release();
        info!(
            "Tracking tx {} from {:?} with nonce {}: {:?}",
            id, signed.from, signed.nonce, hash
        );

        let mut tracked = TrackedTransaction {
            id,
            hash,
            nonce: signed.nonce,
            status: TxStatus::Submitted,
            error: None,
        };

        match timeout(self.rpc_timeout, self.sink.publish_transaction(signed.raw)).await {
            Ok(Ok(published)) => {
                if published != hash {
                    warn!(
                        "Node reported hash {:?} for tx {}, expected {:?}",
                        published, id, hash
                    );
                }
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_known_broadcast_error(&message) {
                    debug!("Initial broadcast of tx {}: {}", id, message);
                } else {
                    self.store.mark_failed(id, &message).await?;
                    tracked.status = TxStatus::Failed;
                    tracked.error = Some(message);
                }
            }
            Err(_) => {
                warn!("Initial broadcast of tx {} timed out, leaving it to resubmission", id);
            }
        }

        Ok(tracked)
    }

    /// Bulk import history while nonce allocation is paused
    pub async fn import_history(&self, records: Vec<TransactionRecord>) -> usize {
        let global = self.allocator.acquire_global_lock().await;

        let count = records.len();
        for record in records {
            self.store.insert(record).await;
        }

        global.release();
        info!("Imported {} transaction records", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, MockBroadcastSink, MockNetworkClient};
    use tokio::sync::broadcast;

    fn sender() -> Address {
        Address::repeat_byte(0x33)
    }

    fn signed(nonce: u64) -> SignedTransaction {
        SignedTransaction {
            from: sender(),
            nonce,
            value: U256::from(10),
            gas_limit: Some(U256::from(21_000)),
            gas_price: Some(U256::from(1)),
            raw: Bytes::from(vec![0xf8, nonce as u8]),
        }
    }

    fn tracker(sink: MockBroadcastSink) -> (SubmissionTracker, Arc<InMemoryStore>) {
        let (block_tx, _) = broadcast::channel(4);
        let mut network = MockNetworkClient::new();
        network.expect_cached_block().returning(|| {
            Some(Block {
                number: 10,
                ..Default::default()
            })
        });
        network
            .expect_subscribe_blocks()
            .returning(move || block_tx.subscribe());
        network
            .expect_transaction_count()
            .returning(|_, _| Ok(U256::zero()));

        let store = Arc::new(InMemoryStore::new());
        let allocator = Arc::new(NonceAllocator::new(
            store.clone(),
            Arc::new(network),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let tracker =
            SubmissionTracker::new(allocator, store.clone(), Arc::new(sink), Duration::from_secs(1));
        (tracker, store)
    }

    #[tokio::test]
    async fn test_track_records_and_broadcasts() {
        let expected = H256::from(keccak256([0xf8, 0x00]));
        let mut sink = MockBroadcastSink::new();
        sink.expect_publish_transaction()
            .times(2)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        let (tracker, store) = tracker(sink);

        let first = tracker.track(signed(0)).await.unwrap();
        assert_eq!(first.hash, expected);
        assert_eq!(first.status, TxStatus::Submitted);

        let record = store.get(first.id).await.unwrap();
        assert_eq!(record.nonce, Some(0));
        assert_eq!(record.hash, Some(expected));
        assert_eq!(record.max_cost(), U256::from(21_010));

        // the recorded transaction moves the next nonce forward
        let second = tracker.track(signed(1)).await.unwrap();
        assert_eq!(second.nonce, 1);
    }

    #[tokio::test]
    async fn test_track_rejects_stale_nonce() {
        let mut sink = MockBroadcastSink::new();
        sink.expect_publish_transaction()
            .times(1)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        let (tracker, store) = tracker(sink);

        tracker.track(signed(0)).await.unwrap();
        let err = tracker.track(signed(0)).await.unwrap_err();
        assert!(matches!(
            err,
            KeeperError::NonceConflict {
                requested: 0,
                expected: 1,
                ..
            }
        ));
        assert_eq!(store.transactions_for(sender()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_track_marks_failed_on_real_broadcast_error() {
        let mut sink = MockBroadcastSink::new();
        sink.expect_publish_transaction()
            .returning(|_| Err(KeeperError::Broadcast("invalid sender".to_string())));
        let (tracker, store) = tracker(sink);

        let tracked = tracker.track(signed(0)).await.unwrap();
        assert_eq!(tracked.status, TxStatus::Failed);
        assert_eq!(store.get(tracked.id).await.unwrap().status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_track_keeps_pending_on_known_broadcast_error() {
        let mut sink = MockBroadcastSink::new();
        sink.expect_publish_transaction()
            .returning(|_| Err(KeeperError::Broadcast("already known".to_string())));
        let (tracker, store) = tracker(sink);

        let tracked = tracker.track(signed(0)).await.unwrap();
        assert_eq!(tracked.status, TxStatus::Submitted);
        assert_eq!(store.get(tracked.id).await.unwrap().status, TxStatus::Submitted);
    }

    #[tokio::test]
    async fn test_import_history_feeds_allocation() {
        let mut sink = MockBroadcastSink::new();
        sink.expect_publish_transaction()
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        let (tracker, _store) = tracker(sink);

        let imported = tracker
            .import_history(vec![
                TransactionRecord::new(1, sender(), TxStatus::Confirmed).with_nonce(0),
                TransactionRecord::new(2, sender(), TxStatus::Confirmed).with_nonce(1),
            ])
            .await;
        assert_eq!(imported, 2);

        let err = tracker.track(signed(0)).await.unwrap_err();
        assert!(matches!(err, KeeperError::NonceConflict { expected: 2, .. }));
        assert!(tracker.track(signed(2)).await.is_ok());
    }
}
