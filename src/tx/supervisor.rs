//! Pending transaction supervision
//!
//! Watches every submitted transaction until it is mined or can no longer
//! succeed:
//! - new blocks are checked for pending hashes, with a full sweep whenever
//!   heights were skipped
//! - pending transactions are rebroadcast on a timer
//! - broadcast errors that only mean "already in flight" are ignored
//!
//! Outcomes are published as `TxEvent`s; the store is never written here.

use crate::chain::{BalanceSource, Block, BlockUpdate, BroadcastSink, NetworkClient};
use crate::config::KeeperConfig;
use crate::error::KeeperError;
use crate::events::TxEvent;
use crate::state::TransactionStore;
use crate::tx::{TransactionRecord, TxWarning};

use ethers::types::U256;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Broadcast errors meaning the transaction is already in flight or resolved
const KNOWN_BROADCAST_ERRORS: &[&str] = &[
    // geth
    "replacement transaction underpriced",
    "known transaction",
    "already known",
    // parity
    "gas price too low to replace",
    "transaction with the same hash was already imported",
    // other
    "gateway timeout",
    "nonce too low",
];

const INSUFFICIENT_BALANCE_MESSAGE: &str = "Insufficient balance during rebroadcast.";

/// Check a broadcast error against the ignorable set
pub fn is_known_broadcast_error(message: &str) -> bool {
    let message = message.trim().to_lowercase();
    KNOWN_BROADCAST_ERRORS
        .iter()
        .any(|known| message.contains(known))
}

/// Supervises submitted transactions until they are confirmed or failed
pub struct PendingTxSupervisor {
    store: Arc<dyn TransactionStore>,
    network: Arc<dyn NetworkClient>,
    balances: Arc<dyn BalanceSource>,
    sink: Arc<dyn BroadcastSink>,
    event_tx: broadcast::Sender<TxEvent>,
    config: KeeperConfig,
    shutdown: watch::Sender<bool>,
}

impl PendingTxSupervisor {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        network: Arc<dyn NetworkClient>,
        balances: Arc<dyn BalanceSource>,
        sink: Arc<dyn BroadcastSink>,
        config: KeeperConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Self {
            store,
            network,
            balances,
            sink,
            event_tx,
            config,
            shutdown: watch::channel(false).0,
        }
    }

    /// Subscribe to supervisor outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.event_tx.subscribe()
    }

    /// Main supervision loop
    pub async fn run(&self) {
        let mut blocks = self.network.subscribe_blocks();
        let mut shutdown = self.shutdown.subscribe();
        let mut resubmit_interval = interval(self.config.resubmit_interval());
        resubmit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Pending transaction supervisor started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,

                update = blocks.recv() => match update {
                    Ok(update) => self.handle_block(update).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} block updates, sweeping pending transactions", skipped);
                        self.sweep_pending_transactions().await;
                    }
                    Err(RecvError::Closed) => {
                        error!("Block stream closed");
                        break;
                    }
                },

                _ = resubmit_interval.tick() => {
                    self.resubmit_pending_transactions().await;
                }
            }
        }

        info!("Pending transaction supervisor stopped");
    }

    /// React to a new head
    ///
    /// Records resolved by the block check are left out of the sweep that
    /// follows, since the store has not applied their events yet.
    pub async fn handle_block(&self, update: BlockUpdate) {
        let resolved = self.check_for_transactions_in_block(&update.new).await;
        if heights_skipped(update.old.as_ref(), &update.new) {
            debug!("Block gap before {}, sweeping pending transactions", update.new.number);
            self.sweep_excluding(&resolved).await;
        }
    }

    /// Sweep when there is no previous block or heights were skipped
    pub async fn on_new_block(&self, old: Option<&Block>, new: &Block) {
        if heights_skipped(old, new) {
            debug!("Block gap before {}, sweeping pending transactions", new.number);
            self.sweep_pending_transactions().await;
        }
    }

    /// Confirm pending transactions included in `block`
    ///
    /// Returns the ids that were confirmed or failed.
    pub async fn check_for_transactions_in_block(&self, block: &Block) -> Vec<u64> {
        let pending = self.store.all_pending_transactions().await;
        let mut resolved = Vec::new();

        for tx in &pending {
            match tx.hash {
                None => {
                    self.fail_missing_hash(tx);
                    resolved.push(tx.id);
                }
                Some(hash) if block.contains(&hash) => {
                    self.emit(TxEvent::Confirmed { id: tx.id });
                    resolved.push(tx.id);
                }
                Some(_) => {}
            }
        }

        resolved
    }

    /// Look up every pending transaction by hash
    pub async fn sweep_pending_transactions(&self) {
        self.sweep_excluding(&[]).await;
    }

    async fn sweep_excluding(&self, resolved: &[u64]) {
        let pending = self.store.all_pending_transactions().await;
        crate::metrics::record_sweep();

        join_all(
            pending
                .iter()
                .filter(|tx| !resolved.contains(&tx.id))
                .map(|tx| self.check_pending_transaction(tx)),
        )
        .await;
    }

    async fn check_pending_transaction(&self, tx: &TransactionRecord) {
        let Some(hash) = tx.hash else {
            self.fail_missing_hash(tx);
            return;
        };

        match timeout(self.config.rpc_timeout(), self.network.transaction_by_hash(hash)).await {
            Ok(Ok(Some(lookup))) if lookup.block_number.is_some() => {
                self.emit(TxEvent::Confirmed { id: tx.id });
            }
            Ok(Ok(_)) => {
                debug!("Transaction {} ({:?}) not mined yet", tx.id, hash);
            }
            Ok(Err(e)) if e.is_retryable() => {
                debug!("Lookup of transaction {} failed, retrying next sweep: {}", tx.id, e);
            }
            Ok(Err(e)) => {
                warn!("Lookup of transaction {} failed: {}", tx.id, e);
            }
            Err(_) => {
                warn!("Lookup of transaction {} timed out", tx.id);
            }
        }
    }

    /// Rebroadcast every pending transaction
    pub async fn resubmit_pending_transactions(&self) {
        let pending = self.store.all_pending_transactions().await;
        if pending.is_empty() {
            return;
        }

        debug!("Resubmitting {} pending transactions", pending.len());
        join_all(pending.iter().map(|tx| self.resubmit_transaction(tx))).await;
    }

    async fn resubmit_transaction(&self, tx: &TransactionRecord) {
        let balance = match timeout(self.config.rpc_timeout(), self.balances.balance(tx.from)).await
        {
            Ok(Ok(Some(balance))) => balance,
            Ok(Ok(None)) => {
                debug!("Balance of {:?} not known yet, skipping tx {}", tx.from, tx.id);
                return;
            }
            Ok(Err(e)) => {
                warn!("Balance lookup for tx {} failed: {}", tx.id, e);
                return;
            }
            Err(_) => {
                warn!("Balance lookup for tx {} timed out", tx.id);
                return;
            }
        };

        let need = tx.max_cost();
        if balance < need {
            self.warn_insufficient_balance(tx, balance, need);
            return;
        }

        let Some(raw) = tx.raw.clone() else {
            debug!("Transaction {} has no signed payload, skipping", tx.id);
            return;
        };

        match timeout(self.config.rpc_timeout(), self.sink.publish_transaction(raw)).await {
            Ok(Ok(tx_hash)) => {
                debug!("Rebroadcast transaction {}: {:?}", tx.id, tx_hash);
                self.emit(TxEvent::Resubmitted { id: tx.id, tx_hash });
            }
            Ok(Err(e)) => self.handle_broadcast_error(tx, e),
            Err(_) => {
                debug!("Rebroadcast of transaction {} timed out", tx.id);
                crate::metrics::record_ignored_broadcast_error();
            }
        }
    }

    fn handle_broadcast_error(&self, tx: &TransactionRecord, err: KeeperError) {
        let message = err.to_string();
        if is_known_broadcast_error(&message) {
            debug!("Ignoring broadcast error for tx {}: {}", tx.id, message.trim());
            crate::metrics::record_ignored_broadcast_error();
            return;
        }

        self.emit(TxEvent::Failed {
            id: tx.id,
            error: message,
        });
    }

    fn warn_insufficient_balance(&self, tx: &TransactionRecord, have: U256, need: U256) {
        let err = KeeperError::InsufficientBalance {
            address: tx.from,
            have: have.to_string(),
            need: need.to_string(),
        };
        warn!("Not rebroadcasting tx {}: {}", tx.id, err);

        let mut record = tx.clone();
        record.warning = Some(TxWarning {
            error: err.to_string(),
            message: INSUFFICIENT_BALANCE_MESSAGE.to_string(),
        });
        self.emit(TxEvent::Warning { record });
    }

    fn fail_missing_hash(&self, tx: &TransactionRecord) {
        self.emit(TxEvent::Failed {
            id: tx.id,
            error: KeeperError::MissingHash { id: tx.id }.to_string(),
        });
    }

    fn emit(&self, event: TxEvent) {
        match &event {
            TxEvent::Confirmed { id } => info!("Transaction {} confirmed", id),
            TxEvent::Failed { id, error } => warn!("Transaction {} failed: {}", id, error),
            _ => {}
        }
        crate::metrics::record_tx_event(&event);

        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Stop the supervision loop
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("Supervisor shutdown initiated");
    }
}

fn heights_skipped(old: Option<&Block>, new: &Block) -> bool {
    match old {
        None => true,
        Some(old) => new.number.saturating_sub(old.number) > 1,
    }
}
