//! Supervisor outcome events
//!
//! The supervisor never writes to the transaction store. Every outcome is sent
//! as a `TxEvent` and applied by whoever subscribes (normally the store).

use crate::tx::TransactionRecord;

use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// Outcomes raised while supervising pending transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxEvent {
    /// Transaction observed in a mined block
    Confirmed { id: u64 },

    /// Transaction can no longer succeed
    Failed { id: u64, error: String },

    /// Non-fatal problem; the record carries the warning to persist
    Warning { record: TransactionRecord },

    /// Raw payload rebroadcast successfully
    Resubmitted { id: u64, tx_hash: H256 },
}

impl TxEvent {
    /// Id of the transaction this event is about
    pub fn tx_id(&self) -> u64 {
        match self {
            TxEvent::Confirmed { id } => *id,
            TxEvent::Failed { id, .. } => *id,
            TxEvent::Warning { record } => record.id,
            TxEvent::Resubmitted { id, .. } => *id,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            TxEvent::Confirmed { .. } => "tx_confirmed",
            TxEvent::Failed { .. } => "tx_failed",
            TxEvent::Warning { .. } => "tx_warning",
            TxEvent::Resubmitted { .. } => "tx_resubmitted",
        }
    }
}

/// Drain every event currently queued on a receiver
#[cfg(test)]
pub(crate) fn drain(rx: &mut tokio::sync::broadcast::Receiver<TxEvent>) -> Vec<TxEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
