//! Transaction records as supplied by the transaction store

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Unapproved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
    Dropped,
}

impl TxStatus {
    /// Confirmed, failed and dropped records are never supervised again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed | TxStatus::Dropped)
    }
}

/// Non-fatal annotation attached during resubmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWarning {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub status: TxStatus,
    pub from: Address,
    pub nonce: Option<u64>,
    #[serde(default)]
    pub value: U256,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub raw: Option<Bytes>,
    pub hash: Option<H256>,
    #[serde(default)]
    pub hash_history: Vec<H256>,
    #[serde(default)]
    pub retry_count: u32,
    pub last_resubmitted_at: Option<DateTime<Utc>>,
    pub warning: Option<TxWarning>,
    pub error: Option<String>,
}

impl TransactionRecord {
    pub fn new(id: u64, from: Address, status: TxStatus) -> Self {
        Self {
            id,
            status,
            from,
            nonce: None,
            value: U256::zero(),
            gas_limit: None,
            gas_price: None,
            raw: None,
            hash: None,
            hash_history: Vec::new(),
            retry_count: 0,
            last_resubmitted_at: None,
            warning: None,
            error: None,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_hash(mut self, hash: H256) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// Maximum amount the sender must hold: value plus gas limit times gas price
    pub fn max_cost(&self) -> U256 {
        let gas = match (self.gas_limit, self.gas_price) {
            (Some(limit), Some(price)) => limit.saturating_mul(price),
            _ => U256::zero(),
        };
        self.value.saturating_add(gas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_cost_includes_gas() {
        let mut record = TransactionRecord::new(1, Address::zero(), TxStatus::Submitted)
            .with_value(U256::from(1_000));
        assert_eq!(record.max_cost(), U256::from(1_000));

        record.gas_limit = Some(U256::from(21_000));
        record.gas_price = Some(U256::from(2));
        assert_eq!(record.max_cost(), U256::from(43_000));

        record.value = U256::MAX;
        assert_eq!(record.max_cost(), U256::MAX);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TxStatus::Submitted).unwrap();
        assert_eq!(json, "\"submitted\"");
        assert!(TxStatus::Dropped.is_terminal());
        assert!(!TxStatus::Signed.is_terminal());
    }
}
