//! Transaction module with nonce allocation and pending transaction supervision

mod nonce;
mod record;
mod supervisor;
mod tracker;

pub use nonce::{GlobalLock, NonceAllocator, NonceDetails, NonceLock};
pub use record::{TransactionRecord, TxStatus, TxWarning};
pub use supervisor::{is_known_broadcast_error, PendingTxSupervisor};
pub use tracker::{SignedTransaction, SubmissionTracker, TrackedTransaction};
