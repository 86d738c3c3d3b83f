//! Nonce keeper - nonce allocation and pending transaction supervision
//!
//! Hands out per-address nonces that never collide, and watches broadcast
//! transactions until they are mined or can no longer succeed.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod state;
pub mod tx;

pub use error::{KeeperError, KeeperResult};
