//! Per-key mutual exclusion used to serialize work on one account address

mod registry;

pub use registry::{KeyGuard, KeyedMutex, GLOBAL_LOCK_KEY};
