//! Compute-once memoization over the distributed lock

pub mod service;

pub use service::{MemoFailure, MemoLockService};
