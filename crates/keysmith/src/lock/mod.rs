//! Queued distributed lock

pub mod service;
pub mod state;
pub mod watchdog;

pub use service::LockService;
pub use state::{LockState, LockStatus};
pub use watchdog::Watchdog;
