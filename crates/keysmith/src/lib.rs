//! KeySmith - Fair distributed lock and compute-once memoization
//!
//! This crate provides:
//! - A FIFO distributed lock coordinated through Redis scripts and pub/sub
//! - A watchdog recovering attempts whose notifications were lost
//! - A memoization layer running each generator once across all processes
//! - Redis and in-memory store backends
//!
//! # Example
//!
//! ```no_run
//! use keysmith::{KeySmith, KeySmithConfig, KeySmithError};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), KeySmithError> {
//! let config = KeySmithConfig::load(None)?;
//! let keysmith = KeySmith::connect(&config).await?;
//! let key = config.key("nightly-report")?;
//!
//! keysmith
//!     .locks()
//!     .run(&key, |_token| async { Ok::<_, KeySmithError>(()) }, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod lock;
pub mod memo;
pub mod scripts;

pub use client::KeySmith;
pub use config::KeySmithConfig;
pub use lock::{LockService, LockState, LockStatus, Watchdog};
pub use memo::{MemoFailure, MemoLockService};
pub use scripts::{
    KeySituation, LockParameters, MemoScriptLibrary, MemoryStore, NotificationHandler, PubSub,
    RedisStore, ScriptLibrary,
};

// Shared types
pub use keysmith_common::{
    Channel, IdentifierGenerator, Key, KeySmithError, MAX_EXPIRATION, MemoKey, Result,
    generate_unique_key,
};
