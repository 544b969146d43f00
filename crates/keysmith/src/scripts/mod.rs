//! Scripted store operations
//!
//! The lock and memoization services only talk to the store through the
//! traits in this module. Each operation is a single atomic transaction on the
//! store side; none of them retries.

pub mod memory;
pub mod redis;
pub mod registry;

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use keysmith_common::{Channel, Key, MemoKey, Result};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::registry::SubscriptionRegistry;

/// Receiver of pub/sub messages.
///
/// Called synchronously by the dispatcher; implementations must not block.
pub trait NotificationHandler: Send + Sync + 'static {
    fn handle(&self, channel: &str, payload: &[u8]);
}

/// Pub/sub half of a store backend.
///
/// A handler is identified by its `Arc` allocation: the same `Arc` passed to
/// `subscribe` must be passed to `unsubscribe`.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, channel: &Channel, handler: Arc<dyn NotificationHandler>)
    -> Result<()>;

    async fn unsubscribe(
        &self,
        channel: &Channel,
        handler: &Arc<dyn NotificationHandler>,
    ) -> Result<()>;
}

/// Parameters shared by the three lock transactions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockParameters {
    pub identifier: String,
    pub lock_key: String,
    pub waiting_list_key: String,
    pub waiting_set_key: String,
    pub channel: String,
    pub timeout_ms: u64,
}

impl LockParameters {
    pub fn new(identifier: impl Into<String>, key: &Key) -> Self {
        Self {
            identifier: identifier.into(),
            lock_key: key.lock_key(),
            waiting_list_key: key.waiting_list_key(),
            waiting_set_key: key.waiting_set_key(),
            channel: key.channel().name().to_string(),
            timeout_ms: key.expiration_ms(),
        }
    }
}

/// Where an identifier stands for a lock, as seen by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySituation {
    InQueue,
    Owner,
    NotFound,
    /// A code outside the protocol
    Unexpected(i64),
}

impl KeySituation {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => KeySituation::InQueue,
            1 => KeySituation::Owner,
            2 => KeySituation::NotFound,
            other => KeySituation::Unexpected(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            KeySituation::InQueue => 0,
            KeySituation::Owner => 1,
            KeySituation::NotFound => 2,
            KeySituation::Unexpected(code) => *code,
        }
    }
}

/// Lock transactions
#[async_trait]
pub trait ScriptLibrary: PubSub {
    /// Take the lock if free (publishing the new owner), otherwise join the queue.
    ///
    /// Returns `true` when `identifier` owns the lock afterwards, including
    /// when it already did.
    async fn acquire_or_enqueue(&self, parameters: &LockParameters) -> Result<bool>;

    /// Hand the lock to the next live waiter, or delete it when none is left.
    ///
    /// A caller that does not own the lock is only removed from the waiting set.
    async fn release_and_promote(&self, parameters: &LockParameters) -> Result<()>;

    async fn get_situation(&self, parameters: &LockParameters) -> Result<KeySituation>;
}

/// Parameters of the atomic set-and-publish memo transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoSetValueParameters {
    pub key: String,
    pub expiration_ms: u64,
    pub value: Bytes,
    pub channel: String,
}

impl MemoSetValueParameters {
    /// Cache a generated value and notify the value channel
    pub fn value(key: &MemoKey, value: Bytes) -> Self {
        Self {
            key: key.value_key(),
            expiration_ms: key.value_expiration_ms(),
            value,
            channel: key.value_channel().name().to_string(),
        }
    }

    /// Cache a generation failure and notify the error channel
    pub fn error(key: &MemoKey, error: &impl Display) -> Self {
        Self {
            key: key.error_key(),
            expiration_ms: key.value_expiration_ms(),
            value: Bytes::from(error.to_string()),
            channel: key.error_channel().name().to_string(),
        }
    }
}

/// Cached value and cached error of one memo key
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedValues {
    pub value: Option<Bytes>,
    pub error: Option<String>,
}

/// Memoization transactions
#[async_trait]
pub trait MemoScriptLibrary: PubSub {
    async fn publish(&self, parameters: &MemoSetValueParameters) -> Result<()>;

    /// Read value and error keys in one round trip
    async fn get_values(&self, value_key: &str, error_key: &str) -> Result<CachedValues>;

    /// Drop the cached value and error
    async fn invalidate(&self, key: &MemoKey) -> Result<()>;
}
