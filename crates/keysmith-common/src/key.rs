//! Lock and memoization keys
//!
//! Both key types are immutable and only derive store key names; they never
//! touch the store themselves.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::error::{KeySmithError, Result};

/// Marker segment of the memo error notification channel
pub const MEMO_ERROR_CHANNEL_SEGMENT: &str = "/memoerrornotif:";

/// Marker segment of the memo value notification channel
pub const MEMO_VALUE_CHANNEL_SEGMENT: &str = "/memovaluenotif:";

/// A pub/sub channel, either literal or a glob pattern
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    pattern: bool,
}

impl Channel {
    pub fn literal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: false,
        }
    }

    pub fn pattern(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Longest expiration accepted for locks and memoized values (one year)
pub const MAX_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn ensure_positive(name: &str, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(KeySmithError::InvalidArgument(format!(
            "{} must be a positive duration",
            name
        )));
    }
    if duration > MAX_EXPIRATION {
        return Err(KeySmithError::InvalidArgument(format!(
            "{} must not exceed {:?}",
            name, MAX_EXPIRATION
        )));
    }
    Ok(())
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// A distributed lock resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    root: String,
    name: String,
    expiration: Duration,
}

impl Key {
    /// Create a key; `expiration` is the TTL applied to every store entry of the lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use keysmith_common::Key;
    /// use std::time::Duration;
    ///
    /// let key = Key::new("app", "orders", Duration::from_secs(1)).unwrap();
    /// assert_eq!(key.lock_key(), "app/lock:orders");
    /// assert!(Key::new("app", "orders", Duration::ZERO).is_err());
    /// ```
    pub fn new(
        root: impl Into<String>,
        name: impl Into<String>,
        expiration: Duration,
    ) -> Result<Self> {
        ensure_positive("lock expiration", expiration)?;
        Ok(Self {
            root: root.into(),
            name: name.into(),
            expiration,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// TTL in whole milliseconds, never below one
    pub fn expiration_ms(&self) -> u64 {
        whole_millis(self.expiration)
    }

    pub fn lock_key(&self) -> String {
        format!("{}/lock:{}", self.root, self.name)
    }

    pub fn waiting_list_key(&self) -> String {
        format!("{}/lockwaiting:{}", self.root, self.name)
    }

    pub fn waiting_set_key(&self) -> String {
        format!("{}/lockwaitingset:{}", self.root, self.name)
    }

    pub fn channel(&self) -> Channel {
        Channel::literal(format!("{}/locknotif:{}", self.root, self.name))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.root, self.name)
    }
}

/// A memoizable computation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoKey {
    root: String,
    name: String,
    value_expiration: Duration,
    lock_expiration: Duration,
}

impl MemoKey {
    pub fn new(
        root: impl Into<String>,
        name: impl Into<String>,
        value_expiration: Duration,
        lock_expiration: Duration,
    ) -> Result<Self> {
        ensure_positive("value expiration", value_expiration)?;
        ensure_positive("lock expiration", lock_expiration)?;
        Ok(Self {
            root: root.into(),
            name: name.into(),
            value_expiration,
            lock_expiration,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_expiration(&self) -> Duration {
        self.value_expiration
    }

    pub fn value_expiration_ms(&self) -> u64 {
        whole_millis(self.value_expiration)
    }

    pub fn lock_expiration(&self) -> Duration {
        self.lock_expiration
    }

    /// The key of the lock guarding generation
    pub fn lock_key(&self) -> Key {
        Key {
            root: self.root.clone(),
            name: self.name.clone(),
            expiration: self.lock_expiration,
        }
    }

    pub fn value_key(&self) -> String {
        format!("{}/{}", self.root, self.name)
    }

    pub fn error_key(&self) -> String {
        format!("{}/error:{}", self.root, self.name)
    }

    pub fn value_channel(&self) -> Channel {
        Channel::literal(format!(
            "{}{}{}",
            self.root, MEMO_VALUE_CHANNEL_SEGMENT, self.name
        ))
    }

    pub fn error_channel(&self) -> Channel {
        Channel::literal(format!(
            "{}{}{}",
            self.root, MEMO_ERROR_CHANNEL_SEGMENT, self.name
        ))
    }

    /// Pattern matching both the value and the error channel
    pub fn subscription_channel(&self) -> Channel {
        Channel::pattern(format!("{}/memo*notif:{}", self.root, self.name))
    }
}

impl Display for MemoKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.root, self.name)
    }
}

/// Whether a concrete channel name is a memo error channel
pub fn is_error_channel(channel: &str) -> bool {
    channel.contains(MEMO_ERROR_CHANNEL_SEGMENT)
}
