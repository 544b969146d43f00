//! Memoization service
//!
//! `memo_lock` races two paths: a notification published by whoever computed
//! the value first, and computing it ourselves under the distributed lock.
//! The generator runs at most once per key across every process sharing the
//! store, and failures are cached like values.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use keysmith_common::{Channel, KeySmithError, MemoKey, is_error_channel};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lock::LockService;
use crate::scripts::{CachedValues, MemoScriptLibrary, MemoSetValueParameters, NotificationHandler};

type Notification = Result<Bytes, KeySmithError>;

/// Why the compute path did not produce a value
#[derive(Debug)]
pub enum MemoFailure<E> {
    /// Locking, caching or cancellation failure
    Lock(KeySmithError),
    /// The local generator failed
    Generator(E),
}

impl<E> From<KeySmithError> for MemoFailure<E> {
    fn from(e: KeySmithError) -> Self {
        MemoFailure::Lock(e)
    }
}

/// Resolves the first memo notification and stops the compute path
struct MemoNotificationHandler {
    sender: Mutex<Option<oneshot::Sender<Notification>>>,
    source: CancellationToken,
}

impl NotificationHandler for MemoNotificationHandler {
    fn handle(&self, channel: &str, payload: &[u8]) {
        let notification = if is_error_channel(channel) {
            Err(KeySmithError::Generation(
                String::from_utf8_lossy(payload).into_owned(),
            ))
        } else {
            Ok(Bytes::copy_from_slice(payload))
        };
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(notification);
        }
        self.source.cancel();
    }
}

/// Unsubscribes when `memo_lock` is dropped before cleaning up.
struct SubscriptionGuard {
    library: Arc<dyn MemoScriptLibrary>,
    channel: Channel,
    handler: Arc<dyn NotificationHandler>,
    armed: bool,
}

impl SubscriptionGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let library = self.library.clone();
        let channel = self.channel.clone();
        let handler = self.handler.clone();
        runtime.spawn(async move {
            if let Err(e) = library.unsubscribe(&channel, &handler).await {
                warn!(channel = %channel, error = %e, "Failed to unsubscribe abandoned memo call");
            }
        });
    }
}

/// Compute-once cache backed by the distributed lock
#[derive(Clone)]
pub struct MemoLockService {
    library: Arc<dyn MemoScriptLibrary>,
    locks: LockService,
}

impl MemoLockService {
    pub fn new(library: Arc<dyn MemoScriptLibrary>, locks: LockService) -> Self {
        Self { library, locks }
    }

    /// Return the value of `key`, running `generator` if nobody has yet.
    ///
    /// Callers that did not run the generator see a cached or broadcast
    /// failure as [`KeySmithError::Generation`]. The caller whose generator
    /// failed gets its own error back.
    pub async fn memo_lock<E, F, Fut>(
        &self,
        key: &MemoKey,
        generator: F,
        cancel: &CancellationToken,
    ) -> Result<Bytes, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: From<KeySmithError> + Display,
    {
        if cancel.is_cancelled() {
            return Err(KeySmithError::Cancelled.into());
        }

        let source = cancel.child_token();
        let (sender, mut notification) = oneshot::channel();
        let handler: Arc<dyn NotificationHandler> = Arc::new(MemoNotificationHandler {
            sender: Mutex::new(Some(sender)),
            source: source.clone(),
        });
        let channel = key.subscription_channel();
        self.library.subscribe(&channel, handler.clone()).await?;
        let guard = SubscriptionGuard {
            library: self.library.clone(),
            channel: channel.clone(),
            handler: handler.clone(),
            armed: true,
        };

        let work = self.compute(key, generator, &source);
        tokio::pin!(work);
        let first = tokio::select! {
            biased;
            computed = &mut work => Ok(computed),
            notified = &mut notification => Err(notified),
        };
        let outcome = match first {
            Ok(computed) => computed,
            Err(notified) => {
                debug!(key = %key, "Memo value received by notification");
                source.cancel();
                match work.await {
                    Err(MemoFailure::Lock(e)) => match notified {
                        Ok(broadcast) => broadcast.map_err(MemoFailure::Lock),
                        Err(_) => Err(MemoFailure::Lock(e)),
                    },
                    computed => computed,
                }
            }
        };

        let unsubscribed = self.library.unsubscribe(&channel, &handler).await;
        guard.disarm();

        match outcome {
            Ok(value) => {
                unsubscribed?;
                Ok(value)
            }
            Err(failure) => {
                if let Err(e) = unsubscribed {
                    warn!(key = %key, error = %e, "Failed to unsubscribe after memo failure");
                }
                match failure {
                    MemoFailure::Lock(e) => Err(e.into()),
                    MemoFailure::Generator(e) => Err(e),
                }
            }
        }
    }

    /// [`memo_lock`](Self::memo_lock) for values stored as JSON.
    pub async fn memo_lock_json<T, E, F, Fut>(
        &self,
        key: &MemoKey,
        generator: F,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeySmithError> + Display,
    {
        let bytes = self
            .memo_lock::<E, _, _>(
                key,
                |token| async move {
                    let value = generator(token).await?;
                    let encoded = serde_json::to_vec(&value).map_err(|e| {
                        KeySmithError::InvalidArgument(format!("cannot encode memo value: {}", e))
                    })?;
                    Ok::<_, E>(Bytes::from(encoded))
                },
                cancel,
            )
            .await?;

        serde_json::from_slice(&bytes).map_err(|e| {
            KeySmithError::ProtocolViolation(format!("cannot decode memo value of {}: {}", key, e))
                .into()
        })
    }

    /// Read the cached outcome without waiting or computing
    pub async fn cached(&self, key: &MemoKey) -> keysmith_common::Result<Option<Bytes>> {
        match self.lookup(key).await? {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Drop the cached value and error of `key`
    pub async fn invalidate(&self, key: &MemoKey) -> keysmith_common::Result<()> {
        self.library.invalidate(key).await?;
        debug!(key = %key, "Memo value invalidated");
        Ok(())
    }

    async fn lookup(&self, key: &MemoKey) -> keysmith_common::Result<Option<Notification>> {
        let cached = self
            .library
            .get_values(&key.value_key(), &key.error_key())
            .await?;
        Ok(match cached {
            CachedValues {
                value: Some(value), ..
            } => Some(Ok(value)),
            CachedValues {
                error: Some(message),
                ..
            } => Some(Err(KeySmithError::Generation(message))),
            _ => None,
        })
    }

    async fn compute<E, F, Fut>(
        &self,
        key: &MemoKey,
        generator: F,
        source: &CancellationToken,
    ) -> Result<Bytes, MemoFailure<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: Display,
    {
        if source.is_cancelled() {
            return Err(MemoFailure::Lock(KeySmithError::Cancelled));
        }
        if let Some(cached) = self.lookup(key).await? {
            return cached.map_err(MemoFailure::Lock);
        }
        if source.is_cancelled() {
            return Err(MemoFailure::Lock(KeySmithError::Cancelled));
        }

        let locked = self
            .locks
            .lock(
                &key.lock_key(),
                |token| async move {
                    // the value may have landed while we were queued
                    if let Some(cached) = self.lookup(key).await? {
                        return cached.map_err(MemoFailure::Lock);
                    }
                    if token.is_cancelled() {
                        return Err(MemoFailure::Lock(KeySmithError::Cancelled));
                    }
                    self.generate(key, generator, token).await
                },
                source,
            )
            .await;

        match locked {
            Err(MemoFailure::Lock(e)) if e.is_cancelled() => match self.lookup(key).await {
                Ok(Some(cached)) => cached.map_err(MemoFailure::Lock),
                _ => Err(MemoFailure::Lock(e)),
            },
            other => other,
        }
    }

    async fn generate<E, F, Fut>(
        &self,
        key: &MemoKey,
        generator: F,
        token: CancellationToken,
    ) -> Result<Bytes, MemoFailure<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: Display,
    {
        match generator(token).await {
            Ok(value) => {
                self.library
                    .publish(&MemoSetValueParameters::value(key, value.clone()))
                    .await?;
                debug!(key = %key, "Memo value generated");
                Ok(value)
            }
            Err(e) => {
                if let Err(publish_error) = self
                    .library
                    .publish(&MemoSetValueParameters::error(key, &e))
                    .await
                {
                    warn!(key = %key, error = %publish_error, "Failed to cache generation failure");
                }
                debug!(key = %key, error = %e, "Memo generation failed");
                Err(MemoFailure::Generator(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::scripts::MemoryStore;

    fn service(store: &Arc<MemoryStore>) -> MemoLockService {
        MemoLockService::new(store.clone(), LockService::new(store.clone()))
    }

    fn key(name: &str) -> MemoKey {
        MemoKey::new("memo", name, Duration::from_secs(60), Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_generates_once_then_serves_cache() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("once");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<Bytes, KeySmithError> = memo
                .memo_lock(
                    &key,
                    |_| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Bytes::from_static(b"42"))
                    },
                    &CancellationToken::new(),
                )
                .await;
            assert_eq!(value.unwrap(), Bytes::from_static(b"42"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.registry().is_subscribed(&key.subscription_channel()));
        assert!(!store.exists(&key.lock_key().lock_key()));
    }

    #[tokio::test]
    async fn test_cached_error_is_a_generation_error() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("failing");

        let first: Result<Bytes, KeySmithError> = memo
            .memo_lock(
                &key,
                |_| async { Err(KeySmithError::InvalidArgument("bad input".to_string())) },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(first.unwrap_err(), KeySmithError::InvalidArgument(_)));

        let second: Result<Bytes, KeySmithError> = memo
            .memo_lock(
                &key,
                |_| async { Ok(Bytes::from_static(b"never")) },
                &CancellationToken::new(),
            )
            .await;
        let err = second.unwrap_err();
        assert!(err.is_generation());
        assert_eq!(err.generation_message(), Some("invalid argument: bad input"));

        assert!(!store.exists(&key.value_key()));
        assert!(store.pttl(&key.error_key()).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_cached() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("invalidate");

        assert_eq!(memo.cached(&key).await.unwrap(), None);
        let _: Bytes = memo
            .memo_lock::<KeySmithError, _, _>(
                &key,
                |_| async { Ok(Bytes::from_static(b"v")) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(memo.cached(&key).await.unwrap(), Some(Bytes::from_static(b"v")));

        memo.invalidate(&key).await.unwrap();
        assert_eq!(memo.cached(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("json");

        let value: Vec<u32> = memo
            .memo_lock_json::<_, KeySmithError, _, _>(
                &key,
                |_| async { Ok(vec![1, 2, 3]) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(store.get(&key.value_key()), Some(Bytes::from_static(b"[1,2,3]")));
    }

    #[tokio::test]
    async fn test_json_decode_failure_is_a_protocol_violation() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("garbage");
        store.set(&key.value_key(), "not json", Duration::from_secs(60));

        let result: Result<Vec<u32>, KeySmithError> = memo
            .memo_lock_json(&key, |_| async { Ok(vec![1]) }, &CancellationToken::new())
            .await;
        assert!(matches!(result.unwrap_err(), KeySmithError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_notification_short_circuits_waiting() {
        let store = MemoryStore::shared();
        let memo = service(&store);
        let key = key("notified");

        // someone else holds the generation lock
        store.set(&key.lock_key().lock_key(), "other", Duration::from_secs(30));

        let waiter = {
            let memo = memo.clone();
            let key = key.clone();
            tokio::spawn(async move {
                memo.memo_lock::<KeySmithError, _, _>(
                    &key,
                    |_| async { Ok(Bytes::from_static(b"local")) },
                    &CancellationToken::new(),
                )
                .await
            })
        };

        // wait until the waiter has subscribed
        while !store.registry().is_subscribed(&key.subscription_channel()) {
            tokio::task::yield_now().await;
        }
        store.set(&key.value_key(), "remote", Duration::from_secs(60));
        store.publish(key.value_channel().name(), "remote");

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value, Bytes::from_static(b"remote"));
    }
}
