//! In-process store backend
//!
//! Implements the lock and memo transactions with the same semantics as the
//! Redis scripts, on top of a mutex-guarded key space. Expiry is measured on
//! the tokio clock, so paused-time tests can advance TTLs deterministically.
//! Messages are dispatched after the key space lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keysmith_common::{Channel, KeySmithError, MemoKey, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{
    CachedValues, KeySituation, LockParameters, MemoScriptLibrary, MemoSetValueParameters,
    NotificationHandler, PubSub, ScriptLibrary, SubscriptionRegistry,
};

enum Value {
    String(Bytes),
    List(VecDeque<String>),
    Hash(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct KeySpace {
    entries: HashMap<String, Entry>,
}

/// Expiry instant for a TTL; one too far out to represent never expires
fn deadline(ttl_ms: u64) -> Option<Instant> {
    Instant::now().checked_add(Duration::from_millis(ttl_ms))
}

impl KeySpace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn get(&mut self, key: &str) -> Option<Bytes> {
        match self.live(key) {
            Some(Entry {
                value: Value::String(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        }
    }

    fn set(&mut self, key: &str, value: Bytes, ttl_ms: u64) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value),
                expires_at: deadline(ttl_ms),
            },
        );
    }

    fn pexpire(&mut self, key: &str, ttl_ms: u64) {
        if let Some(entry) = self.live(key) {
            entry.expires_at = deadline(ttl_ms);
        }
    }

    fn rpush(&mut self, key: &str, member: &str) {
        if !self.exists(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(Entry {
            value: Value::List(list),
            ..
        }) = self.entries.get_mut(key)
        {
            list.push_back(member.to_string());
        }
    }

    fn lpop(&mut self, key: &str) -> Option<String> {
        let (next, emptied) = match self.live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let next = list.pop_front();
                (next, list.is_empty())
            }
            _ => return None,
        };
        if emptied {
            self.entries.remove(key);
        }
        next
    }

    fn hset(&mut self, key: &str, field: &str) {
        if !self.exists(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(Entry {
            value: Value::Hash(fields),
            ..
        }) = self.entries.get_mut(key)
        {
            fields.insert(field.to_string());
        }
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let (removed, emptied) = match self.live(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => {
                let removed = fields.remove(field);
                (removed, fields.is_empty())
            }
            _ => return false,
        };
        if emptied {
            self.entries.remove(key);
        }
        removed
    }

    fn hexists(&mut self, key: &str, field: &str) -> bool {
        matches!(
            self.live(key),
            Some(Entry { value: Value::Hash(fields), .. }) if fields.contains(field)
        )
    }

    fn delete(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }
}

/// In-memory backend implementing both script libraries
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<KeySpace>,
    registry: SubscriptionRegistry,
    pending_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` scripted operations fail with a store error
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(KeySmithError::Store("injected failure".to_string()));
        }
        Ok(())
    }

    fn deliver(&self, messages: Vec<(String, Bytes)>) {
        for (channel, payload) in messages {
            let delivered = self.registry.publish(&channel, &payload);
            debug!(channel = %channel, delivered, "Published notification");
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.keys.lock().exists(key)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.keys.lock().get(key)
    }

    pub fn set(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) {
        self.keys
            .lock()
            .set(key, value.into(), u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1));
    }

    /// Remaining time to live; `None` when the key is missing or persistent
    pub fn pttl(&self, key: &str) -> Option<Duration> {
        let mut keys = self.keys.lock();
        keys.live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.keys.lock().delete(key)
    }

    pub fn list_members(&self, key: &str) -> Vec<String> {
        match self.keys.lock().live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn hash_contains(&self, key: &str, field: &str) -> bool {
        self.keys.lock().hexists(key, field)
    }

    /// Add or remove a waiting-set member without touching the waiting list
    pub fn set_hash_member(&self, key: &str, field: &str, present: bool) {
        let mut keys = self.keys.lock();
        if present {
            keys.hset(key, field);
        } else {
            keys.hdel(key, field);
        }
    }

    /// Publish a raw message, returning the number of handlers reached
    pub fn publish(&self, channel: &str, payload: impl AsRef<[u8]>) -> usize {
        self.registry.publish(channel, payload.as_ref())
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        self.registry.add(channel, handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        channel: &Channel,
        handler: &Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        self.registry.remove(channel, handler);
        Ok(())
    }
}

#[async_trait]
impl ScriptLibrary for MemoryStore {
    async fn acquire_or_enqueue(&self, parameters: &LockParameters) -> Result<bool> {
        self.check_failure()?;
        let identifier = parameters.identifier.as_str();
        let mut messages = Vec::new();

        let granted = {
            let mut keys = self.keys.lock();
            if keys.get(&parameters.lock_key).as_deref() == Some(identifier.as_bytes()) {
                true
            } else if !keys.exists(&parameters.lock_key) {
                keys.set(
                    &parameters.lock_key,
                    Bytes::copy_from_slice(identifier.as_bytes()),
                    parameters.timeout_ms,
                );
                messages.push((
                    parameters.channel.clone(),
                    Bytes::copy_from_slice(identifier.as_bytes()),
                ));
                true
            } else {
                let first = !keys.exists(&parameters.waiting_list_key);
                keys.rpush(&parameters.waiting_list_key, identifier);
                keys.hset(&parameters.waiting_set_key, identifier);
                if first {
                    keys.pexpire(&parameters.waiting_list_key, parameters.timeout_ms);
                    keys.pexpire(&parameters.waiting_set_key, parameters.timeout_ms);
                }
                false
            }
        };

        self.deliver(messages);
        Ok(granted)
    }

    async fn release_and_promote(&self, parameters: &LockParameters) -> Result<()> {
        self.check_failure()?;
        let identifier = parameters.identifier.as_str();
        let mut messages = Vec::new();

        {
            let mut keys = self.keys.lock();
            if keys.get(&parameters.lock_key).as_deref() == Some(identifier.as_bytes()) {
                let mut next = keys.lpop(&parameters.waiting_list_key);
                while let Some(candidate) = next.as_deref() {
                    if keys.hdel(&parameters.waiting_set_key, candidate) {
                        break;
                    }
                    next = keys.lpop(&parameters.waiting_list_key);
                }

                match next {
                    Some(next) => {
                        let payload = Bytes::from(next);
                        keys.set(&parameters.lock_key, payload.clone(), parameters.timeout_ms);
                        keys.pexpire(&parameters.waiting_set_key, parameters.timeout_ms);
                        keys.pexpire(&parameters.waiting_list_key, parameters.timeout_ms);
                        messages.push((parameters.channel.clone(), payload));
                    }
                    None => {
                        keys.delete(&parameters.lock_key);
                        keys.delete(&parameters.waiting_list_key);
                        keys.delete(&parameters.waiting_set_key);
                    }
                }
            } else {
                keys.hdel(&parameters.waiting_set_key, identifier);
            }
        }

        self.deliver(messages);
        Ok(())
    }

    async fn get_situation(&self, parameters: &LockParameters) -> Result<KeySituation> {
        self.check_failure()?;
        let mut keys = self.keys.lock();
        let situation = if keys.hexists(&parameters.waiting_set_key, &parameters.identifier) {
            KeySituation::InQueue
        } else if keys.get(&parameters.lock_key).as_deref()
            == Some(parameters.identifier.as_bytes())
        {
            KeySituation::Owner
        } else {
            KeySituation::NotFound
        };
        Ok(situation)
    }
}

#[async_trait]
impl MemoScriptLibrary for MemoryStore {
    async fn publish(&self, parameters: &MemoSetValueParameters) -> Result<()> {
        self.check_failure()?;
        self.keys.lock().set(
            &parameters.key,
            parameters.value.clone(),
            parameters.expiration_ms,
        );
        self.deliver(vec![(parameters.channel.clone(), parameters.value.clone())]);
        Ok(())
    }

    async fn get_values(&self, value_key: &str, error_key: &str) -> Result<CachedValues> {
        self.check_failure()?;
        let mut keys = self.keys.lock();
        Ok(CachedValues {
            value: keys.get(value_key),
            error: keys
                .get(error_key)
                .map(|e| String::from_utf8_lossy(&e).into_owned()),
        })
    }

    async fn invalidate(&self, key: &MemoKey) -> Result<()> {
        self.check_failure()?;
        let mut keys = self.keys.lock();
        keys.delete(&key.value_key());
        keys.delete(&key.error_key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysmith_common::Key;

    struct Recorder(Mutex<Vec<String>>);

    impl NotificationHandler for Recorder {
        fn handle(&self, _channel: &str, payload: &[u8]) {
            self.0.lock().push(String::from_utf8_lossy(payload).into_owned());
        }
    }

    fn key(ttl_ms: u64) -> Key {
        Key::new("mem", "lock", Duration::from_millis(ttl_ms)).unwrap()
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set("far", "v", Duration::MAX);
        assert_eq!(store.get("far"), Some(Bytes::from_static(b"v")));
        assert_eq!(store.pttl("far"), None);
    }

    #[tokio::test]
    async fn test_acquire_sets_value_with_ttl_and_publishes() {
        let store = MemoryStore::new();
        let key = key(1000);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.subscribe(&key.channel(), recorder.clone()).await.unwrap();

        let parameters = LockParameters::new("a", &key);
        assert!(store.acquire_or_enqueue(&parameters).await.unwrap());

        assert_eq!(store.get(&key.lock_key()), Some(Bytes::from_static(b"a")));
        assert!(store.pttl(&key.lock_key()).unwrap() <= Duration::from_millis(1000));
        assert_eq!(*recorder.0.lock(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_reentry_is_idempotent() {
        let store = MemoryStore::new();
        let key = key(1000);
        let parameters = LockParameters::new("a", &key);

        assert!(store.acquire_or_enqueue(&parameters).await.unwrap());
        assert!(store.acquire_or_enqueue(&parameters).await.unwrap());
        assert!(!store.exists(&key.waiting_list_key()));
        assert!(!store.exists(&key.waiting_set_key()));
    }

    #[tokio::test]
    async fn test_enqueue_sets_ttl_on_first_entry() {
        let store = MemoryStore::new();
        let key = key(1000);
        store
            .acquire_or_enqueue(&LockParameters::new("a", &key))
            .await
            .unwrap();

        assert!(!store
            .acquire_or_enqueue(&LockParameters::new("b", &key))
            .await
            .unwrap());
        assert!(!store
            .acquire_or_enqueue(&LockParameters::new("c", &key))
            .await
            .unwrap());

        assert_eq!(store.list_members(&key.waiting_list_key()), vec!["b", "c"]);
        assert!(store.hash_contains(&key.waiting_set_key(), "b"));
        assert!(store.pttl(&key.waiting_list_key()).is_some());
        assert!(store.pttl(&key.waiting_set_key()).is_some());
    }

    #[tokio::test]
    async fn test_release_promotes_next_and_skips_ghosts() {
        let store = MemoryStore::new();
        let key = key(1000);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.subscribe(&key.channel(), recorder.clone()).await.unwrap();

        let a = LockParameters::new("a", &key);
        let b = LockParameters::new("b", &key);
        let c = LockParameters::new("c", &key);
        store.acquire_or_enqueue(&a).await.unwrap();
        store.acquire_or_enqueue(&b).await.unwrap();
        store.acquire_or_enqueue(&c).await.unwrap();

        // b gives up while queued: only its set membership goes away
        store.release_and_promote(&b).await.unwrap();
        assert_eq!(store.list_members(&key.waiting_list_key()), vec!["b", "c"]);
        assert!(!store.hash_contains(&key.waiting_set_key(), "b"));

        store.release_and_promote(&a).await.unwrap();
        assert_eq!(store.get(&key.lock_key()), Some(Bytes::from_static(b"c")));
        assert_eq!(*recorder.0.lock(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(
            store.get_situation(&c).await.unwrap(),
            KeySituation::Owner
        );

        store.release_and_promote(&c).await.unwrap();
        assert!(!store.exists(&key.lock_key()));
        assert!(!store.exists(&key.waiting_list_key()));
        assert!(!store.exists(&key.waiting_set_key()));
    }

    #[tokio::test]
    async fn test_situation() {
        let store = MemoryStore::new();
        let key = key(1000);
        let a = LockParameters::new("a", &key);
        let b = LockParameters::new("b", &key);
        let z = LockParameters::new("z", &key);

        store.acquire_or_enqueue(&a).await.unwrap();
        store.acquire_or_enqueue(&b).await.unwrap();

        assert_eq!(store.get_situation(&a).await.unwrap(), KeySituation::Owner);
        assert_eq!(store.get_situation(&b).await.unwrap(), KeySituation::InQueue);
        assert_eq!(store.get_situation(&z).await.unwrap(), KeySituation::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        let key = key(100);
        store
            .acquire_or_enqueue(&LockParameters::new("a", &key))
            .await
            .unwrap();
        assert!(store.exists(&key.lock_key()));

        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(!store.exists(&key.lock_key()));
        assert!(store
            .acquire_or_enqueue(&LockParameters::new("b", &key))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        let key = key(1000);
        store.fail_next(1);
        let err = store
            .acquire_or_enqueue(&LockParameters::new("a", &key))
            .await
            .unwrap_err();
        assert!(matches!(err, KeySmithError::Store(_)));
        assert!(store
            .acquire_or_enqueue(&LockParameters::new("a", &key))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memo_publish_and_read() {
        let store = MemoryStore::new();
        let key = MemoKey::new(
            "mem",
            "value",
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store
            .subscribe(&key.subscription_channel(), recorder.clone())
            .await
            .unwrap();

        MemoScriptLibrary::publish(
            &store,
            &MemoSetValueParameters::value(&key, Bytes::from_static(b"v1")),
        )
        .await
        .unwrap();

        let cached = store
            .get_values(&key.value_key(), &key.error_key())
            .await
            .unwrap();
        assert_eq!(cached.value, Some(Bytes::from_static(b"v1")));
        assert_eq!(cached.error, None);
        assert_eq!(*recorder.0.lock(), vec!["v1".to_string()]);

        store.invalidate(&key).await.unwrap();
        let cached = store
            .get_values(&key.value_key(), &key.error_key())
            .await
            .unwrap();
        assert_eq!(cached, CachedValues::default());
    }
}
