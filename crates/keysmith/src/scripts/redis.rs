//! Redis store backend
//!
//! Commands go through a multiplexed `ConnectionManager`. Notifications use a
//! dedicated pub/sub connection whose stream half is drained by one dispatcher
//! task feeding the shared [`SubscriptionRegistry`].

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, PubSubSink};
use ::redis::{Client, RedisError, Script};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keysmith_common::{Channel, KeySmithError, MemoKey, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    CachedValues, KeySituation, LockParameters, MemoScriptLibrary, MemoSetValueParameters,
    NotificationHandler, PubSub, ScriptLibrary, SubscriptionRegistry,
};

// KEYS: lock, waiting list, waiting set. ARGV: identifier, ttl (ms), channel.
const ACQUIRE_OR_ENQUEUE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return 1
end
if redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2], 'NX') then
    redis.call('PUBLISH', ARGV[3], ARGV[1])
    return 1
end
local length = redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], 1)
if length == 1 then
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    redis.call('PEXPIRE', KEYS[3], ARGV[2])
end
return 0
"#;

const RELEASE_AND_PROMOTE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    local candidate = redis.call('LPOP', KEYS[2])
    while candidate do
        if redis.call('HDEL', KEYS[3], candidate) == 1 then
            redis.call('SET', KEYS[1], candidate, 'PX', ARGV[2])
            redis.call('PEXPIRE', KEYS[3], ARGV[2])
            redis.call('PEXPIRE', KEYS[2], ARGV[2])
            redis.call('PUBLISH', ARGV[3], candidate)
            return 1
        end
        candidate = redis.call('LPOP', KEYS[2])
    end
    redis.call('UNLINK', KEYS[1], KEYS[2], KEYS[3])
    return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
return 0
"#;

const GET_SITUATION: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then
    return 0
end
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return 1
end
return 2
"#;

// KEYS: target key. ARGV: value, ttl (ms), channel.
const MEMO_SET_AND_PUBLISH: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
redis.call('PUBLISH', ARGV[3], ARGV[1])
return 1
"#;

fn store_error(e: RedisError) -> KeySmithError {
    KeySmithError::Store(e.to_string())
}

struct Scripts {
    acquire: Script,
    release: Script,
    situation: Script,
    memo_publish: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            acquire: Script::new(ACQUIRE_OR_ENQUEUE),
            release: Script::new(RELEASE_AND_PROMOTE),
            situation: Script::new(GET_SITUATION),
            memo_publish: Script::new(MEMO_SET_AND_PUBLISH),
        }
    }
}

/// Store backend talking to a Redis server
pub struct RedisStore {
    connection: ConnectionManager,
    subscriber: Mutex<PubSubSink>,
    registry: Arc<SubscriptionRegistry>,
    scripts: Scripts,
    dispatcher: JoinHandle<()>,
}

impl RedisStore {
    /// Open the command and pub/sub connections and start dispatching.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(store_error)?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(store_error)?;
        let (subscriber, mut messages) = client
            .get_async_pubsub()
            .await
            .map_err(store_error)?
            .split();

        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatch_registry = registry.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let subscription = if message.from_pattern() {
                    match message.get_pattern::<String>() {
                        Ok(pattern) => Channel::pattern(pattern),
                        Err(e) => {
                            warn!(error = %e, "Dropping pattern message without pattern");
                            continue;
                        }
                    }
                } else {
                    Channel::literal(message.get_channel_name())
                };
                dispatch_registry.dispatch(
                    &subscription,
                    message.get_channel_name(),
                    message.get_payload_bytes(),
                );
            }
            debug!("Pub/sub stream closed");
        });

        debug!(url = %url, "Connected to redis");
        Ok(Self {
            connection,
            subscriber: Mutex::new(subscriber),
            registry,
            scripts: Scripts::load(),
            dispatcher,
        })
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let count: i64 = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(count > 0)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let count: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(count > 0)
    }

    /// Remaining time to live; `None` when the key is missing or persistent
    pub async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut connection = self.connection.clone();
        let ttl: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok((ttl >= 0).then(|| Duration::from_millis(ttl as u64)))
    }

    async fn run_lock_script(&self, script: &Script, parameters: &LockParameters) -> Result<i64> {
        let mut connection = self.connection.clone();
        let result: i64 = script
            .key(&parameters.lock_key)
            .key(&parameters.waiting_list_key)
            .key(&parameters.waiting_set_key)
            .arg(&parameters.identifier)
            .arg(parameters.timeout_ms)
            .arg(&parameters.channel)
            .invoke_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(result)
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        // Registry changes and server commands are serialized by the sink lock.
        let mut subscriber = self.subscriber.lock().await;
        if !self.registry.add(channel, handler.clone()) {
            return Ok(());
        }

        let subscribed = if channel.is_pattern() {
            subscriber.psubscribe(channel.name()).await
        } else {
            subscriber.subscribe(channel.name()).await
        };
        if let Err(e) = subscribed {
            self.registry.remove(channel, &handler);
            return Err(store_error(e));
        }
        debug!(channel = %channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        channel: &Channel,
        handler: &Arc<dyn NotificationHandler>,
    ) -> Result<()> {
        let mut subscriber = self.subscriber.lock().await;
        if !self.registry.remove(channel, handler) {
            return Ok(());
        }

        let unsubscribed = if channel.is_pattern() {
            subscriber.punsubscribe(channel.name()).await
        } else {
            subscriber.unsubscribe(channel.name()).await
        };
        unsubscribed.map_err(store_error)?;
        debug!(channel = %channel, "Unsubscribed");
        Ok(())
    }
}

#[async_trait]
impl ScriptLibrary for RedisStore {
    async fn acquire_or_enqueue(&self, parameters: &LockParameters) -> Result<bool> {
        let granted = self
            .run_lock_script(&self.scripts.acquire, parameters)
            .await?;
        Ok(granted == 1)
    }

    async fn release_and_promote(&self, parameters: &LockParameters) -> Result<()> {
        self.run_lock_script(&self.scripts.release, parameters)
            .await?;
        Ok(())
    }

    async fn get_situation(&self, parameters: &LockParameters) -> Result<KeySituation> {
        let code = self
            .run_lock_script(&self.scripts.situation, parameters)
            .await?;
        Ok(KeySituation::from_code(code))
    }
}

#[async_trait]
impl MemoScriptLibrary for RedisStore {
    async fn publish(&self, parameters: &MemoSetValueParameters) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = self
            .scripts
            .memo_publish
            .key(&parameters.key)
            .arg(parameters.value.as_ref())
            .arg(parameters.expiration_ms)
            .arg(&parameters.channel)
            .invoke_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get_values(&self, value_key: &str, error_key: &str) -> Result<CachedValues> {
        let mut connection = self.connection.clone();
        let (value, error): (Option<Vec<u8>>, Option<Vec<u8>>) = ::redis::cmd("MGET")
            .arg(value_key)
            .arg(error_key)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(CachedValues {
            value: value.map(Bytes::from),
            error: error.map(|e| String::from_utf8_lossy(&e).into_owned()),
        })
    }

    async fn invalidate(&self, key: &MemoKey) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = ::redis::cmd("DEL")
            .arg(key.value_key())
            .arg(key.error_key())
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
