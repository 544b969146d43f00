//! `KeySmith` entry point wiring both services to one backend

use std::sync::Arc;

use keysmith_common::{IdentifierGenerator, Result};
use tracing::info;

use crate::config::KeySmithConfig;
use crate::lock::LockService;
use crate::memo::MemoLockService;
use crate::scripts::{MemoScriptLibrary, MemoryStore, RedisStore, ScriptLibrary};

/// Lock and memo services sharing one store
#[derive(Clone)]
pub struct KeySmith {
    config: Arc<KeySmithConfig>,
    locks: LockService,
    memo: MemoLockService,
}

impl KeySmith {
    /// Connect to the Redis server named by `config.redis_url`
    pub async fn connect(config: &KeySmithConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        info!(url = %config.redis_url, root = %config.root, "KeySmith connected");
        Ok(Self::with_backend(config.clone(), store.clone(), store))
    }

    /// Single-process instance backed by a [`MemoryStore`]
    pub fn in_memory(config: &KeySmithConfig) -> Result<Self> {
        config.validate()?;
        let store = MemoryStore::shared();
        Ok(Self::with_backend(config.clone(), store.clone(), store))
    }

    pub fn with_backend(
        config: KeySmithConfig,
        locks: Arc<dyn ScriptLibrary>,
        memo: Arc<dyn MemoScriptLibrary>,
    ) -> Self {
        let identifiers = IdentifierGenerator::new(config.identifier_size);
        let locks = LockService::with_identifiers(locks, identifiers);
        let memo = MemoLockService::new(memo, locks.clone());
        Self {
            config: Arc::new(config),
            locks,
            memo,
        }
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    pub fn memo(&self) -> &MemoLockService {
        &self.memo
    }

    pub fn config(&self) -> &KeySmithConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keysmith_common::KeySmithError;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let config = KeySmithConfig {
            root: "facade".to_string(),
            ..Default::default()
        };
        let keysmith = KeySmith::in_memory(&config).unwrap();
        assert_eq!(keysmith.config().root, "facade");

        let key = config.key("job").unwrap();
        let doubled: Result<u32> = keysmith
            .locks()
            .lock(&key, |_| async { Ok(21 * 2) }, &CancellationToken::new())
            .await;
        assert_eq!(doubled.unwrap(), 42);

        let memo_key = config.memo_key("report").unwrap();
        let value = keysmith
            .memo()
            .memo_lock::<KeySmithError, _, _>(
                &memo_key,
                |_| async { Ok(Bytes::from_static(b"ready")) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"ready"));
    }

    #[test]
    fn test_in_memory_rejects_invalid_config() {
        let config = KeySmithConfig {
            identifier_size: 0,
            ..Default::default()
        };
        assert!(KeySmith::in_memory(&config).is_err());
    }
}
