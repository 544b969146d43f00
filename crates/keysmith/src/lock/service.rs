//! Lock service
//!
//! Runs one attempt end to end: subscribe, acquire or enqueue, wait under
//! watchdog protection, invoke the callback, release, unsubscribe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keysmith_common::{Channel, IdentifierGenerator, Key, KeySmithError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::state::LockState;
use super::watchdog::Watchdog;
use crate::scripts::{NotificationHandler, ScriptLibrary};

enum Failure<E> {
    Lock(KeySmithError),
    Callback(E),
}

/// Releases the attempt when the lock future is dropped before cleaning up.
struct CleanupGuard {
    library: Arc<dyn ScriptLibrary>,
    state: Arc<LockState>,
    channel: Channel,
    handler: Arc<dyn NotificationHandler>,
    armed: bool,
}

impl CleanupGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.set_done(None);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.state.key(), "No runtime to release abandoned lock attempt");
            return;
        };
        let library = self.library.clone();
        let state = self.state.clone();
        let channel = self.channel.clone();
        let handler = self.handler.clone();
        runtime.spawn(async move {
            if let Err(e) = library.release_and_promote(state.parameters()).await {
                warn!(key = %state.key(), error = %e, "Failed to release abandoned lock attempt");
            }
            if let Err(e) = library.unsubscribe(&channel, &handler).await {
                warn!(key = %state.key(), error = %e, "Failed to unsubscribe abandoned lock attempt");
            }
        });
    }
}

/// Fair FIFO distributed lock
#[derive(Clone)]
pub struct LockService {
    library: Arc<dyn ScriptLibrary>,
    identifiers: IdentifierGenerator,
}

impl LockService {
    pub fn new(library: Arc<dyn ScriptLibrary>) -> Self {
        Self::with_identifiers(library, IdentifierGenerator::default())
    }

    pub fn with_identifiers(library: Arc<dyn ScriptLibrary>, identifiers: IdentifierGenerator) -> Self {
        Self {
            library,
            identifiers,
        }
    }

    pub fn library(&self) -> &Arc<dyn ScriptLibrary> {
        &self.library
    }

    /// Run `callback` while holding `key` and return its value.
    ///
    /// Callers are served in the order the store queued them. The callback
    /// receives a token that fires when the caller cancels or the lock is
    /// lost. Errors returned by the callback come back unchanged once the
    /// lock has been released.
    pub async fn lock<T, E, F, Fut>(
        &self,
        key: &Key,
        callback: F,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeySmithError>,
    {
        self.execute(key, None, callback, cancel).await
    }

    /// Run `callback` while holding `key`.
    pub async fn run<E, F, Fut>(
        &self,
        key: &Key,
        callback: F,
        cancel: &CancellationToken,
    ) -> Result<(), E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<KeySmithError>,
    {
        self.execute(key, None, callback, cancel).await
    }

    /// Like [`lock`](Self::lock), giving up with
    /// [`KeySmithError::Timeout`] when the key is not granted within `wait`.
    pub async fn lock_with_timeout<T, E, F, Fut>(
        &self,
        key: &Key,
        wait: Duration,
        callback: F,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeySmithError>,
    {
        self.execute(key, Some(wait), callback, cancel).await
    }

    async fn execute<T, E, F, Fut>(
        &self,
        key: &Key,
        wait: Option<Duration>,
        callback: F,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeySmithError>,
    {
        if cancel.is_cancelled() {
            return Err(KeySmithError::Cancelled.into());
        }

        let state = Arc::new(LockState::new(
            key.clone(),
            self.identifiers.generate(),
            cancel,
        ));
        let channel = key.channel();
        let handler: Arc<dyn NotificationHandler> = state.clone();
        self.library.subscribe(&channel, handler.clone()).await?;

        let guard = CleanupGuard {
            library: self.library.clone(),
            state: state.clone(),
            channel: channel.clone(),
            handler: handler.clone(),
            armed: true,
        };

        let mut watchdog = None;
        let outcome = match self.library.acquire_or_enqueue(state.parameters()).await {
            Ok(granted) => {
                if granted {
                    debug!(key = %key, identifier = %state.identifier(), "Lock granted immediately");
                } else {
                    debug!(key = %key, identifier = %state.identifier(), "Lock busy, queued");
                }
                match granted.then(|| state.set_with_key()).transpose() {
                    Ok(_) => {
                        watchdog = Some(Watchdog::start(self.library.clone(), state.clone()));
                        self.wait_and_call(&state, wait, callback).await
                    }
                    Err(e) => Err(Failure::Lock(e)),
                }
            }
            Err(e) => Err(Failure::Lock(e)),
        };

        // the watchdog may be mid acquire; let it settle before releasing
        if let Some(watchdog) = watchdog.take() {
            watchdog.stop().await;
        }
        let released = self.library.release_and_promote(state.parameters()).await;
        state.set_done(None);
        let unsubscribed = self.library.unsubscribe(&channel, &handler).await;
        guard.disarm();
        debug!(key = %key, identifier = %state.identifier(), "Lock attempt finished");

        match outcome {
            Ok(value) => {
                released?;
                unsubscribed?;
                Ok(value)
            }
            Err(failure) => {
                if let Err(e) = released {
                    error!(key = %key, error = %e, "Failed to release lock after failure");
                }
                if let Err(e) = unsubscribed {
                    warn!(key = %key, error = %e, "Failed to unsubscribe after failure");
                }
                match failure {
                    Failure::Lock(e) => Err(e.into()),
                    Failure::Callback(e) => Err(e),
                }
            }
        }
    }

    async fn wait_and_call<T, E, F, Fut>(
        &self,
        state: &LockState,
        wait: Option<Duration>,
        callback: F,
    ) -> Result<T, Failure<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let waited = match wait {
            None => state.wait().await,
            Some(limit) => {
                let waiting = state.wait();
                tokio::pin!(waiting);
                let resolved = tokio::select! {
                    biased;
                    result = &mut waiting => Some(result),
                    _ = tokio::time::sleep(limit) => None,
                };
                match resolved {
                    Some(result) => result,
                    None => {
                        if state.abandon_wait(KeySmithError::Timeout(limit)) {
                            debug!(key = %state.key(), identifier = %state.identifier(), "Lock wait timed out");
                        }
                        waiting.await
                    }
                }
            }
        };
        waited.map_err(Failure::Lock)?;

        if state.token().is_cancelled() {
            return Err(Failure::Lock(KeySmithError::Cancelled));
        }
        callback(state.token().clone())
            .await
            .map_err(Failure::Callback)
    }
}
