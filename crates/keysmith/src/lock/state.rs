//! Per-attempt lock state machine
//!
//! A [`LockState`] is mutated from three places: the pub/sub dispatcher, the
//! watchdog and the caller. Every transition goes through one mutex, and the
//! completion signal is resolved at most once.

use std::fmt;

use keysmith_common::{Key, KeySmithError, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::scripts::{LockParameters, NotificationHandler};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    WaitingForKey,
    WithKey,
    Done,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockStatus::WaitingForKey => "waiting_for_key",
            LockStatus::WithKey => "with_key",
            LockStatus::Done => "done",
        };
        f.write_str(name)
    }
}

enum Completion {
    Acquired,
    Cancelled,
    Failed(KeySmithError),
}

struct Inner {
    status: LockStatus,
    completion: Option<oneshot::Sender<Completion>>,
}

impl Inner {
    fn grant(&mut self) {
        self.status = LockStatus::WithKey;
        if let Some(sender) = self.completion.take() {
            let _ = sender.send(Completion::Acquired);
        }
    }

    fn finish(&mut self, error: Option<KeySmithError>) {
        self.status = LockStatus::Done;
        if let Some(sender) = self.completion.take() {
            let completion = match error {
                Some(e) => Completion::Failed(e),
                None => Completion::Cancelled,
            };
            let _ = sender.send(completion);
        }
    }
}

/// One attempt to acquire a [`Key`]
pub struct LockState {
    key: Key,
    parameters: LockParameters,
    token: CancellationToken,
    inner: Mutex<Inner>,
    receiver: Mutex<Option<oneshot::Receiver<Completion>>>,
}

impl LockState {
    /// Start an attempt in `WaitingForKey`; its token is a child of `parent`.
    pub fn new(key: Key, identifier: impl Into<String>, parent: &CancellationToken) -> Self {
        let (sender, receiver) = oneshot::channel();
        let parameters = LockParameters::new(identifier, &key);
        Self {
            key,
            parameters,
            token: parent.child_token(),
            inner: Mutex::new(Inner {
                status: LockStatus::WaitingForKey,
                completion: Some(sender),
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn identifier(&self) -> &str {
        &self.parameters.identifier
    }

    pub fn parameters(&self) -> &LockParameters {
        &self.parameters
    }

    /// Cancelled when the attempt is done or the caller cancels
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn status(&self) -> LockStatus {
        self.inner.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status() == LockStatus::Done
    }

    /// Mark the key as owned by this attempt.
    ///
    /// No-op when already `WithKey`. Fails with a protocol violation once the
    /// attempt is `Done`.
    pub fn set_with_key(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let status = inner.status;
        match status {
            LockStatus::WaitingForKey => {
                inner.grant();
                Ok(())
            }
            LockStatus::WithKey => Ok(()),
            LockStatus::Done => Err(KeySmithError::ProtocolViolation(format!(
                "attempt {} on {} is done and cannot take the key",
                self.parameters.identifier, self.key
            ))),
        }
    }

    /// Terminate the attempt.
    ///
    /// The first call decides the outcome: cancellation when `error` is
    /// `None`, the error otherwise. Later calls only keep the state `Done`.
    pub fn set_done(&self, error: Option<KeySmithError>) {
        self.inner.lock().finish(error);
        self.token.cancel();
    }

    /// Give up waiting with `error` unless the key was already granted.
    ///
    /// Returns `true` when the attempt was still waiting.
    pub fn abandon_wait(&self, error: KeySmithError) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.status != LockStatus::WaitingForKey {
                return false;
            }
            inner.finish(Some(error));
        }
        self.token.cancel();
        true
    }

    /// Apply an ownership notification naming `owner`.
    pub fn handle_notification(&self, owner: &str) {
        let mut inner = self.inner.lock();
        let status = inner.status;
        match status {
            LockStatus::WaitingForKey if owner == self.parameters.identifier => {
                inner.grant();
                debug!(key = %self.key, identifier = %owner, "Lock granted by notification");
            }
            LockStatus::WithKey if owner != self.parameters.identifier => {
                warn!(
                    key = %self.key,
                    identifier = %self.parameters.identifier,
                    owner = %owner,
                    "Lock reassigned while held, terminating attempt"
                );
                inner.finish(None);
                drop(inner);
                self.token.cancel();
            }
            _ => {}
        }
    }

    /// Wait for the attempt to be granted, cancelled or failed.
    ///
    /// Caller cancellation terminates the attempt. Only the first call waits;
    /// later calls fail with a protocol violation.
    pub async fn wait(&self) -> Result<()> {
        let mut receiver = self.receiver.lock().take().ok_or_else(|| {
            KeySmithError::ProtocolViolation("lock completion already awaited".to_string())
        })?;

        let resolved = tokio::select! {
            biased;
            completion = &mut receiver => Some(completion),
            _ = self.token.cancelled() => None,
        };
        let completion = match resolved {
            Some(completion) => completion,
            None => {
                self.set_done(None);
                receiver.await
            }
        };

        match completion {
            Ok(Completion::Acquired) => Ok(()),
            Ok(Completion::Cancelled) | Err(_) => Err(KeySmithError::Cancelled),
            Ok(Completion::Failed(e)) => Err(e),
        }
    }
}

impl NotificationHandler for LockState {
    fn handle(&self, _channel: &str, payload: &[u8]) {
        match std::str::from_utf8(payload) {
            Ok(owner) => self.handle_notification(owner),
            Err(_) => warn!(key = %self.key, "Ignoring non utf-8 lock notification"),
        }
    }
}

impl fmt::Debug for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockState")
            .field("key", &self.key)
            .field("identifier", &self.parameters.identifier)
            .field("status", &self.status())
            .finish()
    }
}
