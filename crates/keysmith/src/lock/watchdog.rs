//! Expiry watchdog
//!
//! Pub/sub delivery is best effort. Once per key TTL the watchdog asks the
//! store where the attempt stands and fixes the local state when a
//! notification was lost or the keys expired.

use std::sync::Arc;

use keysmith_common::KeySmithError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::state::{LockState, LockStatus};
use crate::scripts::{KeySituation, ScriptLibrary};

/// Background protection of one lock attempt.
///
/// Dropping the watchdog terminates the attempt without waiting for the loop.
pub struct Watchdog {
    state: Arc<LockState>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawn the protection loop, unless the attempt is already done.
    pub fn start(library: Arc<dyn ScriptLibrary>, state: Arc<LockState>) -> Self {
        let handle = if state.is_done() {
            None
        } else {
            Some(tokio::spawn(protect(library, state.clone())))
        };
        Self { state, handle }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Terminate the attempt and wait for the loop to exit
    pub async fn stop(mut self) {
        self.state.set_done(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.state.set_done(None);
    }
}

async fn protect(library: Arc<dyn ScriptLibrary>, state: Arc<LockState>) {
    let period = state.key().expiration();

    loop {
        tokio::select! {
            biased;
            _ = state.token().cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        if state.is_done() {
            return;
        }

        let situation = match library.get_situation(state.parameters()).await {
            Ok(situation) => situation,
            Err(e) => {
                error!(
                    key = %state.key(),
                    identifier = %state.identifier(),
                    error = %e,
                    "Watchdog lost the store, terminating attempt"
                );
                state.set_done(Some(e));
                return;
            }
        };
        debug!(
            key = %state.key(),
            identifier = %state.identifier(),
            situation = ?situation,
            "Watchdog check"
        );

        match situation {
            KeySituation::InQueue => {}
            KeySituation::Owner => {
                if state.status() == LockStatus::WaitingForKey {
                    warn!(
                        key = %state.key(),
                        identifier = %state.identifier(),
                        "Recovered ownership without notification"
                    );
                }
                if state.set_with_key().is_err() {
                    return;
                }
            }
            KeySituation::NotFound => match state.status() {
                LockStatus::WaitingForKey => {
                    warn!(
                        key = %state.key(),
                        identifier = %state.identifier(),
                        "Lock keys expired while waiting, acquiring again"
                    );
                    match library.acquire_or_enqueue(state.parameters()).await {
                        Ok(granted) => {
                            // the attempt may have finished while the script ran
                            if state.is_done() || (granted && state.set_with_key().is_err()) {
                                release_late_entry(library.as_ref(), &state).await;
                                return;
                            }
                        }
                        Err(e) => {
                            error!(
                                key = %state.key(),
                                identifier = %state.identifier(),
                                error = %e,
                                "Watchdog could not acquire again, terminating attempt"
                            );
                            state.set_done(Some(e));
                            return;
                        }
                    }
                }
                LockStatus::WithKey => {
                    warn!(
                        key = %state.key(),
                        identifier = %state.identifier(),
                        "Held lock vanished from the store, terminating attempt"
                    );
                    state.set_done(None);
                    return;
                }
                LockStatus::Done => return,
            },
            KeySituation::Unexpected(code) => {
                error!(
                    key = %state.key(),
                    identifier = %state.identifier(),
                    situation = code,
                    "Unexpected situation code, terminating attempt"
                );
                state.set_done(Some(KeySmithError::ProtocolViolation(format!(
                    "unexpected situation code {}",
                    code
                ))));
                return;
            }
        }
    }
}

/// Drop an ownership or queue entry written for an attempt that already ended
async fn release_late_entry(library: &dyn ScriptLibrary, state: &LockState) {
    debug!(
        key = %state.key(),
        identifier = %state.identifier(),
        "Attempt finished during acquire, releasing its entry"
    );
    if let Err(e) = library.release_and_promote(state.parameters()).await {
        warn!(
            key = %state.key(),
            identifier = %state.identifier(),
            error = %e,
            "Failed to release entry of finished attempt"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use keysmith_common::{Channel, Key, Result};
    use tokio_util::sync::CancellationToken;

    use crate::scripts::{LockParameters, NotificationHandler, PubSub};

    /// Library answering every situation query with a fixed code
    struct FixedSituation(i64);

    #[async_trait]
    impl PubSub for FixedSituation {
        async fn subscribe(&self, _: &Channel, _: Arc<dyn NotificationHandler>) -> Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _: &Channel, _: &Arc<dyn NotificationHandler>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ScriptLibrary for FixedSituation {
        async fn acquire_or_enqueue(&self, _: &LockParameters) -> Result<bool> {
            Ok(false)
        }

        async fn release_and_promote(&self, _: &LockParameters) -> Result<()> {
            Ok(())
        }

        async fn get_situation(&self, _: &LockParameters) -> Result<KeySituation> {
            Ok(KeySituation::from_code(self.0))
        }
    }

    fn attempt() -> Arc<LockState> {
        let key = Key::new("wd", "n", Duration::from_millis(100)).unwrap();
        Arc::new(LockState::new(key, "me", &CancellationToken::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_code_is_a_protocol_violation() {
        let state = attempt();
        let watchdog = Watchdog::start(Arc::new(FixedSituation(42)), state.clone());

        let err = state.wait().await.unwrap_err();
        assert!(matches!(err, KeySmithError::ProtocolViolation(_)));
        watchdog.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_situation_grants_key() {
        let state = attempt();
        let watchdog = Watchdog::start(Arc::new(FixedSituation(1)), state.clone());

        state.wait().await.unwrap();
        assert_eq!(state.status(), LockStatus::WithKey);
        assert!(watchdog.is_running());
        watchdog.stop().await;
        assert!(state.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_record_while_holding_terminates() {
        let state = attempt();
        state.set_with_key().unwrap();
        let watchdog = Watchdog::start(Arc::new(FixedSituation(2)), state.clone());

        state.token().cancelled().await;
        assert!(state.is_done());
        watchdog.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_queue_keeps_waiting() {
        let state = attempt();
        let watchdog = Watchdog::start(Arc::new(FixedSituation(0)), state.clone());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(state.status(), LockStatus::WaitingForKey);
        assert!(watchdog.is_running());

        watchdog.stop().await;
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn test_not_started_when_done() {
        let state = attempt();
        state.set_done(None);
        let watchdog = Watchdog::start(Arc::new(FixedSituation(0)), state);
        assert!(!watchdog.is_running());
    }

    #[tokio::test]
    async fn test_drop_terminates_attempt() {
        let state = attempt();
        let watchdog = Watchdog::start(Arc::new(FixedSituation(0)), state.clone());
        drop(watchdog);
        assert!(state.is_done());
        assert!(state.token().is_cancelled());
    }
}
