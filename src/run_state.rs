//! Run-wide "is running" state.
//!
//! One `RunState` is created per run and cloned into every task. It only ever
//! moves from running to stopped; the first caller of [`RunState::stop`] wins
//! and its reason is the one reported.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator typed the quit command, or text input finished.
    Quit,
    /// The remote side said the termination phrase.
    Terminated,
    /// Ctrl-C.
    Interrupted,
    /// A task failed unrecoverably.
    Failure,
}

#[derive(Debug, Clone, Default)]
pub struct RunState {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop the run. Returns `true` only for the call that performed the
    /// transition.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            info!("run stopping: {:?}", reason);
        }
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Token handed to `select!`s; cancelled once the run stops.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the run has stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_stop_wins() {
        let state = RunState::new();
        assert!(state.is_running());
        assert!(state.stop(StopReason::Quit));
        assert!(!state.stop(StopReason::Terminated));
        assert!(!state.is_running());
        assert_eq!(state.reason(), Some(StopReason::Quit));
    }

    #[tokio::test]
    async fn clones_observe_stop() {
        let state = RunState::new();
        let observer = state.clone();
        let waiter = tokio::spawn(async move { observer.stopped().await });
        state.stop(StopReason::Interrupted);
        waiter.await.unwrap();
    }
}
