//! Coordinated graceful shutdown of a consumption session.
//!
//! The session moves `Running -> ShuttingDown -> Drained`. Shutdown is
//! broadcast through one [`CancellationToken`] that every partition reader
//! observes; there is no forced termination, the session always waits for the
//! readers to drain.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    ShuttingDown,
    Drained,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    closing: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Running);
        Self {
            inner: Arc::new(Inner {
                closing: CancellationToken::new(),
                state,
            }),
        }
    }

    /// The token handed to every partition reader.
    pub fn closing_token(&self) -> CancellationToken {
        self.inner.closing.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Move to `ShuttingDown` and notify every reader. Only the first call has
    /// an effect.
    pub fn request_shutdown(&self, reason: &str) {
        let transitioned = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if transitioned {
            info!(reason, "initiating shutdown of consumer");
            self.inner.closing.cancel();
        }
    }

    /// Record that every reader has finished and the output is flushed.
    pub fn mark_drained(&self) {
        let previous = self.inner.state.send_replace(SessionState::Drained);
        if previous != SessionState::Drained {
            info!(from = ?previous, "consumer drained");
        }
        // Releases the signal listener when the streams ended on their own.
        self.inner.closing.cancel();
    }

    /// Spawn the listener turning SIGINT/SIGTERM into a shutdown request.
    ///
    /// The listener exits on its own once shutdown was requested by other means.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let closing = self.closing_token();
        tokio::spawn(async move {
            tokio::select! {
                signal = wait_for_shutdown_signal() => {
                    coordinator.request_shutdown(signal);
                }
                _ = closing.cancelled() => {}
            }
        })
    }
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => return "received SIGINT",
                    _ = sigterm.recv() => return "received SIGTERM",
                }
            }
            Err(err) => warn!("failed to install SIGTERM handler: {}", err),
        }
    }

    ctrl_c().await;
    "received SIGINT"
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for SIGINT: {}", err);
        // Without a handler there is nothing to wait for.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), SessionState::Running);
        assert!(!coordinator.closing_token().is_cancelled());
    }

    #[test]
    fn shutdown_request_cancels_all_tokens() {
        let coordinator = ShutdownCoordinator::new();
        let first = coordinator.closing_token();
        let second = coordinator.clone().closing_token();

        coordinator.request_shutdown("test");

        assert_eq!(coordinator.state(), SessionState::ShuttingDown);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn repeated_requests_are_noops() {
        let coordinator = ShutdownCoordinator::new();
        let mut states = coordinator.subscribe();

        coordinator.request_shutdown("first");
        assert!(states.has_changed().unwrap());
        states.borrow_and_update();

        coordinator.request_shutdown("second");
        assert!(!states.has_changed().unwrap());
        assert_eq!(coordinator.state(), SessionState::ShuttingDown);
    }

    #[test]
    fn drained_is_terminal() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown("test");
        coordinator.mark_drained();
        coordinator.request_shutdown("late");
        assert_eq!(coordinator.state(), SessionState::Drained);
    }

    #[tokio::test]
    async fn signal_listener_exits_after_internal_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let listener = coordinator.listen_for_signals();

        coordinator.request_shutdown("output sink failed");
        listener.await.unwrap();
        assert_eq!(coordinator.state(), SessionState::ShuttingDown);
    }
}
