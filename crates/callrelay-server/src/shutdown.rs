//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Relay sessions run outside the HTTP request lifecycle once upgraded, so
//! the coordinator also tracks them and waits for their cleanup to finish.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before giving up on stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across the listener and all sessions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a session task that shutdown will wait for.
    pub fn spawn_session<F>(&self, session: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sessions.spawn(session)
    }

    /// Sessions still running.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Perform a graceful shutdown.
    ///
    /// 1. Cancel the shutdown token (every relay loop exits)
    /// 2. Wait up to `timeout` for `handles` and all tracked sessions
    /// 3. Return regardless; anything left is abandoned
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let _ = self.sessions.close();
        info!(
            task_count = handles.len(),
            sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            self.sessions.wait().await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.session_count(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn every_token_is_cancelled() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_handles() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coord.graceful_shutdown(vec![handle], None).await;
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_sessions() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();

        let _ = coord.spawn_session(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });
        assert_eq!(coord.session_count(), 1);

        coord
            .graceful_shutdown(Vec::new(), Some(Duration::from_secs(5)))
            .await;
        assert!(done_rx.try_recv().is_ok());
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();

        // A session that ignores cancellation
        let _ = coord.spawn_session(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        coord
            .graceful_shutdown(Vec::new(), Some(Duration::from_millis(100)))
            .await;
        assert!(coord.is_shutting_down());
    }
}
