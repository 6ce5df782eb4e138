//! Graceful shutdown coordination.
//!
//! Shutdown order:
//! 1. raise the shutdown signal (accept loop stops, sessions close)
//! 2. wait for sessions to detach
//! 3. stop timer flushes, flush every live document
//! 4. wait for in-flight flushes and drains
//!
//! Steps 2-4 share one deadline; whatever is still running when it passes is
//! abandoned with a logged error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::registry::DocumentRegistry;

/// Outcome of a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions still attached when the deadline passed
    pub sessions_abandoned: usize,
    /// Documents written by the shutdown flush
    pub documents_flushed: usize,
    /// Documents whose shutdown flush failed
    pub flush_failures: usize,
    /// Whether flushes were still running at the deadline
    pub flushes_abandoned: bool,
}

/// Shutdown signal plus a count of live sessions.
pub struct Lifecycle {
    shutdown: watch::Sender<bool>,
    sessions: Arc<watch::Sender<usize>>,
    stopping: AtomicBool,
}

/// Held by a session task for its whole life.
pub struct SessionToken {
    sessions: Arc<watch::Sender<usize>>,
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.sessions.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (sessions, _) = watch::channel(0usize);
        Self {
            shutdown,
            sessions: Arc::new(sessions),
            stopping: AtomicBool::new(false),
        }
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Register a session. `None` once shutdown has begun.
    pub fn session_started(&self) -> Option<SessionToken> {
        if self.is_stopping() {
            return None;
        }
        self.sessions.send_modify(|n| *n += 1);
        Some(SessionToken {
            sessions: self.sessions.clone(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    /// Raise the shutdown signal. Returns `false` if it was already raised.
    pub fn begin_shutdown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);
        true
    }

    /// Run steps 2-4 against `registry` within `timeout`.
    pub async fn drain(&self, registry: &DocumentRegistry, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        let mut sessions = self.sessions.subscribe();
        let detached = tokio::time::timeout_at(deadline, async move {
            sessions.wait_for(|n| *n == 0).await.is_ok()
        })
        .await;
        if !matches!(detached, Ok(true)) {
            report.sessions_abandoned = self.active_sessions();
            log::error!(
                "{} sessions still attached at shutdown deadline",
                report.sessions_abandoned
            );
        }

        registry.close();
        match tokio::time::timeout_at(deadline, registry.flush_all()).await {
            Ok((flushed, failed)) => {
                report.documents_flushed = flushed;
                report.flush_failures = failed;
            }
            Err(_) => log::error!("Shutdown flush did not finish before the deadline"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !registry.wait_for_flushes(remaining).await {
            report.flushes_abandoned = true;
            log::error!(
                "Abandoning {} in-flight flushes at shutdown",
                registry.flushes_in_flight()
            );
        }

        report
    }
}
