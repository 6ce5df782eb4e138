//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                               ┌── Document (tenant:type:id) ── BroadcastGroup
//!             ├── accept ── session task ────┤        │
//! Client B ──┘      │           │            │        └── SnapshotStore (RocksDB | memory)
//!                   │      AuthGate          │
//!                   │                        └── Document ...
//!                   └── Lifecycle (shutdown signal, session count)
//! ```
//!
//! `start()` binds and spawns the accept loop; `stop()` drains sessions and
//! flushes documents. Both are safe to call in any order and more than once.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::auth::{AuthGate, TokenVerifier};
use crate::config::ServerConfig;
use crate::lifecycle::{Lifecycle, ShutdownReport};
use crate::registry::DocumentRegistry;
use crate::session::{self, SessionContext};
use crate::stats::{ServerStats, StatsCounters};
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StorageError, StoreConfig};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
    #[error("server has been stopped")]
    Stopped,
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

enum RunState {
    Idle,
    Running {
        local_addr: SocketAddr,
        accept_task: JoinHandle<()>,
    },
    Stopped(ShutdownReport),
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    store: Arc<dyn SnapshotStore>,
    gate: AuthGate,
    stats: Arc<StatsCounters>,
    registry: Arc<DocumentRegistry>,
    lifecycle: Arc<Lifecycle>,
    state: Mutex<RunState>,
}

impl SyncServer {
    /// Create a server over an explicit store and verifier.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SnapshotStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let stats = Arc::new(StatsCounters::default());
        let registry = Arc::new(DocumentRegistry::new(
            store.clone(),
            config.flush_debounce,
            config.broadcast_capacity,
            stats.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            gate: AuthGate::new(verifier),
            stats,
            registry,
            lifecycle: Arc::new(Lifecycle::new()),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Create a server whose store follows `config.storage_path`:
    /// RocksDB when set, in-memory otherwise.
    pub fn from_config(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, ServerError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => {
                log::warn!("No storage path configured, documents are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store, verifier))
    }

    /// Bind the configured address and start accepting connections.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut state = self.state.lock().await;
        match &*state {
            RunState::Idle => {}
            RunState::Running { .. } => return Err(ServerError::AlreadyStarted),
            RunState::Stopped(_) => return Err(ServerError::Stopped),
        }

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        log::info!("Sync server listening on {local_addr}");

        let ctx = SessionContext {
            config: self.config.clone(),
            gate: self.gate.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            shutdown: self.lifecycle.subscribe(),
        };
        let accept_task = tokio::spawn(accept_loop(listener, ctx, self.lifecycle.clone()));

        *state = RunState::Running {
            local_addr,
            accept_task,
        };
        Ok(local_addr)
    }

    /// Stop accepting, close sessions, flush documents and sync the store.
    ///
    /// Idempotent: later calls return the first call's report.
    pub async fn stop(&self) -> ShutdownReport {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, RunState::Stopped(ShutdownReport::default()));
        let accept_task = match previous {
            RunState::Stopped(report) => {
                *state = RunState::Stopped(report.clone());
                return report;
            }
            RunState::Idle => None,
            RunState::Running { accept_task, .. } => Some(accept_task),
        };

        log::info!("Sync server shutting down");
        self.lifecycle.begin_shutdown();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                log::error!("Accept loop ended abnormally: {e}");
            }
        }

        let report = self
            .lifecycle
            .drain(&self.registry, self.config.shutdown_timeout)
            .await;

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.sync()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Final store sync failed: {e}"),
            Err(e) => log::error!("Final store sync panicked: {e}"),
        }

        log::info!("Sync server stopped: {report:?}");
        *state = RunState::Stopped(report.clone());
        report
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            RunState::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.registry.live_documents().await)
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn accept_loop(listener: TcpListener, ctx: SessionContext, lifecycle: Arc<Lifecycle>) {
    let mut shutdown = lifecycle.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                };
                let Some(token) = lifecycle.session_started() else {
                    break;
                };
                log::debug!("New TCP connection from {addr}");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _token = token;
                    if let Err(e) = session::run(stream, addr, ctx).await {
                        log::warn!("Connection error from {addr}: {e}");
                    }
                });
            }
            _ = session::shutdown_signalled(&mut shutdown) => break,
        }
    }
    log::info!("Stopped accepting connections");
}
