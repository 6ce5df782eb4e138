//! One task per WebSocket connection.
//!
//! ```text
//! Connecting ──handshake──► Authenticating ──Connect ok──► Active ──► Closing ──► Closed
//!                                 │                                      ▲
//!                                 └──── Unauthorized + policy close ─────┘
//! ```
//!
//! While active the task multiplexes inbound frames, the document's
//! broadcast receiver, the heartbeat timer, the idle deadline and the server
//! shutdown signal with `tokio::select!`.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{AuthGate, ConnectParams, Identity};
use crate::broadcast::RecvStop;
use crate::config::ServerConfig;
use crate::protocol::{ClientMessage, DocumentKey, ProtocolError, ServerMessage};
use crate::registry::{DocumentHandle, DocumentRegistry};
use crate::stats::StatsCounters;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport failure: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("send timed out")]
    SendTimeout,
}

/// Shared services handed to every session task.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub gate: AuthGate,
    pub registry: Arc<DocumentRegistry>,
    pub stats: Arc<StatsCounters>,
    pub shutdown: watch::Receiver<bool>,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// How the active loop ended.
enum Exit {
    ClientClosed,
    IdleTimeout,
    Lagged(u64),
    Shutdown,
}

struct Session {
    id: Uuid,
    addr: SocketAddr,
    state: SessionState,
    ctx: SessionContext,
    sink: WsSink,
    source: WsSource,
}

/// Resolves once the server has begun shutting down.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

/// Drive one connection from handshake to close.
pub async fn run(stream: TcpStream, addr: SocketAddr, ctx: SessionContext) -> Result<(), SessionError> {
    let mut params = ConnectParams::default();
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(ctx.config.max_message_bytes))
        .max_frame_size(Some(ctx.config.max_message_bytes));
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            params = ConnectParams::from_request(request);
            Ok(response)
        },
        Some(ws_config),
    );
    let mut shutdown = ctx.shutdown.clone();
    let ws = tokio::select! {
        ws = tokio::time::timeout(ctx.config.auth_timeout, handshake) => {
            ws.map_err(|_| SessionError::HandshakeTimeout)??
        }
        _ = shutdown_signalled(&mut shutdown) => {
            log::debug!("Dropping handshake from {addr}, server shutting down");
            return Ok(());
        }
    };
    let (sink, source) = ws.split();

    let mut session = Session {
        id: Uuid::new_v4(),
        addr,
        state: SessionState::Connecting,
        ctx,
        sink,
        source,
    };
    session.ctx.stats.connection_opened();
    let result = session.serve(params).await;
    session.ctx.stats.connection_closed();
    session.transition(SessionState::Closed);
    result
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        log::trace!("Session {} {:?} -> {next:?}", self.id, self.state);
        self.state = next;
    }

    async fn serve(&mut self, params: ConnectParams) -> Result<(), SessionError> {
        self.transition(SessionState::Authenticating);
        let Some((identity, key)) = self.authenticate(&params).await? else {
            return Ok(());
        };

        let handle = self.ctx.registry.resolve(key).await;
        let mut receiver = handle.document().group().subscribe(self.id);

        let joined = self.join(&identity, &handle).await;
        let outcome = match joined {
            Ok(()) => {
                self.transition(SessionState::Active);
                log::info!(
                    "Session {} ({}) joined {} from {}",
                    self.id,
                    identity.user_id(),
                    handle.key(),
                    self.addr
                );
                self.active_loop(&handle, &mut receiver).await
            }
            Err(e) => Err(e),
        };

        self.transition(SessionState::Closing);
        drop(receiver);
        let key = handle.key().clone();
        handle.detach().await;

        match &outcome {
            Ok(Exit::ClientClosed) => log::info!("Session {} left {key}", self.id),
            Ok(Exit::IdleTimeout) => {
                log::info!("Session {} on {key} closed after idle timeout", self.id);
                self.close(CloseCode::Away, "idle timeout").await;
            }
            Ok(Exit::Lagged(n)) => {
                log::warn!("Session {} on {key} lagged by {n} updates, disconnecting", self.id);
                self.ctx.stats.receiver_lagged();
                self.close(CloseCode::Again, "receiver lagged").await;
            }
            Ok(Exit::Shutdown) => {
                log::info!("Session {} on {key} closed for shutdown", self.id);
                self.close(CloseCode::Away, "server shutting down").await;
            }
            Err(e) => log::warn!("Session {} on {key} ended: {e}", self.id),
        }
        outcome.map(|_| ())
    }

    /// Wait for `Connect`, run the gate and parse the key.
    ///
    /// `Ok(None)` means the client was refused and the socket is closed.
    async fn authenticate(
        &mut self,
        params: &ConnectParams,
    ) -> Result<Option<(Identity, DocumentKey)>, SessionError> {
        let mut shutdown = self.ctx.shutdown.clone();
        let first = tokio::select! {
            first = tokio::time::timeout(self.ctx.config.auth_timeout, self.next_client_message()) => first,
            _ = shutdown_signalled(&mut shutdown) => {
                log::debug!("Session {} shut down before authenticating", self.id);
                self.close(CloseCode::Away, "server shutting down").await;
                return Ok(None);
            }
        };
        let (document_key, token) = match first {
            Ok(Ok(Some(ClientMessage::Connect { document_key, token }))) => (document_key, token),
            Ok(Ok(Some(other))) => {
                log::debug!("Session {} sent {other:?} before connecting", self.id);
                self.refuse("Unauthorized: expected connect").await;
                return Ok(None);
            }
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(SessionError::Protocol(e))) => {
                log::debug!("Session {} sent an undecodable connect: {e}", self.id);
                self.refuse("Unauthorized: expected connect").await;
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                log::info!("Session {} from {} never authenticated", self.id, self.addr);
                self.refuse("Unauthorized: authentication timeout").await;
                return Ok(None);
            }
        };

        let identity = match self.ctx.gate.authenticate(token.as_deref(), params) {
            Ok(identity) => identity,
            Err(e) => {
                log::info!("Session {} from {} refused: {e}", self.id, self.addr);
                self.refuse(&e.to_string()).await;
                return Ok(None);
            }
        };

        match DocumentKey::from_client(identity.tenant_id(), &document_key) {
            Ok(key) if !self.shutting_down() => Ok(Some((identity, key))),
            Ok(_) => {
                self.close(CloseCode::Away, "server shutting down").await;
                Ok(None)
            }
            Err(e) => {
                log::info!("Session {} asked for bad key {document_key:?}: {e}", self.id);
                self.ctx.stats.connection_rejected();
                let reply = ServerMessage::Error {
                    reason: e.to_string(),
                };
                if let Err(e) = self.send(&reply).await {
                    log::debug!("Could not deliver key error to {}: {e}", self.addr);
                }
                self.close(CloseCode::Policy, "invalid document key").await;
                Ok(None)
            }
        }
    }

    async fn refuse(&mut self, reason: &str) {
        self.ctx.stats.connection_rejected();
        let reply = ServerMessage::Unauthorized {
            reason: reason.to_string(),
        };
        if let Err(e) = self.send(&reply).await {
            log::debug!("Could not deliver refusal to {}: {e}", self.addr);
        }
        self.close(CloseCode::Policy, "unauthorized").await;
    }

    /// Confirm the session and send the full document state.
    async fn join(&mut self, identity: &Identity, handle: &DocumentHandle) -> Result<(), SessionError> {
        self.send(&ServerMessage::Authenticated {
            session_id: self.id,
            user_id: identity.user_id().to_string(),
            tenant_id: identity.tenant_id().to_string(),
            document_key: handle.key().client_key(),
        })
        .await?;
        let state = handle.document().encode_full_state().await;
        self.send(&ServerMessage::SyncStep2(state)).await
    }

    async fn active_loop(
        &mut self,
        handle: &DocumentHandle,
        receiver: &mut crate::broadcast::PeerReceiver,
    ) -> Result<Exit, SessionError> {
        let config = self.ctx.config.clone();
        let mut shutdown = self.ctx.shutdown.clone();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval.max(Duration::from_millis(10)),
        );
        let mut idle_deadline = Instant::now() + config.idle_timeout;

        loop {
            tokio::select! {
                msg = self.source.next() => {
                    idle_deadline = Instant::now() + config.idle_timeout;
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.ctx.stats.message_received(data.len());
                            self.handle_frame(handle, &data).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.send_raw(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(Exit::ClientClosed),
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Session {} sent a text frame, ignoring", self.id);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                frame = receiver.recv() => {
                    match frame {
                        Ok(frame) => self.send_raw(Message::Binary(frame.to_vec().into())).await?,
                        Err(RecvStop::Lagged(n)) => return Ok(Exit::Lagged(n)),
                        Err(RecvStop::Closed) => return Ok(Exit::Shutdown),
                    }
                }

                _ = heartbeat.tick() => {
                    self.send_raw(Message::Ping(Vec::new().into())).await?;
                }

                _ = tokio::time::sleep_until(idle_deadline) => return Ok(Exit::IdleTimeout),

                _ = shutdown_signalled(&mut shutdown) => return Ok(Exit::Shutdown),
            }
        }
    }

    /// Dispatch one inbound binary frame of an active session.
    async fn handle_frame(&mut self, handle: &DocumentHandle, data: &[u8]) -> Result<(), SessionError> {
        let message = match ClientMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Undecodable frame from session {}: {e}", self.id);
                return self
                    .send(&ServerMessage::Error {
                        reason: e.to_string(),
                    })
                    .await;
            }
        };

        match message {
            ClientMessage::Update(fragment) => match handle.apply(self.id, &fragment).await {
                Ok(outcome) => {
                    log::trace!("Session {} update: {outcome:?}", self.id);
                    Ok(())
                }
                Err(e) => {
                    log::warn!("Rejected fragment from session {} on {}: {e}", self.id, handle.key());
                    self.send(&ServerMessage::Error {
                        reason: e.to_string(),
                    })
                    .await
                }
            },
            ClientMessage::SyncStep1(state_vector) => {
                match handle.document().encode_diff(&state_vector).await {
                    Ok(diff) => self.send(&ServerMessage::SyncStep2(diff)).await,
                    Err(e) => {
                        self.send(&ServerMessage::Error {
                            reason: e.to_string(),
                        })
                        .await
                    }
                }
            }
            ClientMessage::Ping => self.send(&ServerMessage::Pong).await,
            ClientMessage::Connect { .. } => {
                self.send(&ServerMessage::Error {
                    reason: "already connected".into(),
                })
                .await
            }
        }
    }

    /// Next decoded client message. `None` when the peer went away.
    async fn next_client_message(&mut self) -> Result<Option<ClientMessage>, SessionError> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.ctx.stats.message_received(data.len());
                    return Ok(Some(ClientMessage::decode(&data)?));
                }
                Some(Ok(Message::Ping(data))) => self.send_raw(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), SessionError> {
        let encoded = message.encode()?;
        self.send_raw(Message::Binary(encoded.into())).await
    }

    async fn send_raw(&mut self, message: Message) -> Result<(), SessionError> {
        tokio::time::timeout(self.ctx.config.send_timeout, self.sink.send(message))
            .await
            .map_err(|_| SessionError::SendTimeout)??;
        Ok(())
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.send_raw(Message::Close(Some(frame))).await {
            log::debug!("Close frame to {} not delivered: {e}", self.addr);
        }
    }

    fn shutting_down(&self) -> bool {
        *self.ctx.shutdown.borrow()
    }
}
