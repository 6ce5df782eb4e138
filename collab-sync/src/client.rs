//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, authenticate, disconnect)
//! - Update send/receive as opaque CRDT fragments
//! - State-vector resync
//! - Offline queue for fragments produced while disconnected, replayed once
//!   the server confirms authentication

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, waiting for `Authenticated`
    Connecting,
    Connected,
}

/// Where the client presents its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPlacement {
    /// Inside the `Connect` message
    #[default]
    Payload,
    /// `?token=` on the URL
    Query,
    /// `Authorization: Bearer` header
    Header,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Authenticated {
        session_id: Uuid,
        user_id: String,
        tenant_id: String,
    },
    /// The server refused the credential
    Rejected(String),
    /// Full state on join, or a diff after `request_diff`
    StateSynced(Vec<u8>),
    /// Fragment merged from another session
    RemoteUpdate(Vec<u8>),
    /// Non-fatal complaint from the server
    ServerError(String),
    Disconnected,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid token for header: {0}")]
    InvalidHeader(String),
    #[error("offline queue is full")]
    QueueFull,
    #[error("connection closed")]
    ConnectionClosed,
}

/// Fragments produced while disconnected.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a fragment. `false` when full.
    pub fn enqueue(&mut self, fragment: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(fragment);
        true
    }

    /// Take every queued fragment, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    document_key: String,
    token: String,
    placement: TokenPlacement,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Client for `document_key` (`{entityType}:{entityId}`) on `server_url`.
    pub fn new(
        server_url: impl Into<String>,
        document_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            document_key: document_key.into(),
            token: token.into(),
            placement: TokenPlacement::default(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_token_placement(mut self, placement: TokenPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and send `Connect`.
    ///
    /// Completion means the handshake succeeded; authentication is reported
    /// through `SyncEvent::Authenticated` or `SyncEvent::Rejected`.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match self.open().await {
            Ok(ws) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let token = (self.placement == TokenPlacement::Payload).then(|| self.token.clone());
        let connect = ClientMessage::Connect {
            document_key: self.document_key.clone(),
            token,
        };
        out_tx
            .send(Message::Binary(connect.encode()?.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        // Reader task: surface server messages, replay the queue once accepted
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let queue = self.offline_queue.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let message = match ServerMessage::decode(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Undecodable server frame: {e}");
                        continue;
                    }
                };
                let event = match message {
                    ServerMessage::Authenticated {
                        session_id,
                        user_id,
                        tenant_id,
                        ..
                    } => {
                        *state.write().await = ConnectionState::Connected;
                        replay(&queue, &out_tx).await;
                        SyncEvent::Authenticated {
                            session_id,
                            user_id,
                            tenant_id,
                        }
                    }
                    ServerMessage::Unauthorized { reason } => SyncEvent::Rejected(reason),
                    ServerMessage::SyncStep2(snapshot) => SyncEvent::StateSynced(snapshot),
                    ServerMessage::Update(fragment) => SyncEvent::RemoteUpdate(fragment),
                    ServerMessage::Error { reason } => SyncEvent::ServerError(reason),
                    ServerMessage::Pong => continue,
                };
                let _ = event_tx.send(event).await;
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn open(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ClientError> {
        let mut request = self.connect_url().into_client_request()?;
        if self.placement == TokenPlacement::Header {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| ClientError::InvalidHeader(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws_stream)
    }

    /// Server URL, with the encoded token appended for query placement.
    fn connect_url(&self) -> String {
        match self.placement {
            TokenPlacement::Query => {
                let separator = if self.server_url.contains('?') { '&' } else { '?' };
                let token: String = url::form_urlencoded::byte_serialize(self.token.as_bytes()).collect();
                format!("{}{separator}token={token}", self.server_url)
            }
            _ => self.server_url.clone(),
        }
    }

    /// Send a fragment, or queue it while not connected.
    pub async fn send_update(&self, fragment: Vec<u8>) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(fragment) {
                return Err(ClientError::QueueFull);
            }
            return Ok(());
        }
        self.send(ClientMessage::Update(fragment)).await
    }

    /// Ask for everything missing relative to `state_vector`.
    pub async fn request_diff(&self, state_vector: Vec<u8>) -> Result<(), ClientError> {
        self.send(ClientMessage::SyncStep1(state_vector)).await
    }

    /// Application-level ping.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping).await
    }

    /// Close the socket. Queued fragments stay queued.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        let encoded = message.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn document_key(&self) -> &str {
        &self.document_key
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

async fn replay(queue: &Mutex<OfflineQueue>, out_tx: &mpsc::Sender<Message>) {
    let queued = queue.lock().await.drain();
    if queued.is_empty() {
        return;
    }
    log::info!("Replaying {} queued updates", queued.len());
    for fragment in queued {
        match ClientMessage::Update(fragment).encode() {
            Ok(encoded) => {
                if out_tx.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Dropping queued update: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:1234", "discussion:doc-1", "t1");
        assert_eq!(client.document_key(), "discussion:doc-1");
        assert_eq!(client.server_url(), "ws://localhost:1234");
    }

    #[test]
    fn test_query_token_is_encoded() {
        let client = SyncClient::new("ws://localhost:1234/", "discussion:doc-1", "a+b/c=d&e f")
            .with_token_placement(TokenPlacement::Query);
        let url = client.connect_url();
        assert_eq!(url, "ws://localhost:1234/?token=a%2Bb%2Fc%3Dd%26e+f");

        let (_, query) = url.split_once('?').unwrap();
        assert_eq!(
            crate::auth::parse_query(query),
            vec![("token".to_string(), "a+b/c=d&e f".to_string())]
        );

        let client = SyncClient::new("ws://localhost:1234/?v=1", "discussion:doc-1", "t1")
            .with_token_placement(TokenPlacement::Query);
        assert_eq!(client.connect_url(), "ws://localhost:1234/?v=1&token=t1");

        let client = SyncClient::new("ws://localhost:1234/", "discussion:doc-1", "a+b");
        assert_eq!(client.connect_url(), "ws://localhost:1234/");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:1234", "discussion:doc-1", "t1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("ws://localhost:1234", "discussion:doc-1", "t1");
        client.send_update(vec![1, 2, 3]).await.unwrap();
        client.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_requests_need_connection() {
        let client = SyncClient::new("ws://localhost:1234", "discussion:doc-1", "t1");
        assert!(matches!(client.send_ping().await, Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            client.request_diff(vec![0]).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), "discussion:doc-1", "t1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2]));
        assert!(queue.enqueue(vec![3]));
        assert!(!queue.enqueue(vec![4]));
        assert_eq!(queue.len(), 3);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:1234", "discussion:doc-1", "t1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
