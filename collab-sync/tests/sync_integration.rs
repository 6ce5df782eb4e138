//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use collab_sync::auth::{Identity, StaticTokenVerifier};
use collab_sync::client::{ConnectionState, SyncClient, SyncEvent, TokenPlacement};
use collab_sync::config::ServerConfig;
use collab_sync::protocol::{ClientMessage, DocumentKey, ServerMessage};
use collab_sync::server::SyncServer;
use collab_sync::storage::{MemoryStore, SnapshotStore};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn verifier() -> Arc<StaticTokenVerifier> {
    Arc::new(
        StaticTokenVerifier::new()
            .with_token("t1", Identity::new("user-x", "A"))
            .with_token("t2", Identity::new("user-y", "A"))
            .with_token("t3", Identity::new("user-z", "B")),
    )
}

/// Start a server over a shared in-memory store, return (server, url, store).
async fn start_test_server() -> (SyncServer, String, Arc<MemoryStore>) {
    start_server_with(ServerConfig::for_testing()).await
}

async fn start_server_with(config: ServerConfig) -> (SyncServer, String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let server = SyncServer::new(config, store.clone(), verifier());
    let addr = server.start().await.unwrap();
    (server, format!("ws://{addr}/"), store)
}

type RawSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Authenticate a bare socket and consume `Authenticated` plus the initial state.
async fn raw_session(url: &str, key: &str, token: &str) -> RawSocket {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let connect = ClientMessage::Connect {
        document_key: key.into(),
        token: Some(token.into()),
    };
    ws.send(Message::Binary(connect.encode().unwrap().into())).await.unwrap();
    for expected in ["Authenticated", "SyncStep2"] {
        let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        let Message::Binary(data) = reply else {
            panic!("Expected {expected}, got {reply:?}");
        };
        match (expected, ServerMessage::decode(&data).unwrap()) {
            ("Authenticated", ServerMessage::Authenticated { .. }) => {}
            ("SyncStep2", ServerMessage::SyncStep2(_)) => {}
            (_, other) => panic!("Expected {expected}, got {other:?}"),
        }
    }
    ws
}

/// Read past data and ping frames until the server closes; return the close code.
async fn close_code(ws: &mut RawSocket, within: Duration) -> CloseCode {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("close within timeout")
            .expect("socket open")
            .expect("readable frame");
        match frame {
            Message::Close(Some(frame)) => return frame.code,
            Message::Close(None) => panic!("Close frame without a code"),
            _ => {}
        }
    }
}

fn doc_key(tenant: &str, id: &str) -> DocumentKey {
    DocumentKey::new(tenant, "discussion", id).unwrap()
}

/// Append `text` to a local replica and return the produced fragment.
fn local_edit(doc: &Doc, text: &str) -> Vec<u8> {
    let mut txn = doc.transact_mut();
    let before = txn.state_vector();
    let body = txn.get_or_insert_text("body");
    let len = body.get_string(&txn).len() as u32;
    body.insert(&mut txn, len, text);
    txn.encode_diff_v1(&before)
}

/// Prepend `size` bytes of text; cheap to produce in bulk.
fn bulky_edit(doc: &Doc, size: usize) -> Vec<u8> {
    let mut txn = doc.transact_mut();
    let before = txn.state_vector();
    let body = txn.get_or_insert_text("body");
    body.insert(&mut txn, 0, &"x".repeat(size));
    txn.encode_diff_v1(&before)
}

fn apply_remote(doc: &Doc, bytes: &[u8]) {
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(bytes).unwrap()).unwrap();
}

fn text_of(doc: &Doc) -> String {
    let mut txn = doc.transact_mut();
    let body = txn.get_or_insert_text("body");
    body.get_string(&txn)
}

async fn next_event(events: &mut Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

/// Connect a client and drain `Authenticated` plus the initial state.
async fn connect_client(
    url: &str,
    key: &str,
    token: &str,
    placement: TokenPlacement,
) -> (SyncClient, Receiver<SyncEvent>, Doc) {
    let mut client = SyncClient::new(url, key, token).with_token_placement(placement);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match next_event(&mut events).await {
        SyncEvent::Authenticated { .. } => {}
        other => panic!("Expected Authenticated, got {other:?}"),
    }
    let replica = Doc::new();
    match next_event(&mut events).await {
        SyncEvent::StateSynced(state) => apply_remote(&replica, &state),
        other => panic!("Expected StateSynced, got {other:?}"),
    }
    (client, events, replica)
}

/// Assert nothing but transport noise arrives for a short while.
async fn assert_quiet(events: &mut Receiver<SyncEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        panic!("Unexpected event: {event:?}");
    }
}

async fn wait_until_evicted(server: &SyncServer, key: &DocumentKey) {
    for _ in 0..100 {
        if !server.registry().contains(key).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{key} was never evicted");
}

// ─── Collaboration ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_sessions_exchange_fragments_without_echo() {
    let (server, url, store) = start_test_server().await;

    let (mut x, mut x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (mut y, mut y_events, y_doc) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;

    let f1 = local_edit(&x_doc, "hello");
    x.send_update(f1.clone()).await.unwrap();
    match next_event(&mut y_events).await {
        SyncEvent::RemoteUpdate(fragment) => {
            assert_eq!(fragment, f1);
            apply_remote(&y_doc, &fragment);
        }
        other => panic!("Expected RemoteUpdate, got {other:?}"),
    }
    assert_quiet(&mut x_events).await;

    let f2 = local_edit(&y_doc, " world");
    y.send_update(f2.clone()).await.unwrap();
    match next_event(&mut x_events).await {
        SyncEvent::RemoteUpdate(fragment) => apply_remote(&x_doc, &fragment),
        other => panic!("Expected RemoteUpdate, got {other:?}"),
    }
    assert_eq!(text_of(&x_doc), "hello world");
    assert_eq!(text_of(&y_doc), "hello world");

    x.disconnect().await;
    y.disconnect().await;
    let key = doc_key("A", "doc-1");
    wait_until_evicted(&server, &key).await;

    assert_eq!(store.store_calls(), 1);
    let record = store.load(&key).unwrap().unwrap();
    assert_eq!(record.tenant_id, "A");
    let reloaded = Doc::new();
    apply_remote(&reloaded, &record.state);
    assert_eq!(text_of(&reloaded), "hello world");

    server.stop().await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let (server, url, _store) = start_test_server().await;

    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    x.send_update(local_edit(&x_doc, "first draft")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_y, _y_events, y_doc) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;
    assert_eq!(text_of(&y_doc), "first draft");

    server.stop().await;
}

#[tokio::test]
async fn test_different_documents_are_isolated() {
    let (server, url, _store) = start_test_server().await;

    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (_y, mut y_events, _) =
        connect_client(&url, "discussion:doc-2", "t2", TokenPlacement::Payload).await;

    x.send_update(local_edit(&x_doc, "private")).await.unwrap();
    assert_quiet(&mut y_events).await;
    assert_eq!(server.registry().live_documents().await, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_tenants_are_isolated_on_same_key() {
    let (server, url, _store) = start_test_server().await;

    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (_z, mut z_events, _) =
        connect_client(&url, "discussion:doc-1", "t3", TokenPlacement::Payload).await;

    x.send_update(local_edit(&x_doc, "tenant A only")).await.unwrap();
    assert_quiet(&mut z_events).await;
    assert!(server.registry().contains(&doc_key("A", "doc-1")).await);
    assert!(server.registry().contains(&doc_key("B", "doc-1")).await);

    server.stop().await;
}

#[tokio::test]
async fn test_state_vector_resync() {
    let (server, url, _store) = start_test_server().await;

    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (y, mut y_events, y_doc) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;

    x.send_update(local_edit(&x_doc, "catch up")).await.unwrap();
    // Y ignores the live fragment and asks for a diff instead
    assert!(matches!(next_event(&mut y_events).await, SyncEvent::RemoteUpdate(_)));

    let state_vector = {
        use yrs::updates::encoder::Encode;
        y_doc.transact().state_vector().encode_v1()
    };
    y.request_diff(state_vector).await.unwrap();
    match next_event(&mut y_events).await {
        SyncEvent::StateSynced(diff) => apply_remote(&y_doc, &diff),
        other => panic!("Expected StateSynced, got {other:?}"),
    }
    assert_eq!(text_of(&y_doc), "catch up");

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_fragment_keeps_session() {
    let (server, url, _store) = start_test_server().await;

    let (x, mut x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (_y, mut y_events, _) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;

    x.send_update(vec![0xFF, 0xFF, 0xFF]).await.unwrap();
    assert!(matches!(next_event(&mut x_events).await, SyncEvent::ServerError(_)));
    assert_quiet(&mut y_events).await;

    x.send_update(local_edit(&x_doc, "still here")).await.unwrap();
    assert!(matches!(next_event(&mut y_events).await, SyncEvent::RemoteUpdate(_)));
    assert_eq!(x.connection_state().await, ConnectionState::Connected);

    server.stop().await;
}

#[tokio::test]
async fn test_offline_queue_replayed_after_connect() {
    let (server, url, _store) = start_test_server().await;
    let (_y, mut y_events, y_doc) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;

    let x_doc = Doc::new();
    let mut x = SyncClient::new(url.as_str(), "discussion:doc-1", "t1");
    let _x_events = x.take_event_rx().unwrap();
    x.send_update(local_edit(&x_doc, "written offline")).await.unwrap();
    assert_eq!(x.offline_queue_len().await, 1);

    x.connect().await.unwrap();
    match next_event(&mut y_events).await {
        SyncEvent::RemoteUpdate(fragment) => apply_remote(&y_doc, &fragment),
        other => panic!("Expected RemoteUpdate, got {other:?}"),
    }
    assert_eq!(text_of(&y_doc), "written offline");
    assert_eq!(x.offline_queue_len().await, 0);

    server.stop().await;
}

// ─── Authentication ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_query_and_header_tokens_accepted() {
    let (server, url, _store) = start_test_server().await;

    let (_q, _, _) = connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Query).await;
    let (_h, _, _) = connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Header).await;
    assert_eq!(server.registry().ref_count(&doc_key("A", "doc-1")).await, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let (server, url, _store) = start_test_server().await;

    let mut client = SyncClient::new(url.as_str(), "discussion:doc-1", "forged");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        SyncEvent::Rejected("Unauthorized: invalid token".into())
    );
    assert_eq!(next_event(&mut events).await, SyncEvent::Disconnected);
    assert_eq!(server.registry().live_documents().await, 0);
    assert_eq!(server.stats().await.rejected_connections, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_missing_token_rejected_with_policy_close() {
    let (server, url, _store) = start_test_server().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let connect = ClientMessage::Connect {
        document_key: "discussion:doc-1".into(),
        token: None,
    };
    ws.send(Message::Binary(connect.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else {
        panic!("Expected binary reply, got {reply:?}");
    };
    assert_eq!(
        ServerMessage::decode(&data).unwrap(),
        ServerMessage::Unauthorized {
            reason: "Unauthorized: missing token".into()
        }
    );

    let close = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match close {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("Expected close frame, got {other:?}"),
    }
    assert_eq!(server.registry().live_documents().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_update_before_connect_rejected() {
    let (server, url, _store) = start_test_server().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let update = ClientMessage::Update(vec![1, 2, 3]);
    ws.send(Message::Binary(update.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else {
        panic!("Expected binary reply, got {reply:?}");
    };
    assert!(matches!(
        ServerMessage::decode(&data).unwrap(),
        ServerMessage::Unauthorized { .. }
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_document_key_refused() {
    let (server, url, _store) = start_test_server().await;

    let mut client = SyncClient::new(url.as_str(), "no-separator", "t1");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert!(matches!(next_event(&mut events).await, SyncEvent::ServerError(_)));
    assert_eq!(next_event(&mut events).await, SyncEvent::Disconnected);
    assert_eq!(server.registry().live_documents().await, 0);

    server.stop().await;
}

// ─── Reference counting & lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn test_refcount_single_flush_on_last_detach() {
    let (server, url, store) = start_test_server().await;
    let key = doc_key("A", "doc-1");

    let (mut x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (mut y, mut y_events, _) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;
    assert_eq!(server.registry().live_documents().await, 1);
    assert_eq!(server.registry().ref_count(&key).await, 2);

    x.send_update(local_edit(&x_doc, "kept")).await.unwrap();
    assert!(matches!(next_event(&mut y_events).await, SyncEvent::RemoteUpdate(_)));

    x.disconnect().await;
    for _ in 0..100 {
        if server.registry().ref_count(&key).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.registry().ref_count(&key).await, 1);
    assert!(server.registry().contains(&key).await);
    assert_eq!(store.store_calls(), 0);

    y.disconnect().await;
    wait_until_evicted(&server, &key).await;
    assert_eq!(store.store_calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions_and_flushes() {
    let (server, url, store) = start_test_server().await;

    let (x, mut x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    x.send_update(local_edit(&x_doc, "saved at shutdown")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = server.stop().await;
    assert_eq!(report.sessions_abandoned, 0);
    assert!(!report.flushes_abandoned);
    assert_eq!(report.flush_failures, 0);
    assert_eq!(next_event(&mut x_events).await, SyncEvent::Disconnected);

    let record = store.load(&doc_key("A", "doc-1")).unwrap().unwrap();
    let reloaded = Doc::new();
    apply_remote(&reloaded, &record.state);
    assert_eq!(text_of(&reloaded), "saved at shutdown");

    // New connections are refused once stopped
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_stop_during_handshake_and_auth_is_prompt() {
    let config = ServerConfig {
        auth_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::for_testing()
    };
    let (server, url, _store) = start_server_with(config).await;
    let addr = server.local_addr().await.unwrap();

    // One socket upgraded but silent, one that never starts the handshake
    let (mut silent, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let _bare = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    let report = server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());
    assert_eq!(report.sessions_abandoned, 0);
    assert!(!report.flushes_abandoned);

    assert_eq!(close_code(&mut silent, Duration::from_secs(2)).await, CloseCode::Away);
}

#[tokio::test]
async fn test_idle_session_closed() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..ServerConfig::for_testing()
    };
    let (server, url, _store) = start_server_with(config).await;
    let key = doc_key("A", "doc-1");

    let mut ws = raw_session(&url, "discussion:doc-1", "t1").await;
    assert_eq!(server.registry().ref_count(&key).await, 1);

    assert_eq!(close_code(&mut ws, Duration::from_secs(2)).await, CloseCode::Away);
    wait_until_evicted(&server, &key).await;

    server.stop().await;
}

#[tokio::test]
async fn test_active_session_outlives_idle_timeout() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..ServerConfig::for_testing()
    };
    let (server, url, _store) = start_server_with(config).await;

    let (x, mut x_events, _) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        x.send_ping().await.unwrap();
    }
    assert_eq!(x.connection_state().await, ConnectionState::Connected);
    assert_quiet(&mut x_events).await;

    server.stop().await;
}

#[tokio::test]
async fn test_lagging_receiver_disconnected() {
    let config = ServerConfig {
        broadcast_capacity: 1,
        send_timeout: Duration::from_secs(10),
        ..ServerConfig::for_testing()
    };
    let (server, url, _store) = start_server_with(config).await;

    let mut slow = raw_session(&url, "discussion:doc-1", "t2").await;
    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;

    // More than the socket buffers hold while the slow peer is not reading
    for _ in 0..320 {
        x.send_update(bulky_edit(&x_doc, 64 * 1024)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(close_code(&mut slow, Duration::from_secs(8)).await, CloseCode::Again);
    assert_eq!(server.stats().await.lagged_receivers, 1);
    assert_eq!(x.connection_state().await, ConnectionState::Connected);

    server.stop().await;
}

#[tokio::test]
async fn test_stats_track_traffic() {
    let (server, url, _store) = start_test_server().await;

    let (x, _x_events, x_doc) =
        connect_client(&url, "discussion:doc-1", "t1", TokenPlacement::Payload).await;
    let (_y, mut y_events, _) =
        connect_client(&url, "discussion:doc-1", "t2", TokenPlacement::Payload).await;
    x.send_update(local_edit(&x_doc, "count me")).await.unwrap();
    assert!(matches!(next_event(&mut y_events).await, SyncEvent::RemoteUpdate(_)));

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.merged_fragments, 1);
    assert_eq!(stats.live_documents, 1);
    assert!(stats.total_messages >= 3);

    server.stop().await;
}
