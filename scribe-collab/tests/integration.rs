//! Integration tests for end-to-end WebSocket sessions.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use scribe_collab::protocol::{ClientMessage, ServerMessage, WireFormat};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_core::{Edit, SyncState};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port, return its URL.
async fn start_test_server(config: ServerConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://127.0.0.1:{port}")
}

/// Connect a client and wait for its first snapshot.
async fn join(url: &str, session: &str, username: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(ClientConfig::new(url, session, username));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synchronized { .. })).await;
    (client, events)
}

/// Receive events until one matches.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until `check` holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn raw_connect(
    url: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Next JSON text frame from a raw socket.
async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server(ServerConfig::default()).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_receives_snapshot() {
    let url = start_test_server(ServerConfig::default()).await;
    let mut client = SyncClient::new(ClientConfig::new(&url, "doc", "alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(SyncEvent::Connected)
    );
    match wait_for(&mut events, |e| matches!(e, SyncEvent::Synchronized { .. })).await {
        SyncEvent::Synchronized { revision, text } => {
            assert_eq!(revision, 0);
            assert_eq!(text, "");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.sync_state(), SyncState::Synced);
    assert!(client.client_id().is_some());
    assert_eq!(client.participants().len(), 1);
}

#[tokio::test]
async fn test_edit_reaches_other_participant() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    let (bob, mut bob_events) = join(&url, "doc", "bob").await;

    assert!(alice.input("hello"));
    assert_eq!(alice.flush().unwrap(), 1);

    wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Acknowledged { revision: 1, .. })
    })
    .await;
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteEdit { .. })).await {
        SyncEvent::RemoteEdit { revision, edits, .. } => {
            assert_eq!(revision, 1);
            assert_eq!(edits, vec![Edit::insert(0, "hello")]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bob.text(), "hello");
    assert_eq!(alice.unacknowledged(), 0);
}

#[tokio::test]
async fn test_late_joiner_gets_current_text() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    alice.input("draft");
    alice.flush().unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    let (carol, _events) = join(&url, "doc", "carol").await;
    assert_eq!(carol.text(), "draft");
    assert_eq!(carol.revision(), 1);
    assert_eq!(carol.participants().len(), 2);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, _alice_events) = join(&url, "doc", "alice").await;
    let (bob, _bob_events) = join(&url, "doc", "bob").await;

    alice.input("AAA");
    bob.input("BBB");
    alice.flush().unwrap();
    bob.flush().unwrap();

    eventually(|| alice.revision() == 2 && bob.revision() == 2).await;
    eventually(|| alice.unacknowledged() == 0 && bob.unacknowledged() == 0).await;
    assert_eq!(alice.text(), bob.text());
    assert_eq!(alice.text().len(), 6);
    assert!(alice.text().contains("AAA"));
    assert!(alice.text().contains("BBB"));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "one", "alice").await;
    let (bob, _bob_events) = join(&url, "two", "bob").await;

    alice.input("only here");
    alice.flush().unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.text(), "");
    assert_eq!(bob.revision(), 0);
    assert_eq!(bob.participants().len(), 1);
}

#[tokio::test]
async fn test_undo_and_redo_reach_everyone() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    let (bob, _bob_events) = join(&url, "doc", "bob").await;

    alice.input("hello");
    alice.flush().unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    eventually(|| bob.text() == "hello").await;

    alice.undo().unwrap();
    eventually(|| alice.text().is_empty() && bob.text().is_empty()).await;
    assert_eq!(alice.revision(), 2);
    assert_eq!(bob.revision(), 2);

    alice.redo().unwrap();
    eventually(|| alice.text() == "hello" && bob.text() == "hello").await;
    assert_eq!(bob.revision(), 3);
}

#[tokio::test]
async fn test_undo_with_empty_history_is_noop() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut events) = join(&url, "doc", "alice").await;
    alice.undo().unwrap();
    // Nothing to undo is a no-op, not an error.
    alice.ping().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pong)).await;
    assert_eq!(alice.revision(), 0);
}

#[tokio::test]
async fn test_history_request_and_updates() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    let (bob, mut bob_events) = join(&url, "doc", "bob").await;

    alice.input("hi");
    alice.flush().unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    bob.request_history().unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::HistoryReceived { .. })).await {
        SyncEvent::HistoryReceived { entries } => assert_eq!(entries, 1),
        other => panic!("unexpected {other:?}"),
    }
    let history = bob.history();
    assert_eq!(history[0].author, "alice");
    assert_eq!(history[0].applied_revision, 1);

    // Later edits are pushed as history updates.
    alice.input("hi!");
    alice.flush().unwrap();
    eventually(|| bob.history().len() == 2).await;
    assert_eq!(bob.history()[1].applied_revision, 2);
}

#[tokio::test]
async fn test_history_replay_over_network() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut events) = join(&url, "doc", "alice").await;

    alice.input("a");
    alice.flush().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    alice.input("ab");
    alice.flush().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { revision: 2, .. })).await;

    alice.request_history().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::HistoryReceived { .. })).await;

    assert_eq!(alice.replay_history(Duration::from_millis(1)).await.unwrap(), 2);
    match wait_for(&mut events, |e| matches!(e, SyncEvent::ReplayFrame { index: 1, .. })).await {
        SyncEvent::ReplayFrame { text, .. } => assert_eq!(text, "ab"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!alice.is_replaying());
    assert_eq!(alice.text(), "ab");
}

#[tokio::test]
async fn test_late_joiner_replay_starts_from_empty() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    alice.input("abc");
    alice.flush().unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;

    let (bob, mut bob_events) = join(&url, "doc", "bob").await;
    alice.input("abcd");
    alice.flush().unwrap();
    eventually(|| bob.text() == "abcd").await;
    // Only the tail of the ledger was pushed to Bob; it is not replayable.
    assert!(bob.history().is_empty());

    assert_eq!(bob.replay_history(Duration::from_millis(1)).await.unwrap(), 2);
    let mut frames = Vec::new();
    while frames.len() < 2 {
        if let SyncEvent::ReplayFrame { text, .. } =
            wait_for(&mut bob_events, |e| matches!(e, SyncEvent::ReplayFrame { .. })).await
        {
            frames.push(text);
        }
    }
    assert_eq!(frames, vec!["abc".to_string(), "abcd".to_string()]);
    assert_eq!(bob.history()[0].applied_revision, 1);
    assert_eq!(bob.text(), "abcd");
}

#[tokio::test]
async fn test_lagging_connection_receives_fresh_snapshot() {
    let url = start_test_server(ServerConfig {
        broadcast_capacity: 1,
        ..ServerConfig::default()
    })
    .await;
    let (alice, _alice_events) = join(&url, "doc", "alice").await;
    let (bob, mut bob_events) = join(&url, "doc", "bob").await;

    // Every edit broadcasts an update followed by a history update, which
    // overflows a one-slot ring before Bob's connection reads it.
    for text in ["a", "ab", "abc"] {
        alice.input(text);
        alice.flush().unwrap();
        eventually(|| alice.unacknowledged() == 0).await;
    }
    wait_for(&mut bob_events, |e| {
        matches!(e, SyncEvent::Synchronized { revision, .. } if *revision > 0)
    })
    .await;
    eventually(|| bob.text() == "abc" && bob.revision() == 3).await;
    assert_eq!(alice.text(), "abc");
    assert_eq!(bob.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn test_participant_join_and_leave_events() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    let (mut bob, _bob_events) = join(&url, "doc", "bob").await;
    let bob_id = bob.client_id().unwrap();

    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantJoined { .. })).await
    {
        SyncEvent::ParticipantJoined {
            client_id,
            participants,
        } => {
            assert_eq!(client_id, bob_id);
            assert_eq!(participants.len(), 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.disconnect().await;
    match wait_for(&mut alice_events, |e| matches!(e, SyncEvent::ParticipantLeft { .. })).await {
        SyncEvent::ParticipantLeft {
            client_id,
            participants,
        } => {
            assert_eq!(client_id, bob_id);
            assert_eq!(participants.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(alice.participants().len(), 1);
}

#[tokio::test]
async fn test_full_session_rejects_joiner() {
    let url = start_test_server(ServerConfig {
        max_participants_per_session: 1,
        ..ServerConfig::default()
    })
    .await;
    let (_alice, _alice_events) = join(&url, "doc", "alice").await;

    let mut bob = SyncClient::new(ClientConfig::new(&url, "doc", "bob"));
    let mut events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    match wait_for(&mut events, |e| matches!(e, SyncEvent::Rejected { .. })).await {
        SyncEvent::Rejected { batch_id, reason } => {
            assert!(batch_id.is_none());
            assert!(reason.contains("full"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bob.sync_state(), SyncState::Detached);
}

#[tokio::test]
async fn test_set_delay_above_maximum_is_rejected() {
    let url = start_test_server(ServerConfig {
        max_delay_ms: 500,
        ..ServerConfig::default()
    })
    .await;
    let (alice, mut events) = join(&url, "doc", "alice").await;
    alice.set_delay(Duration::from_secs(5)).unwrap();
    match wait_for(&mut events, |e| matches!(e, SyncEvent::Rejected { .. })).await {
        SyncEvent::Rejected { batch_id, reason } => {
            assert!(batch_id.is_none());
            assert!(reason.contains("500"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_delayed_session_still_converges() {
    let url = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join(&url, "doc", "alice").await;
    let (bob, _bob_events) = join(&url, "doc", "bob").await;

    alice.set_delay(Duration::from_millis(100)).unwrap();
    alice.input("x");
    bob.input("y");
    alice.flush().unwrap();
    bob.flush().unwrap();

    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    eventually(|| alice.revision() == 2 && bob.revision() == 2).await;
    eventually(|| alice.unacknowledged() == 0 && bob.unacknowledged() == 0).await;
    assert_eq!(alice.text(), bob.text());
}

#[tokio::test]
async fn test_reconnect_resends_unacknowledged_batch() {
    let url = start_test_server(ServerConfig::default()).await;
    let (_keeper, _keeper_events) = join(&url, "doc", "keeper").await;
    let (mut alice, mut events) = join(&url, "doc", "alice").await;

    alice.disconnect().await;
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);
    alice.input("offline");
    // Nothing to send through; the batch waits in the outbox.
    assert!(alice.flush().is_ok());
    assert_eq!(alice.unacknowledged(), 1);

    alice.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Acknowledged { .. })).await;
    assert_eq!(alice.text(), "offline");
    assert_eq!(alice.unacknowledged(), 0);
}

#[tokio::test]
async fn test_raw_json_client() {
    let url = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::Text(
        r#"{"join":{"session_id":"json","username":"raw"}}"#.into(),
    ))
    .await
    .unwrap();
    let init = next_json(&mut ws).await;
    assert_eq!(init["init"]["revision"], 0);
    assert_eq!(init["init"]["text"], "");

    let batch_id = Uuid::new_v4();
    let edit = serde_json::json!({
        "edit": {
            "session_id": "json",
            "revision": 0,
            "batch_id": batch_id,
            "operations": [{"insert": {"position": 0, "text": "hey"}}],
        }
    });
    ws.send(Message::Text(edit.to_string().into())).await.unwrap();

    // The joiner's own UserJoined may come first.
    let ack = loop {
        let value = next_json(&mut ws).await;
        if value.get("ack").is_some() {
            break value;
        }
    };
    assert_eq!(ack["ack"]["revision"], 1);
    assert_eq!(ack["ack"]["duplicate"], false);
    assert_eq!(ack["ack"]["batch_id"], batch_id.to_string());
}

#[tokio::test]
async fn test_malformed_and_invalid_edits_are_rejected() {
    let url = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::Text("not a message".into())).await.unwrap();
    let rejected = next_json(&mut ws).await;
    assert!(rejected.get("rejected").is_some(), "{rejected}");

    ws.send(Message::Text(
        r#"{"join":{"session_id":"doc","username":"raw"}}"#.into(),
    ))
    .await
    .unwrap();
    loop {
        if next_json(&mut ws).await.get("init").is_some() {
            break;
        }
    }

    let batch_id = Uuid::new_v4();
    let edit = serde_json::json!({
        "edit": {
            "session_id": "doc",
            "revision": 0,
            "batch_id": batch_id,
            "operations": [{"delete": {"position": 10, "length": 1}}],
        }
    });
    ws.send(Message::Text(edit.to_string().into())).await.unwrap();
    let rejected = loop {
        let value = next_json(&mut ws).await;
        if value.get("rejected").is_some() {
            break value;
        }
    };
    assert_eq!(rejected["rejected"]["batch_id"], batch_id.to_string());
    assert_eq!(rejected["rejected"]["revision"], 0);
}

#[tokio::test]
async fn test_edit_before_join_is_rejected() {
    let url = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;

    let message = ClientMessage::Edit {
        session_id: "doc".into(),
        revision: 0,
        batch_id: Uuid::new_v4(),
        operations: vec![Edit::insert(0, "x")],
    };
    ws.send(WireFormat::Binary.frame(&message).unwrap()).await.unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match WireFormat::parse::<ServerMessage>(&frame) {
        Some((Ok(ServerMessage::Rejected { batch_id, .. }), WireFormat::Binary)) => {
            assert!(batch_id.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_batch_is_acknowledged_once() {
    let url = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;
    let join = ClientMessage::Join {
        session_id: "doc".into(),
        username: "raw".into(),
    };
    ws.send(WireFormat::Binary.frame(&join).unwrap()).await.unwrap();

    let edit = ClientMessage::Edit {
        session_id: "doc".into(),
        revision: 0,
        batch_id: Uuid::new_v4(),
        operations: vec![Edit::insert(0, "x")],
    };
    ws.send(WireFormat::Binary.frame(&edit).unwrap()).await.unwrap();
    ws.send(WireFormat::Binary.frame(&edit).unwrap()).await.unwrap();

    let mut acks = Vec::new();
    while acks.len() < 2 {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Some((Ok(ServerMessage::Ack { revision, duplicate, .. }), _)) =
            WireFormat::parse::<ServerMessage>(&frame)
        {
            acks.push((revision, duplicate));
        }
    }
    assert_eq!(acks, vec![(1, false), (1, true)]);
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::sync::Arc::new(SyncServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _events) = join(&url, "doc", "alice").await;
    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 1);

    drop(alice);
    eventually_async(&server).await;
}

async fn eventually_async(server: &SyncServer) {
    timeout(Duration::from_secs(2), async {
        loop {
            let stats = server.stats().await;
            if stats.active_connections == 0 && stats.active_rooms == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection not released");
}
