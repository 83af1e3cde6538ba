//! End-to-end WebSocket integration tests.
//!
//! These start a real server and speak the JSON frame protocol over real
//! sockets, verifying the full join/edit/broadcast pipeline.

use std::sync::Arc;
use std::time::Duration;

use diffsync::{
    commands, DiffEngine, DiffOptions, Edit, Frame, MemoryAdapter, ServerConfig, SyncServer,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server(seed: Value) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        storage_path: None,
    };
    let adapter = Arc::new(MemoryAdapter::new(seed));
    let server = SyncServer::with_adapter(config, adapter);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream
}

async fn send_frame(client: &mut WsClient, frame: Frame) {
    let encoded = frame.encode().unwrap();
    client.send(Message::Text(encoded.into())).await.unwrap();
}

async fn next_frame(client: &mut WsClient) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("no websocket error");
        if let Message::Text(text) = msg {
            return Frame::decode(text.as_str()).expect("decodable frame");
        }
    }
}

async fn join(client: &mut WsClient, room: &str, user: &str, seq: u64) -> Value {
    send_frame(
        client,
        Frame::reply(commands::JOIN, Some(seq), json!({"room": room, "userId": user})),
    )
    .await;
    let reply = next_frame(client).await;
    assert_eq!(reply.event, commands::JOIN);
    assert_eq!(reply.seq, Some(seq));
    reply.data
}

#[tokio::test]
async fn test_join_returns_initial_document() {
    let port = start_test_server(json!({"text": "hello"})).await;
    let mut client = connect(port).await;

    let document = join(&mut client, "r", "alice", 1).await;
    assert_eq!(document, json!({"text": "hello"}));
}

#[tokio::test]
async fn test_edit_roundtrip_and_ack() {
    let port = start_test_server(json!({"text": "hello"})).await;
    let mut client = connect(port).await;
    let engine = DiffEngine::new(DiffOptions::default());

    let document = join(&mut client, "r", "alice", 1).await;
    let edited = json!({"text": "hello world"});
    let edit = Edit {
        server_version: 0,
        local_version: 0,
        diff: engine.diff(&document, &edited),
    };

    send_frame(
        &mut client,
        Frame::reply(
            commands::SYNC_WITH_SERVER,
            Some(2),
            json!({"room": "r", "serverVersion": 0, "edits": [edit]}),
        ),
    )
    .await;

    // The sender gets the room broadcast and the ack; order is not fixed.
    let mut saw_reply = false;
    let mut saw_update = false;
    for _ in 0..2 {
        let frame = next_frame(&mut client).await;
        match frame.event.as_str() {
            commands::SYNC_WITH_SERVER => {
                assert_eq!(frame.seq, Some(2));
                assert_eq!(frame.data["localVersion"], 1);
                assert_eq!(frame.data["serverVersion"], 0);
                assert_eq!(frame.data["edits"], json!([]));
                saw_reply = true;
            }
            commands::REMOTE_UPDATE_INCOMING => {
                assert!(frame.data.is_string());
                saw_update = true;
            }
            other => panic!("unexpected event {other}"),
        }
    }
    assert!(saw_reply && saw_update);
}

#[tokio::test]
async fn test_second_client_notified_and_synced() {
    let port = start_test_server(json!({"text": "hello"})).await;
    let engine = DiffEngine::new(DiffOptions::default());

    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "r", "alice", 1).await;
    let bob_doc = join(&mut bob, "r", "bob", 1).await;

    // Alice edits.
    let edited = json!({"text": "hello world"});
    let edit = Edit {
        server_version: 0,
        local_version: 0,
        diff: engine.diff(&json!({"text": "hello"}), &edited),
    };
    send_frame(
        &mut alice,
        Frame::reply(
            commands::SYNC_WITH_SERVER,
            Some(2),
            json!({"room": "r", "serverVersion": 0, "edits": [edit]}),
        ),
    )
    .await;

    // Bob is told an update is incoming...
    let frame = next_frame(&mut bob).await;
    assert_eq!(frame.event, commands::REMOTE_UPDATE_INCOMING);

    // ...and fetches it with an empty sync.
    send_frame(
        &mut bob,
        Frame::reply(
            commands::SYNC_WITH_SERVER,
            Some(2),
            json!({"room": "r", "serverVersion": 0, "edits": []}),
        ),
    )
    .await;
    let frame = next_frame(&mut bob).await;
    assert_eq!(frame.event, commands::SYNC_WITH_SERVER);
    let edits = frame.data["edits"].as_array().unwrap();
    assert_eq!(edits.len(), 1);

    // Applying the server's diff converges Bob onto the edited document.
    let server_edit: Edit = serde_json::from_value(edits[0].clone()).unwrap();
    let mut converged = bob_doc;
    engine.patch(&mut converged, &server_edit.diff);
    assert_eq!(converged, edited);
}

#[tokio::test]
async fn test_sync_without_join_errors() {
    let port = start_test_server(json!({})).await;
    let mut client = connect(port).await;

    send_frame(
        &mut client,
        Frame::reply(
            commands::SYNC_WITH_SERVER,
            Some(1),
            json!({"room": "r", "edits": []}),
        ),
    )
    .await;

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.event, commands::ERROR);
    assert_eq!(frame.data, json!("Need to re-connect!"));
}

#[tokio::test]
async fn test_disconnect_tears_down_client_state() {
    let port = start_test_server(json!({"text": "hi"})).await;

    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "r", "alice", 1).await;
    join(&mut bob, "r", "bob", 1).await;

    // Bob disconnects; a later edit from Alice must still flow.
    bob.close(None).await.unwrap();
    drop(bob);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let engine = DiffEngine::new(DiffOptions::default());
    let edit = Edit {
        server_version: 0,
        local_version: 0,
        diff: engine.diff(&json!({"text": "hi"}), &json!({"text": "bye"})),
    };
    send_frame(
        &mut alice,
        Frame::reply(
            commands::SYNC_WITH_SERVER,
            Some(2),
            json!({"room": "r", "serverVersion": 0, "edits": [edit]}),
        ),
    )
    .await;

    let mut saw_reply = false;
    for _ in 0..2 {
        let frame = next_frame(&mut alice).await;
        if frame.event == commands::SYNC_WITH_SERVER {
            assert_eq!(frame.data["localVersion"], 1);
            saw_reply = true;
        }
    }
    assert!(saw_reply);
}

#[tokio::test]
async fn test_malformed_frame_is_ignored() {
    let port = start_test_server(json!({"n": 1})).await;
    let mut client = connect(port).await;

    client
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    // The connection survives; a join still works.
    let document = join(&mut client, "r", "alice", 1).await;
    assert_eq!(document, json!({"n": 1}));
}
