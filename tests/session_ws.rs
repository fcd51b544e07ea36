//! End-to-end session tests over real websockets.
//!
//! Each test serves the full application router on a free port and drives it
//! with tokio-tungstenite clients, verifying the join/edit/broadcast/teardown
//! pipeline as a client would see it.

use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use notesync::config::Config;
use notesync::registry::SessionRegistry;
use notesync::routes::create_app;
use notesync::AppState;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "test-secret";

fn seed_note(dir: &Path, username: &str, note: &str, contents: &str) {
    let user_dir = dir.join(username);
    std::fs::create_dir_all(&user_dir).unwrap();
    std::fs::write(user_dir.join(format!("{note}.md")), contents).unwrap();
}

/// Serve the app on a free port; return the websocket endpoint.
async fn spawn_app(note_dir: &Path) -> String {
    let mut config = Config::default();
    config.auth_jwt_secret = Some(SECRET.to_string());
    config.note_directory = note_dir.to_string_lossy().into_owned();

    let state = Arc::new(AppState {
        registry: SessionRegistry::new(note_dir.to_path_buf()),
        config,
    });
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("ws://{addr}/api/v1/ws")
}

fn make_token(username: &str) -> String {
    let claims = serde_json::json!({
        "sub": username,
        "exp": (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect(url: &str, username: &str) -> WsClient {
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", make_token(username)).parse().unwrap(),
    );
    let (client, _response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("websocket connect should succeed");
    client
}

/// Next JSON text frame, skipping control frames.
async fn recv_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended unexpectedly")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next close frame, skipping everything else.
async fn recv_close(client: &mut WsClient) -> Option<(CloseCode, String)> {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a close frame")?;
        match msg.expect("websocket error") {
            Message::Close(frame) => {
                return frame.map(|f| (f.code, f.reason.as_str().to_string()))
            }
            _ => continue,
        }
    }
}

fn edit(patches: serde_json::Value) -> Message {
    Message::text(
        serde_json::json!({ "type": "edit", "patches": patches }).to_string(),
    )
}

#[tokio::test]
async fn unauthenticated_upgrade_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let url = spawn_app(dir.path()).await;

    let request = format!("{url}?sid={}", Uuid::new_v4())
        .into_client_request()
        .unwrap();
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}

#[tokio::test]
async fn session_initiator_must_name_a_note() {
    let dir = tempfile::tempdir().unwrap();
    let url = spawn_app(dir.path()).await;

    let mut client = connect(&format!("{url}?sid={}", Uuid::new_v4()), "alice").await;
    let close = recv_close(&mut client).await.expect("expected a close frame");
    assert_eq!(close.0, CloseCode::Unsupported);
}

#[tokio::test]
async fn malformed_session_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let url = spawn_app(dir.path()).await;

    let mut client = connect(&format!("{url}?sid=not-a-uuid"), "alice").await;
    let close = recv_close(&mut client).await.expect("expected a close frame");
    assert_eq!(close.0, CloseCode::Unsupported);
}

#[tokio::test]
async fn join_bootstraps_current_document_state() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;

    let init = recv_json(&mut host).await;
    assert_eq!(init["type"], "init");
    assert_eq!(init["text"], "hello");
    assert_eq!(init["version"], 0);
}

#[tokio::test]
async fn edits_fan_out_as_diffs_to_peers_only() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;
    let _ = recv_json(&mut host).await;

    let mut guest = connect(&format!("{url}?sid={sid}"), "bob").await;
    let init = recv_json(&mut guest).await;
    assert_eq!(init["text"], "hello");

    host.send(edit(serde_json::json!([
        { "op": "equal", "text": "hello" },
        { "op": "insert", "text": " world" },
    ])))
    .await
    .unwrap();

    let diff = recv_json(&mut guest).await;
    assert_eq!(diff["type"], "diff");
    assert_eq!(
        diff["diffs"],
        serde_json::json!([
            { "op": "equal", "text": "hello" },
            { "op": "insert", "text": " world" },
        ])
    );

    // A second joiner sees the merged document, proving the write landed and
    // the host never got its own diff echoed back in between.
    let mut late = connect(&format!("{url}?sid={sid}"), "carol").await;
    let init = recv_json(&mut late).await;
    assert_eq!(init["text"], "hello world");
    assert_eq!(init["version"], 1);
}

#[tokio::test]
async fn stale_batch_is_rejected_to_its_sender_only() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;
    let _ = recv_json(&mut host).await;
    let mut guest = connect(&format!("{url}?sid={sid}"), "bob").await;
    let _ = recv_json(&mut guest).await;

    host.send(edit(serde_json::json!([
        { "op": "equal", "text": "hello" },
        { "op": "insert", "text": " world" },
    ])))
    .await
    .unwrap();
    let _ = recv_json(&mut guest).await;

    // Guest still believes the document is "hello".
    guest
        .send(edit(serde_json::json!([
            { "op": "equal", "text": "hello" },
            { "op": "insert", "text": "!" },
        ])))
        .await
        .unwrap();

    let reject = recv_json(&mut guest).await;
    assert_eq!(reject["type"], "reject");

    // The host sees nothing from the failed write; the next frame it gets is
    // the diff for a subsequent valid edit.
    guest
        .send(edit(serde_json::json!([
            { "op": "equal", "text": "hello world" },
            { "op": "insert", "text": "!" },
        ])))
        .await
        .unwrap();
    let diff = recv_json(&mut host).await;
    assert_eq!(diff["type"], "diff");
    assert_eq!(
        diff["diffs"],
        serde_json::json!([
            { "op": "equal", "text": "hello world" },
            { "op": "insert", "text": "!" },
        ])
    );
}

#[tokio::test]
async fn malformed_edit_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;
    let _ = recv_json(&mut host).await;

    host.send(Message::text(r#"{"type":"edit"}"#)).await.unwrap();
    let close = recv_close(&mut host).await.expect("expected a close frame");
    assert_eq!(close.0, CloseCode::Unsupported);
}

#[tokio::test]
async fn host_departure_terminates_the_session_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;
    let _ = recv_json(&mut host).await;
    let mut guest = connect(&format!("{url}?sid={sid}"), "bob").await;
    let _ = recv_json(&mut guest).await;

    host.send(edit(serde_json::json!([
        { "op": "equal", "text": "hello" },
        { "op": "insert", "text": " world" },
    ])))
    .await
    .unwrap();
    let _ = recv_json(&mut guest).await;

    host.close(None).await.unwrap();

    let close = recv_close(&mut guest).await.expect("expected a close frame");
    assert_eq!(close.0, CloseCode::Policy);
    assert_eq!(close.1, "session host disconnected");

    // The flush ran as part of teardown; the note holds the merged text.
    let mut merged = String::new();
    for _ in 0..20 {
        merged = std::fs::read_to_string(dir.path().join("alice").join("notes.md")).unwrap();
        if merged == "hello world" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(merged, "hello world");
}

#[tokio::test]
async fn guest_departure_leaves_the_session_running() {
    let dir = tempfile::tempdir().unwrap();
    seed_note(dir.path(), "alice", "notes", "hello");
    let url = spawn_app(dir.path()).await;

    let sid = Uuid::new_v4();
    let mut host = connect(&format!("{url}?sid={sid}&note_name=notes"), "alice").await;
    let _ = recv_json(&mut host).await;
    let mut guest = connect(&format!("{url}?sid={sid}"), "bob").await;
    let _ = recv_json(&mut guest).await;
    let mut witness = connect(&format!("{url}?sid={sid}"), "dave").await;
    let _ = recv_json(&mut witness).await;

    guest.close(None).await.unwrap();

    // The host can still write, and the remaining member still hears it.
    host.send(edit(serde_json::json!([
        { "op": "equal", "text": "hello" },
        { "op": "insert", "text": " again" },
    ])))
    .await
    .unwrap();
    let diff = recv_json(&mut witness).await;
    assert_eq!(diff["type"], "diff");

    // The write has been accepted, so a fresh joiner sees the merged text.
    let mut late = connect(&format!("{url}?sid={sid}"), "carol").await;
    let init = recv_json(&mut late).await;
    assert_eq!(init["text"], "hello again");
}
