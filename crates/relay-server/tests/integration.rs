//! End-to-end tests over a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::payload::Payload;
use relay_core::{EventKind, UserId, WireEvent};
use relay_server::{RelayServer, StaticTokenVerifier};
use relay_session::SessionHub;
use relay_session::testutil::FixedSampler;
use relay_settings::RelaySettings;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_server() -> (String, RelayServer) {
    let mut settings = RelaySettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.server.auth_timeout_ms = 300;

    let hub = Arc::new(SessionHub::new(
        settings.clone(),
        Arc::new(FixedSampler::new(0, 0)),
    ));
    let verifier = StaticTokenVerifier::new([("tok-1", "u1"), ("tok-2", "u2")]);
    let server = RelayServer::new(settings, hub, Arc::new(verifier), None);
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn authenticate(ws: &mut WsStream, token: &str) {
    let frame = json!({"type": "authenticate", "token": token}).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

async fn wait_registered(server: &RelayServer, user: &str, count: usize) {
    let user = UserId::from(user);
    timeout(TIMEOUT, async {
        while server.hub().registry().connections_for_user(&user).len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_event(ws: &mut WsStream) -> WireEvent {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Text(text) => return WireEvent::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_close(ws: &mut WsStream) -> Option<CloseFrame> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

#[tokio::test]
async fn authenticated_client_receives_golden_path() {
    let (url, server) = boot_server().await;
    let mut ws = connect(&url).await;
    authenticate(&mut ws, "tok-1").await;
    wait_registered(&server, "u1", 1).await;

    let mut driver = server
        .hub()
        .start_execution("u1".into(), "researcher", "t1".into(), "r1".into())
        .unwrap();
    driver.thinking(Some("plan")).unwrap();
    driver.tool_executing("search", json!({"q": "x"})).unwrap();
    driver.tool_completed("search", json!({"hits": 1})).unwrap();
    driver.complete(Payload::new()).unwrap();

    let mut kinds = Vec::new();
    for _ in 0..5 {
        kinds.push(next_event(&mut ws).await.event);
    }
    assert_eq!(kinds, EventKind::ALL.to_vec());
}

#[tokio::test]
async fn events_stay_with_their_user() {
    let (url, server) = boot_server().await;
    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    authenticate(&mut alice, "tok-1").await;
    authenticate(&mut bob, "tok-2").await;
    wait_registered(&server, "u1", 1).await;
    wait_registered(&server, "u2", 1).await;

    let driver = server
        .hub()
        .start_execution("u2".into(), "coder", "t".into(), "r".into())
        .unwrap();
    let bob_exec = driver.id().to_string();
    let first = next_event(&mut bob).await;
    assert_eq!(first.execution_id(), Some(bob_exec.as_str()));

    assert!(
        timeout(Duration::from_millis(200), alice.next())
            .await
            .is_err(),
        "u1 received another user's event"
    );
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let (url, server) = boot_server().await;
    let mut ws = connect(&url).await;
    authenticate(&mut ws, "forged").await;

    let frame = next_close(&mut ws).await.unwrap();
    assert_eq!(u16::from(frame.code), 1008);
    assert_eq!(frame.reason.as_str(), "authentication_rejected");
    assert!(server.hub().registry().is_empty());
}

#[tokio::test]
async fn silent_socket_times_out() {
    let (url, _server) = boot_server().await;
    let mut ws = connect(&url).await;

    let frame = next_close(&mut ws).await.unwrap();
    assert_eq!(frame.reason.as_str(), "authentication_timeout");
}

#[tokio::test]
async fn client_close_unregisters_connection() {
    let (url, server) = boot_server().await;
    let mut ws = connect(&url).await;
    authenticate(&mut ws, "tok-1").await;
    wait_registered(&server, "u1", 1).await;

    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    ws.close(None).await.unwrap();
    wait_registered(&server, "u1", 0).await;
}

#[tokio::test]
async fn shutdown_closes_clients_with_reason() {
    let (url, server) = boot_server().await;
    let mut ws = connect(&url).await;
    authenticate(&mut ws, "tok-1").await;
    wait_registered(&server, "u1", 1).await;

    server.shutdown(Duration::from_secs(1)).await;
    let frame = next_close(&mut ws).await.unwrap();
    assert_eq!(u16::from(frame.code), 1001);
    assert_eq!(frame.reason.as_str(), "server_shutdown");
    assert!(server.hub().registry().is_empty());
}
