//! Integration tests for the WebSocket hub: auth on upgrade, routing,
//! heartbeat, presence events and connection teardown.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use mms_realtime::auth::jwt;
use mms_realtime::config::{Config, WsConfig};
use mms_realtime::state::AppState;
use mms_realtime::ws::{Hub, HubHandle};

const SECRET: &str = "integration-test-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Helper: start the server on a random port and return (addr, hub).
async fn start_test_server_with(ws: WsConfig) -> (SocketAddr, HubHandle) {
    let config = Config {
        jwt_secret: SECRET.to_string(),
        websocket: ws,
        ..Config::default()
    };
    let hub = Hub::spawn();
    let state = AppState::new(&config, hub.clone());
    let app = mms_realtime::routes::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hub)
}

async fn start_test_server() -> (SocketAddr, HubHandle) {
    start_test_server_with(WsConfig::default()).await
}

fn token_for(user_id: Uuid, username: &str) -> String {
    jwt::issue_access_token(
        SECRET.as_bytes(),
        user_id,
        username,
        chrono::Duration::minutes(5),
    )
    .expect("Failed to issue token")
}

/// Connect as `username` and wait for our own `user_joined` event, which
/// proves the hub has registered the connection.
async fn connect(addr: SocketAddr, username: &str) -> (Uuid, Ws) {
    let user_id = Uuid::new_v4();
    let url = format!("ws://{}/api/v1/ws?token={}", addr, token_for(user_id, username));
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect to WebSocket");

    loop {
        let events = next_events(&mut ws, Duration::from_secs(2))
            .await
            .expect("Expected own user_joined event");
        if events
            .iter()
            .any(|e| e["type"] == "user_joined" && e["data"]["user_id"] == user_id.to_string())
        {
            break;
        }
    }
    (user_id, ws)
}

/// Next text frame, split into its newline-separated JSON events.
/// Returns None on timeout, close, or stream end.
async fn next_events(ws: &mut Ws, wait: Duration) -> Option<Vec<Value>> {
    loop {
        match tokio::time::timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(
                    text.as_str()
                        .split('\n')
                        .map(|line| serde_json::from_str(line).expect("Frame is not JSON"))
                        .collect(),
                );
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Everything received until the connection stays quiet for `quiet`.
async fn collect_events(ws: &mut Ws, quiet: Duration) -> Vec<Value> {
    let mut all = Vec::new();
    while let Some(events) = next_events(ws, quiet).await {
        all.extend(events);
    }
    all
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("Failed to send frame");
}

/// Poll the hub until `user_id` has the expected online state.
async fn wait_online(hub: &HubHandle, user_id: Uuid, expected: bool) -> bool {
    for _ in 0..50 {
        if hub.is_online(user_id).await.unwrap() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_ws_rejects_missing_token() {
    let (addr, _hub) = start_test_server().await;
    let url = format!("ws://{}/api/v1/ws", addr);

    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), 401);
        }
        other => panic!("Expected HTTP 401, got: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_ws_rejects_invalid_token() {
    let (addr, hub) = start_test_server().await;
    let url = format!("ws://{}/api/v1/ws?token=invalid_jwt_token", addr);

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(
        matches!(result, Err(tokio_tungstenite::tungstenite::Error::Http(ref resp)) if resp.status() == 401),
        "Expected 401 for an invalid token"
    );
    assert!(hub.list_online().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ws_accepts_bearer_header() {
    let (addr, hub) = start_test_server().await;
    let user_id = Uuid::new_v4();

    let mut request = format!("ws://{}/api/v1/ws", addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token_for(user_id, "HeaderUser"))
            .parse()
            .unwrap(),
    );
    let (_ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("Bearer header should be accepted");

    assert!(wait_online(&hub, user_id, true).await);
}

#[tokio::test]
async fn test_direct_message_reaches_only_receiver() {
    let (addr, _hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;
    let (b, mut ws_b) = connect(addr, "Bob").await;
    collect_events(&mut ws_a, Duration::from_millis(200)).await;

    // A client-supplied sender_id must be replaced with the real one.
    send_json(
        &mut ws_a,
        json!({
            "type": "new_direct",
            "sender_id": Uuid::new_v4(),
            "receiver_id": b,
            "content": "hi",
        }),
    )
    .await;

    let received = collect_events(&mut ws_b, Duration::from_millis(300)).await;
    assert_eq!(received.len(), 1, "Bob should get exactly one frame: {:?}", received);
    assert_eq!(received[0]["type"], "new_direct");
    assert_eq!(received[0]["sender_id"], a.to_string());
    assert_eq!(received[0]["receiver_id"], b.to_string());
    assert_eq!(received[0]["content"], "hi");
    let ts = received[0]["timestamp"].as_str().expect("timestamp present");
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());

    let echoed = collect_events(&mut ws_a, Duration::from_millis(300)).await;
    assert!(echoed.is_empty(), "Sender should receive nothing: {:?}", echoed);
}

#[tokio::test]
async fn test_direct_message_to_offline_user_is_dropped() {
    let (addr, hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;

    send_json(
        &mut ws_a,
        json!({ "type": "new_direct", "receiver_id": Uuid::new_v4(), "content": "anyone?" }),
    )
    .await;

    assert!(collect_events(&mut ws_a, Duration::from_millis(300)).await.is_empty());
    assert!(hub.is_online(a).await.unwrap(), "Sender stays connected");
}

#[tokio::test]
async fn test_group_message_fans_out_to_online_members() {
    let (addr, hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;
    let (b, mut ws_b) = connect(addr, "Bob").await;
    let (_outsider, mut ws_out) = connect(addr, "Dave").await;
    let c = Uuid::new_v4(); // member who never connects

    let group = Uuid::new_v4();
    for member in [a, b, c] {
        hub.add_member(group, member).await;
    }
    collect_events(&mut ws_a, Duration::from_millis(200)).await;
    collect_events(&mut ws_b, Duration::from_millis(200)).await;
    collect_events(&mut ws_out, Duration::from_millis(200)).await;

    send_json(
        &mut ws_a,
        json!({ "type": "new_group", "group_id": group, "content": "hello team" }),
    )
    .await;

    let received = collect_events(&mut ws_b, Duration::from_millis(300)).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["group_id"], group.to_string());
    assert_eq!(received[0]["sender_id"], a.to_string());
    assert!(collect_events(&mut ws_a, Duration::from_millis(200)).await.is_empty());
    assert!(collect_events(&mut ws_out, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test]
async fn test_ping_gets_exactly_one_pong() {
    let (addr, _hub) = start_test_server().await;
    let (_a, mut ws_a) = connect(addr, "Alice").await;
    let (_b, mut ws_b) = connect(addr, "Bob").await;
    collect_events(&mut ws_a, Duration::from_millis(200)).await;

    send_json(&mut ws_a, json!({ "type": "ping" })).await;

    let replies = collect_events(&mut ws_a, Duration::from_millis(300)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["type"], "pong");
    assert!(collect_events(&mut ws_b, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test]
async fn test_typing_is_broadcast_to_everyone() {
    let (addr, _hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;
    let (_b, mut ws_b) = connect(addr, "Bob").await;
    collect_events(&mut ws_a, Duration::from_millis(200)).await;

    send_json(&mut ws_a, json!({ "type": "typing", "content": "..." })).await;

    let at_b = collect_events(&mut ws_b, Duration::from_millis(300)).await;
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_b[0]["type"], "typing");
    assert_eq!(at_b[0]["sender_id"], a.to_string());
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (addr, hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;

    ws_a.send(Message::text("{this is not json")).await.unwrap();
    send_json(&mut ws_a, json!({ "type": "unheard_of" })).await;
    send_json(&mut ws_a, json!({ "type": "ping" })).await;

    let replies = collect_events(&mut ws_a, Duration::from_millis(300)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["type"], "pong");
    assert!(hub.is_online(a).await.unwrap());
}

#[tokio::test]
async fn test_disconnect_announces_user_left() {
    let (addr, hub) = start_test_server().await;
    let (_a, mut ws_a) = connect(addr, "Alice").await;
    let (b, mut ws_b) = connect(addr, "Bob").await;
    collect_events(&mut ws_a, Duration::from_millis(200)).await;

    ws_b.send(Message::Close(None)).await.unwrap();

    let events = collect_events(&mut ws_a, Duration::from_millis(500)).await;
    let left: Vec<&Value> = events.iter().filter(|e| e["type"] == "user_left").collect();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["data"]["user_id"], b.to_string());
    assert_eq!(left[0]["data"]["username"], "Bob");
    assert!(wait_online(&hub, b, false).await);
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let (addr, hub) = start_test_server().await;
    let user_id = Uuid::new_v4();
    let url = format!("ws://{}/api/v1/ws?token={}", addr, token_for(user_id, "Phone"));

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert!(wait_online(&hub, user_id, true).await);
    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // The first connection is shut down by the server.
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "Replaced connection should be closed");

    assert_eq!(hub.list_online().await.unwrap(), vec![user_id]);

    // The replacement keeps working.
    collect_events(&mut second, Duration::from_millis(200)).await;
    send_json(&mut second, json!({ "type": "ping" })).await;
    let replies = collect_events(&mut second, Duration::from_millis(300)).await;
    assert_eq!(replies.len(), 1);
    assert!(hub.is_online(user_id).await.unwrap());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let ws_config = WsConfig {
        max_message_size: 1024,
        ..WsConfig::default()
    };
    let (addr, hub) = start_test_server_with(ws_config).await;
    let (a, mut ws_a) = connect(addr, "Alice").await;

    let big = json!({ "type": "typing", "content": "x".repeat(4096) });
    // The send may itself fail if the server closes first.
    let _ = ws_a.send(Message::text(big.to_string())).await;

    assert!(wait_online(&hub, a, false).await, "Oversized frame should disconnect");
}

#[tokio::test]
async fn test_idle_connection_is_dropped() {
    let ws_config = WsConfig {
        pong_wait_secs: 1,
        ..WsConfig::default()
    };
    let (addr, hub) = start_test_server_with(ws_config).await;
    let (a, _ws_a) = connect(addr, "Sleepy").await;

    // Not reading means pings go unanswered and nothing arrives inbound.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(wait_online(&hub, a, false).await);
}

#[tokio::test]
async fn test_responsive_connection_outlives_pong_wait() {
    let ws_config = WsConfig {
        pong_wait_secs: 1,
        ..WsConfig::default()
    };
    let (addr, hub) = start_test_server_with(ws_config).await;
    let (a, mut ws_a) = connect(addr, "Awake").await;

    // Reading lets the client answer each server ping with a pong, and every
    // pong restarts the server's idle deadline.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut pings = 0;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws_a.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) => pings += 1,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => panic!("Connection failed while reading: {}", e),
            Ok(None) => panic!("Server closed a responsive connection"),
            Err(_) => break,
        }
    }

    assert!(pings >= 2, "Expected periodic pings, saw {}", pings);
    assert!(hub.is_online(a).await.unwrap());
}

#[tokio::test]
async fn test_binary_frame_is_dropped_and_connection_stays_open() {
    let (addr, hub) = start_test_server().await;
    let (a, mut ws_a) = connect(addr, "Alice").await;

    ws_a.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    send_json(&mut ws_a, json!({ "type": "ping" })).await;

    let replies = collect_events(&mut ws_a, Duration::from_millis(300)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["type"], "pong");
    assert!(hub.is_online(a).await.unwrap());
}

#[tokio::test]
async fn test_server_push_read_receipt() {
    let (addr, hub) = start_test_server().await;
    let (reader, mut ws_reader) = connect(addr, "Reader").await;
    let (author, mut ws_author) = connect(addr, "Author").await;
    collect_events(&mut ws_reader, Duration::from_millis(200)).await;

    hub.notify_read(reader, author).await;

    let events = collect_events(&mut ws_author, Duration::from_millis(300)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "read_receipt");
    assert_eq!(events[0]["sender_id"], reader.to_string());
    assert!(collect_events(&mut ws_reader, Duration::from_millis(200)).await.is_empty());
}
