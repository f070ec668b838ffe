//! End-to-end tests for the tunnel endpoint over a real WebSocket
//!
//! Drives the control channel the way an agent does: register, receive
//! request frames, answer them, disconnect.

use burrow_db::{connect, migrate, Store};
use burrow_proto::{next_request_id, Body, RelayFrame, TunnelRequest};
use burrow_relay::{AliasAllocator, ControlServer, DashboardBroadcaster, TunnelRegistry};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_endpoint() -> (Arc<TunnelRegistry>, SocketAddr) {
    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();
    let store = Store::new(db);

    let registry = Arc::new(TunnelRegistry::new("example.com"));
    let allocator = Arc::new(AliasAllocator::new(store, registry.clone(), 5));
    let broadcaster = Arc::new(DashboardBroadcaster::new(registry.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ControlServer::new(registry.clone(), allocator, broadcaster));
    tokio::spawn(server.run(listener, None));

    (registry, addr)
}

async fn dial(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .expect("connect failed");
    ws
}

async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("invalid frame json");
        }
    }
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

/// Register and return the assigned alias
async fn register(ws: &mut Ws, frame: serde_json::Value) -> String {
    send_json(ws, frame).await;
    let reply = recv_json(ws).await;
    assert_eq!(reply["type"], "registered", "unexpected reply: {}", reply);
    reply["alias"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_anonymous_registration() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;

    send_json(&mut ws, serde_json::json!({"type": "register"})).await;
    let reply = recv_json(&mut ws).await;

    assert_eq!(reply["type"], "registered");
    assert!(reply["uuid"].as_str().is_some());

    let alias = reply["alias"].as_str().unwrap();
    let (_prefix, hex) = alias.split_once('-').unwrap();
    assert_eq!(hex.len(), 12);

    assert_eq!(registry.count(), 1);
    let tunnel = registry.lookup_by_alias(alias).unwrap();
    assert_eq!(tunnel.user, "anonymous");
    assert!(tunnel.is_open());
}

#[tokio::test]
async fn test_authenticated_registration_shape() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;

    let alias = register(
        &mut ws,
        serde_json::json!({"type": "register", "user": "tok_x", "port": 3000}),
    )
    .await;

    let tunnel = registry.lookup_by_alias(&alias).unwrap();
    assert_eq!(tunnel.user, "tok_x");
    assert_eq!(tunnel.port, 3000);
}

#[tokio::test]
async fn test_request_response_roundtrip() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;
    let alias = register(&mut ws, serde_json::json!({"type": "register"})).await;

    let tunnel = registry.lookup_by_alias(&alias).unwrap();

    // Dispatch the way the edge does: slot first, then the frame
    let id = next_request_id();
    let rx = tunnel.pending.register(id).unwrap();
    tunnel
        .send(RelayFrame::Request(TunnelRequest {
            id,
            method: "GET".to_string(),
            path: "/ping".to_string(),
            headers: Default::default(),
            body: None,
            files: Vec::new(),
        }))
        .await
        .unwrap();

    // The agent side sees the request frame
    let request = recv_json(&mut ws).await;
    assert_eq!(request["method"], "GET");
    assert_eq!(request["path"], "/ping");
    assert_eq!(request["id"].as_u64().unwrap(), id);

    send_json(
        &mut ws,
        serde_json::json!({
            "id": id,
            "status": 200,
            "headers": {"content-type": "text/plain"},
            "body": "pong"
        }),
    )
    .await;

    let response = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, Some(200));
    assert_eq!(response.body, Some(Body::Text("pong".to_string())));
}

#[tokio::test]
async fn test_out_of_order_responses() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;
    let alias = register(&mut ws, serde_json::json!({"type": "register"})).await;
    let tunnel = registry.lookup_by_alias(&alias).unwrap();

    let id_a = next_request_id();
    let rx_a = tunnel.pending.register(id_a).unwrap();
    let id_b = id_a + 1;
    let rx_b = tunnel.pending.register(id_b).unwrap();

    for (id, path) in [(id_a, "/a"), (id_b, "/b")] {
        tunnel
            .send(RelayFrame::Request(TunnelRequest {
                id,
                method: "GET".to_string(),
                path: path.to_string(),
                headers: Default::default(),
                body: None,
                files: Vec::new(),
            }))
            .await
            .unwrap();
    }

    let first = recv_json(&mut ws).await;
    let second = recv_json(&mut ws).await;
    assert_eq!(first["id"].as_u64().unwrap(), id_a);
    assert_eq!(second["id"].as_u64().unwrap(), id_b);

    // Answer in reverse order; each response still reaches its own waiter
    send_json(&mut ws, serde_json::json!({"id": id_b, "status": 202})).await;
    send_json(&mut ws, serde_json::json!({"id": id_a, "status": 201})).await;

    let response_a = tokio::time::timeout(Duration::from_secs(5), rx_a)
        .await
        .unwrap()
        .unwrap();
    let response_b = tokio::time::timeout(Duration::from_secs(5), rx_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response_a.status, Some(201));
    assert_eq!(response_b.status, Some(202));
}

#[tokio::test]
async fn test_orphan_response_is_dropped() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;
    let alias = register(&mut ws, serde_json::json!({"type": "register"})).await;
    let tunnel = registry.lookup_by_alias(&alias).unwrap();

    let id = next_request_id();
    let rx = tunnel.pending.register(id).unwrap();

    // A response whose id matches nothing is dropped without touching the
    // real pending slot.
    send_json(&mut ws, serde_json::json!({"id": id + 999, "status": 500})).await;
    send_json(&mut ws, serde_json::json!({"id": id, "status": 200})).await;

    let response = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, Some(200));
}

#[tokio::test]
async fn test_disconnect_cleans_up() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;
    let alias = register(&mut ws, serde_json::json!({"type": "register"})).await;
    let tunnel = registry.lookup_by_alias(&alias).unwrap();

    let id = next_request_id();
    let rx = tunnel.pending.register(id).unwrap();

    ws.close(None).await.unwrap();

    // Teardown runs as soon as the close is observed
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "teardown never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!tunnel.is_open());
    assert!(registry.lookup_by_alias(&alias).is_none());

    // The pending waiter observes the abort, never a response
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_reconnect_gets_fresh_tunnel_id() {
    let (registry, addr) = start_endpoint().await;

    let mut ws = dial(addr).await;
    send_json(&mut ws, serde_json::json!({"type": "register"})).await;
    let first = recv_json(&mut ws).await;
    ws.close(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "teardown never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut ws = dial(addr).await;
    send_json(&mut ws, serde_json::json!({"type": "register"})).await;
    let second = recv_json(&mut ws).await;

    assert_ne!(first["uuid"], second["uuid"]);
}

#[tokio::test]
async fn test_two_agents_bijection() {
    let (registry, addr) = start_endpoint().await;

    let mut ws_a = dial(addr).await;
    let mut ws_b = dial(addr).await;
    let alias_a = register(&mut ws_a, serde_json::json!({"type": "register"})).await;
    let alias_b = register(&mut ws_b, serde_json::json!({"type": "register"})).await;

    assert_ne!(alias_a, alias_b);
    assert_eq!(registry.count(), 2);

    let tunnel_a = registry.lookup_by_alias(&alias_a).unwrap();
    let tunnel_b = registry.lookup_by_alias(&alias_b).unwrap();
    assert_eq!(tunnel_a.alias, alias_a);
    assert_eq!(tunnel_b.alias, alias_b);
    assert_ne!(tunnel_a.id, tunnel_b.id);
}

#[tokio::test]
async fn test_non_register_first_frame_closes_connection() {
    let (registry, addr) = start_endpoint().await;
    let mut ws = dial(addr).await;

    // A response frame before registration is a protocol violation
    send_json(&mut ws, serde_json::json!({"id": 1, "status": 200})).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never closed the connection"
        );
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("server never closed the connection"),
        }
    }

    assert_eq!(registry.count(), 0);
}
