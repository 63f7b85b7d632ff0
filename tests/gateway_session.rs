//! Terminal gateway sessions over real sockets
//!
//! Wires the gateway against a local validate endpoint and a local PTY
//! echo server, then drives sessions through a real websocket client.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use uuid::Uuid;

use sandbox_daemon::docker::ContainerRuntime;
use sandbox_daemon::gateway::{
    relay, AuditLogger, TerminalGateway, CLOSE_BAD_REQUEST, CLOSE_NOT_RUNNING,
    CLOSE_UNAUTHORIZED,
};
use sandbox_daemon::testing::MockRuntime;

/// Start a PTY stand-in: accepts websocket connections and echoes every
/// data frame back unchanged.
async fn spawn_pty_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

/// Start a validate endpoint that accepts exactly one token.
async fn spawn_validate_endpoint(expected_token: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/internal/validate",
        post(move |Json(body): Json<serde_json::Value>| async move {
            if body["token"].as_str() == Some(expected_token) {
                (StatusCode::OK, Json(json!({ "user_id": "user-001" })))
            } else {
                (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Unauthorized" })))
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Start a gateway accept loop; each accepted connection runs the full
/// session lifecycle.
async fn spawn_gateway(gateway: Arc<TerminalGateway>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream).await;
            });
        }
    });

    addr
}

async fn expect_close_code(addr: SocketAddr, path: &str, expected: u16) {
    let (mut ws, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();

    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(expected));
                return;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn relays_bytes_exactly_and_audits_input() {
    let pty_addr = spawn_pty_echo_server().await;
    let project_id = Uuid::new_v4();
    let audit = Arc::new(AuditLogger::new(project_id, "user-001"));

    // Gateway endpoint: accept one client, dial the PTY, relay
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    {
        let audit = audit.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let client_ws = accept_async(stream).await.unwrap();
            let (pty_ws, _) = connect_async(format!("ws://{}/ws", pty_addr)).await.unwrap();
            relay(client_ws, pty_ws, audit).await;
        });
    }

    let (mut client, _) = connect_async(format!("ws://{}/", gateway_addr)).await.unwrap();

    // Binary stays binary, byte for byte
    client
        .send(Message::Binary(b"ls -la\n".to_vec()))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => assert_eq!(bytes, b"ls -la\n"),
        other => panic!("expected binary echo, got {:?}", other),
    }

    // Text stays text
    client
        .send(Message::Text("echo hi\n".to_string()))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "echo hi\n"),
        other => panic!("expected text echo, got {:?}", other),
    }

    client.close(None).await.unwrap();
    // Give the relay a beat to observe the close
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // One audit entry per inbound message, outbound not recorded
    let entries = audit.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.event == "terminal_input"));
    assert_eq!(entries[0].content, "ls -la\n");
    assert_eq!(entries[1].content, "echo hi\n");
    assert_eq!(entries[0].user_id, "user-001");
}

#[tokio::test]
async fn full_session_through_the_gateway() {
    let pty_addr = spawn_pty_echo_server().await;
    let validate_addr = spawn_validate_endpoint("good-token").await;

    let runtime = MockRuntime::shared();
    runtime.set_container_ip(Some("127.0.0.1"));

    let gateway = Arc::new(TerminalGateway::with_endpoints(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        &format!("http://{}/internal/validate", validate_addr),
        Some("secret".to_string()),
        pty_addr.port(),
    ));
    let gateway_addr = spawn_gateway(gateway).await;

    let project_id = Uuid::new_v4();
    let (mut client, _) = connect_async(format!(
        "ws://{}/terminal/{}?token=good-token",
        gateway_addr, project_id
    ))
    .await
    .unwrap();

    client.send(Message::Binary(b"pwd\n".to_vec())).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => assert_eq!(bytes, b"pwd\n"),
        other => panic!("expected binary echo, got {:?}", other),
    }

    // The gateway re-attached the side-car before resolving the IP
    assert!(runtime.called("connect_proxy"));
    assert!(runtime.called("get_container_ip"));
}

#[tokio::test]
async fn invalid_token_closes_with_4401() {
    let validate_addr = spawn_validate_endpoint("good-token").await;
    let runtime = MockRuntime::shared();

    let gateway = Arc::new(TerminalGateway::with_endpoints(
        runtime as Arc<dyn ContainerRuntime>,
        &format!("http://{}/internal/validate", validate_addr),
        None,
        7681,
    ));
    let gateway_addr = spawn_gateway(gateway).await;

    let project_id = Uuid::new_v4();
    expect_close_code(
        gateway_addr,
        &format!("/terminal/{}?token=wrong", project_id),
        CLOSE_UNAUTHORIZED,
    )
    .await;
}

#[tokio::test]
async fn bad_paths_close_with_4400() {
    let validate_addr = spawn_validate_endpoint("good-token").await;
    let runtime = MockRuntime::shared();

    let gateway = Arc::new(TerminalGateway::with_endpoints(
        runtime as Arc<dyn ContainerRuntime>,
        &format!("http://{}/internal/validate", validate_addr),
        None,
        7681,
    ));
    let gateway_addr = spawn_gateway(gateway).await;

    // Wrong shape
    expect_close_code(gateway_addr, "/console/whatever", CLOSE_BAD_REQUEST).await;

    // Missing token
    let project_id = Uuid::new_v4();
    expect_close_code(
        gateway_addr,
        &format!("/terminal/{}", project_id),
        CLOSE_BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn stopped_container_closes_with_4503() {
    let validate_addr = spawn_validate_endpoint("good-token").await;
    let runtime = MockRuntime::shared();
    runtime.set_container_ip(None);

    let gateway = Arc::new(TerminalGateway::with_endpoints(
        runtime as Arc<dyn ContainerRuntime>,
        &format!("http://{}/internal/validate", validate_addr),
        None,
        7681,
    ));
    let gateway_addr = spawn_gateway(gateway).await;

    let project_id = Uuid::new_v4();
    expect_close_code(
        gateway_addr,
        &format!("/terminal/{}?token=good-token", project_id),
        CLOSE_NOT_RUNNING,
    )
    .await;
}
