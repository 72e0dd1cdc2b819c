//! WebSocket upgrades relayed through a running gate

use agentgate::supervisor::BackendSupervisor;
use agentgate::web::{GateContext, GateServer};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};

/// A WebSocket server that echoes text and binary frames
async fn echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

async fn gate_for(backend_port: u16) -> (BackendSupervisor, GateServer) {
    let mut config = agentgate::Config::default();
    config.terminal.enabled = false;
    config.backend.port = Some(backend_port);
    config.backend.api_prefix = Some(String::new());
    config.supervisor.grace_period_ms = 0;

    let supervisor = BackendSupervisor::new(config.clone()).unwrap();
    // Grace already elapsed: requests are forwarded without a readiness pass
    supervisor.state().write().mark_not_ready(true, None);

    let context = GateContext::new(supervisor.clone(), None, None).unwrap();
    let gate = GateServer::bind(&config, context).unwrap();
    (supervisor, gate)
}

#[actix_web::test]
async fn test_frames_relayed_both_ways() {
    let backend_port = echo_backend().await;
    let (_supervisor, gate) = gate_for(backend_port).await;
    let addr = gate.local_addr();
    let handle = gate.handle();
    actix_web::rt::spawn(gate.run());

    let (mut ws, _) = tokio::time::timeout(
        Duration::from_secs(5),
        connect_async(format!("ws://{}/api/pty/stream", addr)),
    )
    .await
    .expect("gate did not accept the upgrade")
    .unwrap();

    ws.send(Message::Text("hello backend".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no text reply")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("hello backend".to_string()));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no binary reply")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Binary(vec![1, 2, 3]));

    ws.close(None).await.unwrap();
    handle.stop(false).await;
}

#[actix_web::test]
async fn test_unreachable_backend_refuses_upgrade() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_supervisor, gate) = gate_for(closed_port).await;
    let addr = gate.local_addr();
    let handle = gate.handle();
    actix_web::rt::spawn(gate.run());

    let err = connect_async(format!("ws://{}/api/pty/stream", addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected an HTTP 503, got {:?}", other),
    }

    handle.stop(false).await;
}
