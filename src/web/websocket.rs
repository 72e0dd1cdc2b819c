//! WebSocket pass-through
//!
//! The upstream connection is opened first so a dead backend yields a plain 503 instead of
//! an upgraded socket that closes immediately.

use crate::web::proxy::unavailable;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message as ClientMessage;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request headers carried over to the upstream handshake
const FORWARDED_HEADERS: &[&str] = &[
    "sec-websocket-protocol",
    "authorization",
    "cookie",
    "origin",
    "user-agent",
];

type Upstream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connect to `target` and relay frames in both directions
pub async fn relay(
    req: &HttpRequest,
    payload: web::Payload,
    target: String,
    restarting: bool,
) -> actix_web::Result<HttpResponse> {
    let mut request = match target.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!("Invalid WebSocket target {}: {}", target, e);
            return Ok(unavailable("OpenCode is unavailable", restarting));
        }
    };

    for name in FORWARDED_HEADERS {
        if let Some(value) = req.headers().get(*name) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                request.headers_mut().insert(name, value);
            }
        }
    }

    let (upstream, handshake) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            warn!("WebSocket connection to {} failed: {}", target, e);
            return Ok(unavailable("OpenCode is unavailable", restarting));
        }
        Err(_) => {
            warn!("WebSocket connection to {} timed out", target);
            return Ok(unavailable("OpenCode is unavailable", restarting));
        }
    };

    let (mut response, session, msg_stream) = actix_ws::handle(req, payload)?;

    if let Some(protocol) = handshake.headers().get("sec-websocket-protocol") {
        if let Ok(value) = header::HeaderValue::from_bytes(protocol.as_bytes()) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    debug!("WebSocket relay established to {}", target);
    actix_web::rt::spawn(pump(session, msg_stream, upstream));
    Ok(response)
}

async fn pump(mut session: actix_ws::Session, mut client: actix_ws::MessageStream, upstream: Upstream) {
    let (mut up_tx, mut up_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client.next() => {
                let forwarded = match msg {
                    Some(Ok(ClientMessage::Text(text))) => UpstreamMessage::Text(text.to_string()),
                    Some(Ok(ClientMessage::Binary(bytes))) => UpstreamMessage::Binary(bytes.to_vec()),
                    Some(Ok(ClientMessage::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => {
                        let _ = up_tx.send(UpstreamMessage::Close(None)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Client WebSocket error: {}", e);
                        let _ = up_tx.send(UpstreamMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = up_tx.send(forwarded).await {
                    debug!("Upstream WebSocket send failed: {}", e);
                    break;
                }
            }
            msg = up_rx.next() => {
                let sent = match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => session.text(text).await,
                    Some(Ok(UpstreamMessage::Binary(bytes))) => session.binary(bytes).await,
                    Some(Ok(UpstreamMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Upstream WebSocket error: {}", e);
                        break;
                    }
                };
                if sent.is_err() {
                    let _ = up_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            }
        }
    }

    let _ = session.close(None).await;
    debug!("WebSocket relay closed");
}
