//! Websocket endpoint.
//!
//! Each upgraded socket is adapted into a stream and sink of [`Frame`]s,
//! wrapped in a [`ConnectionPump`] and tracked in the registry until it
//! closes. Every data frame is answered with a reply naming the serving
//! generation, so clients can observe a reload. Replies are numbered per
//! connection in the order their frames arrived.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use molt_ecdysis::{ConnectionPump, Frame, FrameKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::AppState;
use crate::telemetry::metrics;

/// Create the websocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// Reply sent for every inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub version: String,
    pub pid: u32,
    pub connection: String,
    /// 1-based count of data frames received on this connection.
    pub seq: u64,
}

/// GET /ws
async fn websocket_handler(
    ws: WebSocketUpgrade,
    peer: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    debug!(peer = ?peer, "WebSocket upgrade requested");

    ws.on_failed_upgrade(|error| debug!(error = %error, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: Option<SocketAddr>, state: Arc<AppState>) {
    let transport = socket
        .map(|message| message.map(frame_from_message))
        .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(message_from_frame(frame))));
    let pump = ConnectionPump::open(transport, peer, state.pump_options);

    // The registry refuses new connections once draining has started.
    if !state.registry.add(&pump) {
        info!(connection = %pump.id(), "Refusing connection while draining");
        metrics::connections_refused().add(1, &[]);
        pump.close().await;
        return;
    }

    metrics::connections_active().record(state.registry.size() as i64, &[]);
    info!(connection = %pump.id(), peer = ?peer, "WebSocket connection established");

    serve_connection(&pump, &state).await;
    pump.close().await;

    metrics::connections_active().record(state.registry.size() as i64, &[]);
    info!(connection = %pump.id(), "WebSocket connection closed");
}

/// Answer data frames until the peer goes away or the connection is closed.
async fn serve_connection(pump: &ConnectionPump, state: &AppState) {
    let frames_received = metrics::frames_received();
    let frames_sent = metrics::frames_sent();
    let mut seq = 0u64;

    while let Ok(frame) = pump.receive().await {
        match frame.kind() {
            FrameKind::Text | FrameKind::Binary => {
                frames_received.add(1, &[]);
                seq += 1;
                debug!(
                    connection = %pump.id(),
                    kind = %frame.kind(),
                    len = frame.payload().len(),
                    "Received frame"
                );

                let reply = Reply {
                    version: state.banner.clone(),
                    pid: std::process::id(),
                    connection: pump.id().to_string(),
                    seq,
                };
                let body = match serde_json::to_string(&reply) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode reply");
                        continue;
                    }
                };

                if pump.write(Frame::text(body)).await.is_err() {
                    break;
                }
                frames_sent.add(1, &[]);
            }
            FrameKind::Close => {
                debug!(connection = %pump.id(), "Peer requested close");
                break;
            }
            // Pings are answered by the websocket layer itself.
            FrameKind::Ping | FrameKind::Pong => {}
        }
    }
}

pub(crate) fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::text(text),
        Message::Binary(data) => Frame::binary(data),
        Message::Ping(data) => Frame::ping(data),
        Message::Pong(data) => Frame::pong(data),
        Message::Close(None) => Frame::close(),
        Message::Close(Some(close)) => {
            let mut payload = close.code.to_be_bytes().to_vec();
            payload.extend_from_slice(close.reason.as_bytes());
            Frame::new(FrameKind::Close, payload)
        }
    }
}

pub(crate) fn message_from_frame(frame: Frame) -> Message {
    let kind = frame.kind();
    let payload = frame.into_payload();
    match kind {
        FrameKind::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
        FrameKind::Binary => Message::Binary(payload.to_vec()),
        FrameKind::Ping => Message::Ping(payload.to_vec()),
        FrameKind::Pong => Message::Pong(payload.to_vec()),
        FrameKind::Close if payload.len() >= 2 => Message::Close(Some(CloseFrame {
            code: u16::from_be_bytes([payload[0], payload[1]]),
            reason: Cow::Owned(String::from_utf8_lossy(&payload[2..]).into_owned()),
        })),
        FrameKind::Close if payload.is_empty() => Message::Close(None),
        FrameKind::Close => Message::Close(Some(CloseFrame {
            code: close_code::PROTOCOL,
            reason: Cow::Borrowed(""),
        })),
    }
}
