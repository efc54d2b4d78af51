//! WebSocket edge: bridges each client socket onto a proxy session
//!
//! The client is accepted immediately. Gateway startup happens inside the
//! session, which keeps the client informed with status notices meanwhile.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{CloseFrame as WsCloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::Ordering;
use tether::proxy::{close_code, CloseFrame, Frame, Link};
use tokio::select;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (proxy_end, edge_end) = Link::pair();

    let proxy = state.proxy.clone();
    let active = state.active_sessions.clone();
    active.fetch_add(1, Ordering::Relaxed);
    let session = tokio::spawn(async move { proxy.run(proxy_end).await });

    pump_client(socket, edge_end).await;

    match session.await {
        Ok(report) => tracing::debug!(
            session = %report.session_id,
            outcome = ?report.outcome,
            "WebSocket bridge finished"
        ),
        Err(e) => tracing::error!("Proxy session task failed: {}", e),
    }
    active.fetch_sub(1, Ordering::Relaxed);
}

/// Shuttle frames between the client socket and the session's link
async fn pump_client(socket: WebSocket, mut link: Link) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(msg)) => {
                    let Some(frame) = frame_from_client(msg) else { continue };
                    let closing = matches!(frame, Frame::Close(_));
                    if link.tx.send(frame).is_err() || closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("Client socket error: {}", e);
                    break;
                }
                // Dropping link.tx reports the disconnect to the session
                None => break,
            },
            frame = link.rx.recv() => match frame {
                Some(frame) => {
                    let closing = matches!(frame, Frame::Close(_));
                    if sender.send(frame_to_client(frame)).await.is_err() || closing {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

fn frame_from_client(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Close(Some(close)) => Some(Frame::Close(CloseFrame::new(
            close.code,
            close.reason.into_owned(),
        ))),
        Message::Close(None) => Some(Frame::Close(CloseFrame::new(close_code::NO_STATUS, ""))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn frame_to_client(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close(close) => {
            let close = close.sendable();
            Message::Close(Some(WsCloseFrame {
                code: close.code,
                reason: Cow::Owned(close.reason),
            }))
        }
    }
}
