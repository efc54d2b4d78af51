//! Backend connector: supervisor first, then a loopback WebSocket
//!
//! Every connect goes through `Supervisor::ensure`, so the socket is only
//! opened against a gateway that was just verified. The socket is then
//! pumped into a [`Link`] for the proxy session.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tether::config::GatewayConfig;
use tether::error::{Result, TetherError};
use tether::proxy::{close_code, BackendConnector, CloseFrame, Frame, Link};
use tether::Supervisor;
use tokio::net::TcpStream;
use tokio::select;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

pub struct GatewayConnector {
    supervisor: Arc<Supervisor>,
    desired: GatewayConfig,
    backend_path: String,
}

impl GatewayConnector {
    pub fn new(supervisor: Arc<Supervisor>, desired: GatewayConfig, backend_path: &str) -> Self {
        Self {
            supervisor,
            desired,
            backend_path: backend_path.to_string(),
        }
    }

    pub fn url(&self) -> String {
        let path = if self.backend_path.starts_with('/') {
            self.backend_path.clone()
        } else {
            format!("/{}", self.backend_path)
        };
        format!("ws://127.0.0.1:{}{}", self.desired.port, path)
    }
}

#[async_trait]
impl BackendConnector for GatewayConnector {
    async fn connect(&self) -> Result<Link> {
        let handle = self.supervisor.ensure(&self.desired).await?;
        let url = self.url();
        debug!(gateway = %handle.id(), url = %url, "Opening backend socket");

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TetherError::Backend(format!("connect to {} failed: {}", url, e)))?;

        let (proxy_end, pump_end) = Link::pair();
        tokio::spawn(pump_backend(socket, pump_end));
        Ok(proxy_end)
    }
}

/// Shuttle frames between the backend socket and the proxy's link
///
/// Dropping `link.tx` without a close frame tells the session the backend
/// was lost.
async fn pump_backend(socket: WebSocketStream<MaybeTlsStream<TcpStream>>, mut link: Link) {
    let (mut sink, mut stream) = socket.split();

    loop {
        select! {
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    let Some(frame) = frame_from_backend(msg) else { continue };
                    let closing = matches!(frame, Frame::Close(_));
                    if link.tx.send(frame).is_err() || closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Backend socket error: {}", e);
                    break;
                }
                None => break,
            },
            frame = link.rx.recv() => match frame {
                Some(frame) => {
                    let closing = matches!(frame, Frame::Close(_));
                    if sink.send(frame_to_backend(frame)).await.is_err() || closing {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
    let _ = sink.close().await;
}

fn frame_from_backend(msg: WsMessage) -> Option<Frame> {
    match msg {
        WsMessage::Text(text) => Some(Frame::Text(text)),
        WsMessage::Binary(data) => Some(Frame::Binary(data)),
        WsMessage::Close(Some(close)) => Some(Frame::Close(CloseFrame::new(
            u16::from(close.code),
            close.reason.into_owned(),
        ))),
        WsMessage::Close(None) => Some(Frame::Close(CloseFrame::new(close_code::NO_STATUS, ""))),
        // Ping/pong is answered by tungstenite itself
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
    }
}

fn frame_to_backend(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Close(close) => {
            let close = close.sendable();
            WsMessage::Close(Some(WsCloseFrame {
                code: CloseCode::from(close.code),
                reason: Cow::Owned(close.reason),
            }))
        }
    }
}
