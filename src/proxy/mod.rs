//! Reconnecting Proxy
//!
//! Each client connection gets one session that outlives individual backend
//! connections. The client is accepted at once and kept informed while the
//! gateway starts; unexpected backend losses are retried a bounded number of
//! times; clean closes and client-initiated closes end the session.
//!
//! The proxy works on [`Link`]s (a pair of frame channels) rather than
//! sockets. The edge server bridges real WebSockets onto links; tests drive
//! links directly.

pub mod filter;
pub mod session;

pub use filter::{ErrorTranslator, PresentationFilter};
pub use session::{ClientSession, ReconnectDecision, SessionState};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{Result, TetherError};

/// WebSocket close codes the proxy cares about
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

/// Longest close reason a WebSocket close frame can carry
pub const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Build a close frame, truncating `reason` on a char boundary
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: truncate_reason(reason.into()),
        }
    }

    /// 1000 and 1001 end the session without a reconnect
    pub fn is_clean(&self) -> bool {
        matches!(self.code, close_code::NORMAL | close_code::GOING_AWAY)
    }

    /// Same frame with a code that may legally be sent on the wire
    pub fn sendable(&self) -> Self {
        let code = match self.code {
            1000..=1003 | 1007..=1014 | 3000..=4999 => self.code,
            _ => close_code::NORMAL,
        };
        Self {
            code,
            reason: self.reason.clone(),
        }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Message relayed between client, edge and backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(CloseFrame),
}

/// One end of a bidirectional frame channel
pub struct Link {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Two connected ends: what one sends, the other receives
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }
}

/// Produces a verified backend connection
///
/// Implementations call the supervisor first, so a connect may take as long
/// as a gateway startup.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// Timing and bounds for every session
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
    pub status_interval: Duration,
    pub stable_after: Duration,
}

impl From<&ProxyConfig> for ProxySettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_reconnects: config.max_reconnects,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            status_interval: Duration::from_millis(config.status_interval_ms),
            stable_after: Duration::from_millis(config.stable_after_ms),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

/// Interim notice sent to the client while no backend is attached
#[derive(Debug, Clone, Serialize)]
pub struct StatusNotice {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl StatusNotice {
    pub fn starting() -> Self {
        Self {
            kind: "status",
            state: "starting",
            message: "Gateway is starting, please wait.",
            attempt: None,
            max_attempts: None,
        }
    }

    pub fn reconnecting(attempt: u32, max_attempts: u32) -> Self {
        Self {
            kind: "status",
            state: "reconnecting",
            message: "Connection to the gateway was lost, reconnecting.",
            attempt: Some(attempt),
            max_attempts: Some(max_attempts),
        }
    }

    fn to_frame(&self) -> Frame {
        Frame::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed or went away
    ClientClosed,
    /// The backend closed cleanly with this code
    BackendClosed(u16),
    /// The first backend could not be obtained
    ConnectFailed,
    ReconnectExhausted,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub connects: u32,
    pub forwarded: u64,
    pub dropped: u64,
}

enum ConnectOutcome {
    Connected(Link),
    ClientGone,
    Failed(TetherError),
}

enum RelayEnd {
    ClientGone,
    BackendClean(CloseFrame),
    BackendLost,
}

pub struct ReconnectingProxy {
    connector: Arc<dyn BackendConnector>,
    filter: Arc<dyn PresentationFilter>,
    settings: ProxySettings,
}

impl ReconnectingProxy {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        filter: Arc<dyn PresentationFilter>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            connector,
            filter,
            settings,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Drive one client session to completion
    pub async fn run(&self, mut client: Link) -> SessionReport {
        let mut session = ClientSession::new(
            self.settings.max_reconnects,
            self.settings.reconnect_delay,
        );
        let mut connects = 0u32;
        info!(session = %session.id(), "Client session opened");

        connects += 1;
        let mut backend = match self
            .connect_with_status(&mut client, &mut session, StatusNotice::starting(), Duration::ZERO)
            .await
        {
            ConnectOutcome::Connected(link) => link,
            ConnectOutcome::ClientGone => {
                session.close();
                return self.report(&session, SessionOutcome::ClientClosed, connects);
            }
            ConnectOutcome::Failed(e) => {
                warn!(session = %session.id(), error = %e, "Initial backend connect failed");
                let reason = self.filter.close_reason(&e);
                let _ = client
                    .tx
                    .send(Frame::Close(CloseFrame::new(close_code::INTERNAL_ERROR, reason)));
                session.close();
                return self.report(&session, SessionOutcome::ConnectFailed, connects);
            }
        };

        loop {
            session.attach_backend(backend.tx.clone());
            let end = self.relay(&mut client, &mut session, &mut backend.rx).await;

            match end {
                RelayEnd::ClientGone => {
                    return self.report(&session, SessionOutcome::ClientClosed, connects);
                }
                RelayEnd::BackendClean(frame) => {
                    debug!(session = %session.id(), code = frame.code, "Backend closed cleanly");
                    let code = frame.code;
                    let _ = client.tx.send(Frame::Close(frame));
                    session.close();
                    return self.report(&session, SessionOutcome::BackendClosed(code), connects);
                }
                RelayEnd::BackendLost => {}
            }

            // Reconnect until a backend attaches or the bound is hit
            backend = loop {
                let (attempt, delay) = match session.on_backend_lost() {
                    ReconnectDecision::Retry { attempt, delay } => (attempt, delay),
                    ReconnectDecision::Exhausted { attempts } => {
                        warn!(session = %session.id(), attempts, "Reconnect attempts exhausted");
                        let reason = self
                            .filter
                            .close_reason(&TetherError::ReconnectExhausted { attempts });
                        let _ = client
                            .tx
                            .send(Frame::Close(CloseFrame::new(close_code::INTERNAL_ERROR, reason)));
                        return self.report(&session, SessionOutcome::ReconnectExhausted, connects);
                    }
                };

                info!(session = %session.id(), attempt, delay = ?delay, "Backend lost, reconnecting");
                let notice = StatusNotice::reconnecting(attempt, self.settings.max_reconnects);
                let _ = client.tx.send(notice.to_frame());

                if !self.wait_watching_client(&mut client, &mut session, delay).await {
                    session.close();
                    return self.report(&session, SessionOutcome::ClientClosed, connects);
                }

                connects += 1;
                // The notice above already went out; repeat it only once the interval passes
                let repeat_after = self.settings.status_interval;
                match self
                    .connect_with_status(&mut client, &mut session, notice, repeat_after)
                    .await
                {
                    ConnectOutcome::Connected(link) => break link,
                    ConnectOutcome::ClientGone => {
                        session.close();
                        return self.report(&session, SessionOutcome::ClientClosed, connects);
                    }
                    ConnectOutcome::Failed(e) => {
                        warn!(session = %session.id(), attempt, error = %e, "Reconnect failed");
                    }
                }
            };
        }
    }

    /// Run the connector while sending status notices and watching the client
    async fn connect_with_status(
        &self,
        client: &mut Link,
        session: &mut ClientSession,
        notice: StatusNotice,
        first_notice_after: Duration,
    ) -> ConnectOutcome {
        let connect = self.connector.connect();
        tokio::pin!(connect);
        let mut ticker = tokio::time::interval_at(
            Instant::now() + first_notice_after,
            self.settings.status_interval,
        );

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => ConnectOutcome::Connected(link),
                        Err(e) => ConnectOutcome::Failed(e),
                    };
                }
                _ = ticker.tick() => {
                    let _ = client.tx.send(notice.to_frame());
                }
                frame = client.rx.recv() => match frame {
                    Some(Frame::Close(_)) | None => return ConnectOutcome::ClientGone,
                    Some(other) => {
                        session.forward(other);
                    }
                }
            }
        }
    }

    /// Sleep for `delay`; `false` if the client left meanwhile
    async fn wait_watching_client(
        &self,
        client: &mut Link,
        session: &mut ClientSession,
        delay: Duration,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                frame = client.rx.recv() => match frame {
                    Some(Frame::Close(_)) | None => return false,
                    Some(other) => {
                        session.forward(other);
                    }
                }
            }
        }
    }

    async fn relay(
        &self,
        client: &mut Link,
        session: &mut ClientSession,
        backend_rx: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> RelayEnd {
        let stable_at = Instant::now() + self.settings.stable_after;

        loop {
            tokio::select! {
                frame = client.rx.recv() => match frame {
                    Some(Frame::Close(frame)) => {
                        session.close_backend(frame.sendable());
                        return RelayEnd::ClientGone;
                    }
                    None => {
                        session.close_backend(CloseFrame::new(close_code::ABNORMAL, "client disconnected").sendable());
                        return RelayEnd::ClientGone;
                    }
                    Some(other) => {
                        session.forward(other);
                    }
                },
                frame = backend_rx.recv() => match frame {
                    Some(Frame::Close(frame)) if frame.is_clean() => return RelayEnd::BackendClean(frame),
                    Some(Frame::Close(frame)) => {
                        debug!(session = %session.id(), code = frame.code, reason = %frame.reason, "Backend closed unexpectedly");
                        return RelayEnd::BackendLost;
                    }
                    None => return RelayEnd::BackendLost,
                    Some(Frame::Text(text)) => {
                        let _ = client.tx.send(Frame::Text(self.filter.filter_text(text)));
                    }
                    Some(Frame::Binary(data)) => {
                        let _ = client.tx.send(Frame::Binary(data));
                    }
                },
                _ = sleep_until(stable_at), if session.reconnect_attempts() > 0 => {
                    session.mark_stable();
                }
            }
        }
    }

    fn report(&self, session: &ClientSession, outcome: SessionOutcome, connects: u32) -> SessionReport {
        info!(
            session = %session.id(),
            outcome = ?outcome,
            connects,
            forwarded = session.forwarded(),
            dropped = session.dropped(),
            "Client session closed"
        );
        SessionReport {
            session_id: session.id().to_string(),
            outcome,
            connects,
            forwarded: session.forwarded(),
            dropped: session.dropped(),
        }
    }
}
