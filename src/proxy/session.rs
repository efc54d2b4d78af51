//! Per-client session state
//!
//! The session owns the only reference to the current backend. Relaying,
//! attaching and detaching all go through it, so there is never more than one
//! backend receiving a client's frames.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{CloseFrame, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first backend
    Connecting,
    /// Relaying to an attached backend
    Active,
    /// Backend lost unexpectedly, waiting to retry
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Next step after the backend went away unexpectedly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

pub struct ClientSession {
    id: String,
    state: SessionState,
    backend: Option<mpsc::UnboundedSender<Frame>>,
    reconnect_attempts: u32,
    max_reconnects: u32,
    reconnect_delay: Duration,
    forwarded: u64,
    dropped: u64,
}

impl ClientSession {
    pub fn new(max_reconnects: u32, reconnect_delay: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Connecting,
            backend: None,
            reconnect_attempts: 0,
            max_reconnects,
            reconnect_delay,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Make `backend` the current backend, replacing any previous one
    pub fn attach_backend(&mut self, backend: mpsc::UnboundedSender<Frame>) {
        if self.backend.replace(backend).is_some() {
            debug!(session = %self.id, "Replaced attached backend");
        }
        self.state = SessionState::Active;
    }

    /// Forget the current backend without closing it
    pub fn detach_backend(&mut self) -> Option<mpsc::UnboundedSender<Frame>> {
        self.backend.take()
    }

    /// Relay a client frame; dropped when no backend is attached
    pub fn forward(&mut self, frame: Frame) -> bool {
        let delivered = match self.backend {
            Some(ref backend) => backend.send(frame).is_ok(),
            None => false,
        };
        if delivered {
            self.forwarded += 1;
        } else {
            self.dropped += 1;
            trace!(session = %self.id, state = %self.state, "Dropped client frame");
        }
        delivered
    }

    /// Register an unexpected backend loss and decide whether to retry
    pub fn on_backend_lost(&mut self) -> ReconnectDecision {
        self.detach_backend();
        if self.reconnect_attempts < self.max_reconnects {
            self.reconnect_attempts += 1;
            self.state = SessionState::Reconnecting;
            ReconnectDecision::Retry {
                attempt: self.reconnect_attempts,
                delay: self.reconnect_delay * self.reconnect_attempts,
            }
        } else {
            self.state = SessionState::Closed;
            ReconnectDecision::Exhausted {
                attempts: self.reconnect_attempts,
            }
        }
    }

    /// The attached backend has stayed up long enough to trust again
    pub fn mark_stable(&mut self) {
        if self.reconnect_attempts > 0 {
            debug!(session = %self.id, attempts = self.reconnect_attempts, "Backend stable, resetting attempts");
            self.reconnect_attempts = 0;
        }
    }

    /// Close the current backend with `frame` and end the session
    pub fn close_backend(&mut self, frame: CloseFrame) {
        if let Some(backend) = self.detach_backend() {
            let _ = backend.send(Frame::Close(frame));
        }
        self.state = SessionState::Closed;
    }

    pub fn close(&mut self) {
        self.detach_backend();
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_drops_without_backend() {
        let mut session = ClientSession::new(3, Duration::from_secs(1));
        assert!(!session.forward(Frame::Text("early".to_string())));
        assert_eq!(session.dropped(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_backend(tx);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.forward(Frame::Text("hello".to_string())));
        assert_eq!(rx.try_recv().unwrap(), Frame::Text("hello".to_string()));
        assert_eq!(session.forwarded(), 1);
    }

    #[test]
    fn test_detach_stops_forwarding() {
        let mut session = ClientSession::new(3, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_backend(tx);
        session.detach_backend();

        assert!(!session.forward(Frame::Text("lost".to_string())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reconnect_backoff_and_bound() {
        let mut session = ClientSession::new(2, Duration::from_millis(500));

        assert_eq!(
            session.on_backend_lost(),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(
            session.on_backend_lost(),
            ReconnectDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            session.on_backend_lost(),
            ReconnectDecision::Exhausted { attempts: 2 }
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_stable_backend_resets_attempts() {
        let mut session = ClientSession::new(1, Duration::from_millis(10));
        session.on_backend_lost();
        session.mark_stable();
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(matches!(
            session.on_backend_lost(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_close_backend_sends_close() {
        let mut session = ClientSession::new(1, Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_backend(tx);

        session.close_backend(CloseFrame::new(1001, "going away"));

        assert_eq!(rx.try_recv().unwrap(), Frame::Close(CloseFrame::new(1001, "going away")));
        assert!(!session.has_backend());
        assert_eq!(session.state(), SessionState::Closed);
    }
}
