//! Reconnecting proxy sessions driven over in-memory links
//!
//! A scripted connector stands in for the supervisor + backend socket. Time is
//! paused so reconnect delays and status intervals elapse instantly.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::error::{Result, TetherError};
use tether::proxy::{
    BackendConnector, CloseFrame, ErrorTranslator, Frame, Link, ProxySettings, ReconnectingProxy,
    SessionOutcome, SessionReport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Step {
    Accept,
    Refuse,
    AcceptAfter(Duration),
}

struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    peers: mpsc::UnboundedSender<Link>,
}

impl ScriptedConnector {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Link> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
        match step {
            Step::Refuse => Err(TetherError::PortTimeout {
                port: 18789,
                timeout: Duration::from_secs(1),
            }),
            Step::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.accept()
            }
            Step::Accept => self.accept(),
        }
    }
}

impl ScriptedConnector {
    fn accept(&self) -> Result<Link> {
        let (proxy_end, backend_end) = Link::pair();
        self.peers
            .send(backend_end)
            .map_err(|_| TetherError::Backend("test dropped peers".to_string()))?;
        Ok(proxy_end)
    }
}

struct Harness {
    client: Link,
    peers: mpsc::UnboundedReceiver<Link>,
    connector: Arc<ScriptedConnector>,
    session: JoinHandle<SessionReport>,
}

fn settings(max_reconnects: u32) -> ProxySettings {
    ProxySettings {
        max_reconnects,
        reconnect_delay: Duration::from_secs(1),
        status_interval: Duration::from_secs(3),
        stable_after: Duration::from_secs(60),
    }
}

fn start(settings: ProxySettings, steps: Vec<Step>) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = Arc::new(ScriptedConnector {
        steps: Mutex::new(steps.into()),
        calls: AtomicU32::new(0),
        peers: peers_tx,
    });
    let proxy = ReconnectingProxy::new(
        connector.clone(),
        Arc::new(ErrorTranslator::default()),
        settings,
    );

    let (proxy_end, client) = Link::pair();
    let session = tokio::spawn(async move { proxy.run(proxy_end).await });

    Harness {
        client,
        peers,
        connector,
        session,
    }
}

fn is_status(frame: &Frame) -> bool {
    matches!(frame, Frame::Text(t) if t.contains(r#""type":"status""#))
}

/// Next frame the client sees that is not a status notice
async fn next_payload(client: &mut Link) -> Option<Frame> {
    while let Some(frame) = client.rx.recv().await {
        if !is_status(&frame) {
            return Some(frame);
        }
    }
    None
}

#[tokio::test(start_paused = true)]
async fn test_clean_backend_close_is_passed_through() {
    let mut h = start(settings(5), vec![Step::Accept]);

    let peer = h.peers.recv().await.unwrap();
    peer.tx.send(Frame::Close(CloseFrame::new(1000, "bye"))).unwrap();

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::BackendClosed(1000));
    assert_eq!(h.connector.calls(), 1);
    assert_eq!(
        next_payload(&mut h.client).await,
        Some(Frame::Close(CloseFrame::new(1000, "bye")))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_is_bounded() {
    let max = 3;
    let mut h = start(settings(max), (0..10).map(|_| Step::Accept).collect());

    // Every backend dies right after attaching, alternating drop and error close
    let mut peers = h.peers;
    tokio::spawn(async move {
        let mut n = 0;
        while let Some(peer) = peers.recv().await {
            if n % 2 == 0 {
                drop(peer);
            } else {
                let _ = peer.tx.send(Frame::Close(CloseFrame::new(1011, "crashed")));
            }
            n += 1;
        }
    });

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::ReconnectExhausted);
    assert_eq!(report.connects, max + 1);
    assert_eq!(h.connector.calls(), max + 1);

    match next_payload(&mut h.client).await {
        Some(Frame::Close(frame)) => {
            assert_eq!(frame.code, 1011);
            assert!(frame.reason.contains("Refresh"));
        }
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnects_count_toward_bound() {
    let mut h = start(
        settings(2),
        vec![Step::Accept, Step::Refuse, Step::Refuse, Step::Accept],
    );

    drop(h.peers.recv().await.unwrap());

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::ReconnectExhausted);
    assert_eq!(h.connector.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_notifies_client() {
    let mut h = start(settings(2), vec![Step::Accept, Step::Accept]);

    drop(h.peers.recv().await.unwrap());
    let second = h.peers.recv().await.unwrap();
    second
        .tx
        .send(Frame::Close(CloseFrame::new(1001, "shutting down")))
        .unwrap();

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::BackendClosed(1001));

    let mut saw_reconnecting = false;
    while let Some(frame) = h.client.rx.recv().await {
        if let Frame::Text(text) = frame {
            if text.contains(r#""state":"reconnecting""#) {
                assert!(text.contains(r#""attempt":1"#));
                saw_reconnecting = true;
            }
        }
    }
    assert!(saw_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_notice_not_repeated_immediately() {
    let mut h = start(
        settings(2),
        vec![Step::Accept, Step::AcceptAfter(Duration::from_secs(4))],
    );

    drop(h.peers.recv().await.unwrap());
    let second = h.peers.recv().await.unwrap();
    second.tx.send(Frame::Close(CloseFrame::new(1000, ""))).unwrap();
    h.session.await.unwrap();

    let mut reconnecting = 0;
    while let Some(frame) = h.client.rx.recv().await {
        if let Frame::Text(text) = frame {
            if text.contains(r#""state":"reconnecting""#) {
                reconnecting += 1;
            }
        }
    }
    // Once on loss, once more 3s into the 4s connect
    assert_eq!(reconnecting, 2);
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_closes_with_hint() {
    let mut h = start(settings(5), vec![Step::Refuse]);

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::ConnectFailed);
    assert_eq!(h.connector.calls(), 1);

    match next_payload(&mut h.client).await {
        Some(Frame::Close(frame)) => {
            assert_eq!(frame.code, 1011);
            assert!(frame.reason.contains("taking too long"));
        }
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_notices_while_starting() {
    let mut h = start(
        settings(5),
        vec![Step::AcceptAfter(Duration::from_secs(7))],
    );

    let peer = h.peers.recv().await.unwrap();
    peer.tx.send(Frame::Close(CloseFrame::new(1000, ""))).unwrap();
    h.session.await.unwrap();

    let mut starting = 0;
    while let Some(frame) = h.client.rx.recv().await {
        if let Frame::Text(text) = frame {
            if text.contains(r#""state":"starting""#) {
                starting += 1;
            }
        }
    }
    // Sent at 0s, 3s and 6s
    assert_eq!(starting, 3);
}

#[tokio::test(start_paused = true)]
async fn test_frames_relayed_and_errors_translated() {
    let mut h = start(settings(5), vec![Step::Accept]);
    let mut peer = h.peers.recv().await.unwrap();

    h.client.tx.send(Frame::Text("ping".to_string())).unwrap();
    h.client.tx.send(Frame::Binary(vec![1, 2, 3])).unwrap();
    assert_eq!(peer.rx.recv().await, Some(Frame::Text("ping".to_string())));
    assert_eq!(peer.rx.recv().await, Some(Frame::Binary(vec![1, 2, 3])));

    let event = r#"{"type":"event","seq":1}"#;
    peer.tx.send(Frame::Text(event.to_string())).unwrap();
    peer.tx
        .send(Frame::Text(
            r#"{"type":"res","error":{"code":"token_mismatch","message":"unauthorized"}}"#.to_string(),
        ))
        .unwrap();

    assert_eq!(
        next_payload(&mut h.client).await,
        Some(Frame::Text(event.to_string()))
    );
    match next_payload(&mut h.client).await {
        Some(Frame::Text(text)) => {
            assert!(text.contains("Reload the page"));
            assert!(!text.contains("unauthorized"));
        }
        other => panic!("expected text, got {:?}", other),
    }

    peer.tx.send(Frame::Close(CloseFrame::new(1000, ""))).unwrap();
    let report = h.session.await.unwrap();
    assert_eq!(report.forwarded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_close_closes_backend() {
    let h = start(settings(5), vec![Step::Accept, Step::Accept]);
    let mut peers = h.peers;
    let mut peer = peers.recv().await.unwrap();

    h.client
        .tx
        .send(Frame::Close(CloseFrame::new(1001, "tab closed")))
        .unwrap();

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::ClientClosed);
    assert_eq!(
        peer.rx.recv().await,
        Some(Frame::Close(CloseFrame::new(1001, "tab closed")))
    );
    assert_eq!(h.connector.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_uses_sendable_code() {
    let h = start(settings(5), vec![Step::Accept]);
    let mut peers = h.peers;
    let mut peer = peers.recv().await.unwrap();

    drop(h.client);

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::ClientClosed);
    match peer.rx.recv().await {
        Some(Frame::Close(frame)) => assert_eq!(frame.code, 1000),
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stable_backend_resets_attempts() {
    let mut h = start(
        settings(1),
        vec![Step::Accept, Step::Accept, Step::Accept],
    );

    drop(h.peers.recv().await.unwrap());
    let second = h.peers.recv().await.unwrap();

    // Outlive stable_after before failing again
    tokio::time::sleep(Duration::from_secs(61)).await;
    drop(second);

    let third = h.peers.recv().await.unwrap();
    third
        .tx
        .send(Frame::Close(CloseFrame::new(1000, "done")))
        .unwrap();

    let report = h.session.await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::BackendClosed(1000));
    assert_eq!(report.connects, 3);
}
