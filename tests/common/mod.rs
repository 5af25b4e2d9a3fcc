#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test crate uses a different subset of these helpers"
)]

use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use realtime_link::Result;
use realtime_link::realtime::{
    ChangeEvent, ClientOptions, ConnectionManager, ConnectionState, EventKind, Subscription,
};
use realtime_link::ws::WsError;
use realtime_link::ws::config::{Config, ReconnectConfig};
use realtime_link::ws::transport::{Transport, TransportHandle, TransportPeer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

pub const PROJECT_ID: &str = "proj1";

/// Long enough for paused-time tests to auto-advance through backoff and heartbeats.
pub const WAIT: Duration = Duration::from_secs(300);

/// What the mock transport does with the next `open` call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Accept,
    Refuse,
    /// Never resolves; the connect timeout has to fire
    Hang,
}

struct Inner {
    script: Mutex<VecDeque<Step>>,
    opens: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    peers: mpsc::UnboundedSender<TransportPeer>,
}

/// In-memory transport. Accepted connections are handed to the paired [`MockServer`].
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> (Self, MockServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                script: Mutex::new(VecDeque::new()),
                opens: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                peers: peers_tx,
            }),
        };
        (transport, MockServer { peers: peers_rx })
    }

    /// Queue outcomes for upcoming `open` calls. Once exhausted, opens are accepted.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.script.lock().unwrap().extend(steps);
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.inner.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<TransportHandle> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.urls.lock().unwrap().push(url.clone());

        let step = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Accept);

        match step {
            Step::Accept => {
                let (handle, peer) = TransportHandle::pair();
                self.inner.peers.send(peer).unwrap();
                Ok(handle)
            }
            Step::Refuse => Err(WsError::ConnectFailed("connection refused".to_owned()).into()),
            Step::Hang => pending().await,
        }
    }
}

/// Server side of the mock transport.
pub struct MockServer {
    peers: mpsc::UnboundedReceiver<TransportPeer>,
}

impl MockServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> MockConnection {
        let peer = timeout(WAIT, self.peers.recv())
            .await
            .expect("no connection was opened")
            .unwrap();
        MockConnection { peer }
    }

    /// Connection accepted without waiting, if any.
    pub fn try_accept(&mut self) -> Option<MockConnection> {
        self.peers.try_recv().ok().map(|peer| MockConnection { peer })
    }
}

/// One accepted connection as seen by the server.
pub struct MockConnection {
    peer: TransportPeer,
}

impl MockConnection {
    /// Next frame written by the client, decoded as JSON.
    pub async fn recv(&mut self) -> Value {
        let text = timeout(WAIT, self.peer.next_frame())
            .await
            .expect("no frame was written")
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    /// Every frame written so far.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(text) = self.peer.try_next_frame() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    /// Deliver a frame to the client.
    pub fn push(&self, frame: &Value) {
        self.peer.push_message(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.peer.push_message(text);
    }

    /// Make every later client write fail without closing the connection.
    pub fn refuse_frames(&mut self) {
        self.peer.refuse_frames();
    }

    /// Drop the connection from the server side.
    pub fn close(&self) {
        self.peer.close();
    }

    /// Whether the client closed this connection.
    pub fn is_closed_by_client(&self) -> bool {
        self.peer.is_shutdown()
    }

    pub async fn closed_by_client(&self) {
        timeout(WAIT, self.peer.shutdown_requested())
            .await
            .expect("client did not close the connection");
    }
}

pub fn options() -> ClientOptions {
    ClientOptions::builder()
        .base_url(Url::parse("wss://rt.example.com/ws").unwrap())
        .project_id(PROJECT_ID)
        .build()
}

/// Default policy without jitter, so backoff delays are exact.
pub fn config() -> Config {
    Config::default().with_reconnect(ReconnectConfig::default().with_jitter_factor(0.0))
}

pub fn manager(transport: &MockTransport, config: Config) -> ConnectionManager {
    ConnectionManager::with_transport(options(), config, transport.clone()).unwrap()
}

/// Connect and return the server side of the new connection.
pub async fn connected(manager: &ConnectionManager, server: &mut MockServer) -> MockConnection {
    manager.connect().await.unwrap();
    server.accept().await
}

pub async fn wait_for_state<F>(manager: &ConnectionManager, predicate: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut rx = manager.state_receiver();
    let state = timeout(WAIT, rx.wait_for(|state| predicate(state)))
        .await
        .expect("state was not reached")
        .unwrap();
    *state
}

/// Record every state change.
pub fn record_states(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    manager.on_status_change(move |state| sink.lock().unwrap().push(*state));
    states
}

/// Forward events of `kind` to a channel, tagged with `label`.
pub fn forward(
    subscription: &Subscription,
    kind: EventKind,
    label: &'static str,
    tx: &mpsc::UnboundedSender<(&'static str, ChangeEvent)>,
) {
    let tx = tx.clone();
    subscription.on(kind, move |event| {
        tx.send((label, event.clone())).unwrap();
    });
}

pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(&'static str, ChangeEvent)>,
) -> (&'static str, ChangeEvent) {
    timeout(WAIT, rx.recv())
        .await
        .expect("no event was delivered")
        .unwrap()
}

pub fn db_change(topic: &str, operation: &str, data: Value) -> Value {
    serde_json::json!({
        "type": "db_change",
        "topic": topic,
        "operation": operation,
        "data": data,
    })
}

pub fn frame_types(frames: &[Value]) -> Vec<&str> {
    frames
        .iter()
        .map(|frame| frame["type"].as_str().unwrap())
        .collect()
}
