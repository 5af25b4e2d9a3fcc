//! Text-frame transport abstraction.
//!
//! A [`Transport`] opens connections. Each open connection is represented by a
//! [`TransportHandle`], an owned resource that exposes the frames arriving from the
//! peer as [`TransportEvent`]s and accepts outgoing text frames via
//! [`TransportHandle::send_frame`]. Dropping or closing the handle tears the
//! connection down.
//!
//! Implementations bridge a concrete socket to a [`TransportPeer`], the other end of
//! the channel pair created by [`TransportHandle::pair`]. [`WebSocketTransport`] is the
//! default implementation backed by `tokio-tungstenite`.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::WsError;
use crate::Result;

/// Notification emitted by an open connection.
///
/// Implementations must emit [`TransportEvent::Closed`] exactly once when the
/// connection ends, including after an [`TransportEvent::Error`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived from the peer
    Message(String),
    /// The connection reported an error
    Error(String),
    /// The connection is gone
    Closed,
}

/// Opens connections to a URL.
///
/// `open` resolves once the connection is ready to carry frames. A failure before that
/// point is returned as an error.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<TransportHandle>;
}

/// Owned side of an open connection, held by the connection manager.
#[derive(Debug)]
pub struct TransportHandle {
    frames: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
}

impl TransportHandle {
    /// Create a connected handle/peer pair.
    #[must_use]
    pub fn pair() -> (Self, TransportPeer) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handle = Self {
            frames: frames_tx,
            events: events_rx,
            shutdown: shutdown.clone(),
        };
        let peer = TransportPeer {
            frames: frames_rx,
            events: events_tx,
            shutdown,
        };

        (handle, peer)
    }

    /// Queue a text frame for transmission.
    pub fn send_frame(&self, text: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(WsError::ConnectionClosed.into());
        }
        self.frames
            .send(text)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Wait for the next notification. Returns [`TransportEvent::Closed`] once the
    /// peer side has gone away.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events.recv().await.unwrap_or(TransportEvent::Closed)
    }

    /// Request the connection to close.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Implementation side of an open connection.
#[derive(Debug)]
pub struct TransportPeer {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl TransportPeer {
    /// Wait for the next outgoing frame. Returns `None` once the handle is dropped.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    /// Take the next outgoing frame if one is already queued.
    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    /// Stop accepting outgoing frames. Later [`TransportHandle::send_frame`] calls fail
    /// while notifications keep flowing.
    pub fn refuse_frames(&mut self) {
        self.frames.close();
    }

    /// Deliver a notification to the handle. Returns `false` if the handle is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Deliver an incoming text frame to the handle.
    pub fn push_message(&self, text: &str) -> bool {
        self.emit(TransportEvent::Message(text.to_owned()))
    }

    /// Report the connection as closed.
    pub fn close(&self) -> bool {
        self.emit(TransportEvent::Closed)
    }

    /// Whether the handle side asked for the connection to be closed.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the handle side asks for the connection to be closed.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }
}

#[cfg(feature = "ws")]
pub use websocket::WebSocketTransport;

#[cfg(feature = "ws")]
mod websocket {
    use async_trait::async_trait;
    use futures::{SinkExt as _, StreamExt as _};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
    use url::Url;

    use super::{Transport, TransportEvent, TransportHandle, TransportPeer};
    use crate::Result;

    type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// [`Transport`] over a `tokio-tungstenite` WebSocket.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketTransport;

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn open(&self, url: &Url) -> Result<TransportHandle> {
            let (ws_stream, _) = connect_async(url.as_str()).await?;
            let (handle, peer) = TransportHandle::pair();

            tokio::spawn(pump(ws_stream, peer));

            Ok(handle)
        }
    }

    /// Shuttle frames between the socket and the peer until either side goes away.
    async fn pump(ws_stream: WsStream, mut peer: TransportPeer) {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                () = peer.shutdown.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    break;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");
                            if !peer.emit(TransportEvent::Message(text.to_string())) {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            peer.emit(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; control frames are
                            // answered by tungstenite itself.
                        }
                    }
                }

                Some(text) = peer.frames.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        peer.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }

        peer.emit(TransportEvent::Closed);
    }
}
