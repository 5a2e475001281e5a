//! In-process transport pair, used by tests and the demo binary.
//!
//! The client half satisfies the [`Transport`] contract over a pair of
//! unbounded channels; the server half hands out one [`LoopbackSession`] per
//! accepted connection. Dropping a session drops the client link, which the
//! connection manager observes as a disconnect.

use std::io;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::dto::channel::Frame;
use crate::error::{TransportError, TransportResult};
use crate::services::connection::{ChannelLink, Transport};

/// Create a connected transport/server pair.
pub fn pair() -> (LoopbackTransport, LoopbackServer) {
    let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            sessions: sessions_tx,
        },
        LoopbackServer {
            sessions: sessions_rx,
        },
    )
}

/// Client half: hands a fresh channel link to every `connect` call.
pub struct LoopbackTransport {
    sessions: mpsc::UnboundedSender<LoopbackSession>,
}

impl Transport for LoopbackTransport {
    fn connect(&self, topic: &str) -> BoxFuture<'static, TransportResult<Box<dyn ChannelLink>>> {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let session = LoopbackSession {
            topic: topic.to_string(),
            to_client,
            from_client,
        };
        let accepted = self.sessions.send(session).is_ok();
        Box::pin(async move {
            if accepted {
                Ok(Box::new(LoopbackLink {
                    tx: to_server,
                    rx: from_server,
                }) as Box<dyn ChannelLink>)
            } else {
                Err(TransportError::unavailable(
                    "server half dropped".to_string(),
                    io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"),
                ))
            }
        })
    }
}

/// Server half: yields one session per accepted connection.
pub struct LoopbackServer {
    sessions: mpsc::UnboundedReceiver<LoopbackSession>,
}

impl LoopbackServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackSession> {
        self.sessions.recv().await
    }

    /// Non-blocking accept, for asserting that no extra connection was opened.
    pub fn try_accept(&mut self) -> Option<LoopbackSession> {
        self.sessions.try_recv().ok()
    }
}

/// Server side of one accepted connection.
pub struct LoopbackSession {
    topic: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackSession {
    /// Topic the client subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Push an event (by suffix) to the client; `false` once the link is gone.
    pub fn push(&self, suffix: &str, data: Value) -> bool {
        self.to_client
            .send(Frame::new(&self.topic, suffix, data))
            .is_ok()
    }

    /// Receive the next client frame; `None` once the client link is dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }
}

struct LoopbackLink {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl ChannelLink for LoopbackLink {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, TransportResult<()>> {
        let result = self.tx.send(frame).map_err(|_| TransportError::Closed);
        Box::pin(async move { result })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<TransportResult<Frame>>> {
        Box::pin(async move { self.rx.recv().await.map(Ok) })
    }
}
