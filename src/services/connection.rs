//! Reference-counted channel subscriptions with reconnection and heartbeat.
//!
//! One underlying connection exists per logical topic no matter how many
//! consumers acquired it; the connection is opened on the first
//! [`ConnectionManager::acquire`] and closed when the last
//! [`ConnectionManager::release`] drops the reference count to zero.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::dto::channel::{
    ChannelEvent, EVENT_ERROR, EVENT_GET_LATEST, EVENT_PING, EVENT_PONG, Frame, event_suffix,
};
use crate::error::{TransportError, TransportResult};

/// Capacity of the per-topic event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Connection status surfaced to consumers.
pub enum ConnectionStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// The channel is open; push updates and heartbeats are flowing.
    Connected,
    /// The channel is down (between retries, or terminally).
    Disconnected,
}

/// One bidirectional link to the server for a single topic.
///
/// Implementations only need to move frames; reconnection, heartbeats, and
/// fan-out live in the manager.
pub trait ChannelLink: Send {
    /// Send one frame to the server.
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, TransportResult<()>>;
    /// Receive the next server frame; `None` or `Err` means the link dropped.
    fn recv(&mut self) -> BoxFuture<'_, Option<TransportResult<Frame>>>;
}

/// Abstraction over the network transport that opens channel links.
pub trait Transport: Send + Sync {
    /// Open a link for the given topic.
    fn connect(&self, topic: &str) -> BoxFuture<'static, TransportResult<Box<dyn ChannelLink>>>;
}

/// Handle to an acquired topic subscription.
///
/// Cheap to use from many tasks; dropping it does *not* release the
/// subscription — call [`ConnectionManager::release`] explicitly.
pub struct TopicHandle {
    topic: String,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Receiver<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl TopicHandle {
    /// Topic this handle refers to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribe to the topic's event fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Watch the topic's connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Queue an event (by suffix) for the server.
    pub fn send(&self, suffix: &str, data: Value) -> TransportResult<()> {
        self.outbound
            .send(Frame::new(&self.topic, suffix, data))
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the server for the full current snapshot.
    pub fn request_latest(&self) -> TransportResult<()> {
        self.send(EVENT_GET_LATEST, Value::Null)
    }
}

struct TopicEntry {
    refcount: usize,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Receiver<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
}

/// Owns every per-topic connection and its reference count.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: Arc<SyncConfig>,
    topics: DashMap<String, TopicEntry>,
}

impl ConnectionManager {
    /// Build a manager over the given transport.
    pub fn new(transport: Arc<dyn Transport>, config: Arc<SyncConfig>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            topics: DashMap::new(),
        })
    }

    /// Increment the topic's reference count, opening the underlying
    /// connection if this is the first reference.
    ///
    /// A topic whose supervisor exhausted its retry budget is reopened here,
    /// so a later consumer starts a fresh retry cycle instead of inheriting a
    /// dead channel.
    pub fn acquire(&self, topic: &str) -> TopicHandle {
        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| self.spawn_topic(topic));
        if entry.supervisor.is_finished() {
            info!(topic, "supervisor exited earlier; reopening channel");
            // Prior holders still release against this entry, so their
            // references carry over to the fresh supervisor.
            let holders = entry.refcount;
            *entry = self.spawn_topic(topic);
            entry.refcount = holders;
        }
        entry.refcount += 1;
        debug!(topic, refcount = entry.refcount, "topic acquired");
        TopicHandle {
            topic: topic.to_string(),
            events: entry.events.clone(),
            status: entry.status.clone(),
            outbound: entry.outbound.clone(),
        }
    }

    /// Decrement the topic's reference count, closing the underlying
    /// connection when it reaches zero.
    ///
    /// Decrement and removal happen under one entry lock, so an `acquire`
    /// racing the last release either lands before it (and keeps the channel
    /// open) or after it (and opens a fresh one).
    pub fn release(&self, topic: &str) {
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.refcount = entry.refcount.saturating_sub(1);
                debug!(topic, refcount = entry.refcount, "topic released");
                if entry.refcount == 0 {
                    info!(topic, "last reference released; closing channel");
                    let entry = occupied.remove();
                    let _ = entry.shutdown.send(true);
                }
            }
            Entry::Vacant(_) => {
                warn!(topic, "release for a topic that was never acquired");
            }
        }
    }

    fn spawn_topic(&self, topic: &str) -> TopicEntry {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = tokio::spawn(run_topic(
            self.transport.clone(),
            topic.to_string(),
            self.config.clone(),
            events.clone(),
            status_tx,
            outbound_rx,
            shutdown_rx,
        ));

        TopicEntry {
            refcount: 0,
            events,
            status: status_rx,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            supervisor,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Per-topic connection supervisor: bounded connect retries, heartbeat while
/// connected, fan-out of incoming frames, self-healing snapshot request after
/// every (re)connection.
async fn run_topic(
    transport: Arc<dyn Transport>,
    topic: String,
    config: Arc<SyncConfig>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ConnectionStatus>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    'retry: loop {
        if *shutdown.borrow() {
            break;
        }
        let _ = status.send(ConnectionStatus::Connecting);

        let mut link = tokio::select! {
            _ = shutdown.changed() => break 'retry,
            result = transport.connect(&topic) => match result {
                Ok(link) => link,
                Err(err) => {
                    attempts += 1;
                    let _ = status.send(ConnectionStatus::Disconnected);
                    if attempts >= config.max_connect_attempts {
                        warn!(topic = %topic, attempts, error = %err, "connection attempts exhausted");
                        let _ = events.send(ChannelEvent::ConnectionFailed {
                            message: err.to_string(),
                        });
                        break 'retry;
                    }
                    warn!(topic = %topic, attempt = attempts, error = %err, "connection attempt failed");
                    tokio::select! {
                        _ = shutdown.changed() => break 'retry,
                        _ = sleep(config.reconnect_delay) => {}
                    }
                    continue 'retry;
                }
            },
        };

        attempts = 0;
        info!(topic = %topic, "channel connected");
        let _ = status.send(ConnectionStatus::Connected);
        let _ = events.send(ChannelEvent::Connected);

        // Self-heal after (re)connects: request the full snapshot right away.
        if link
            .send(Frame::new(&topic, EVENT_GET_LATEST, Value::Null))
            .await
            .is_err()
        {
            warn!(topic = %topic, "channel dropped during snapshot request");
            let _ = status.send(ConnectionStatus::Disconnected);
            let _ = events.send(ChannelEvent::Disconnected);
            continue 'retry;
        }

        match run_session(
            &topic,
            link.as_mut(),
            &config,
            &events,
            &mut outbound,
            &mut shutdown,
        )
        .await
        {
            SessionEnd::Shutdown => break 'retry,
            SessionEnd::Dropped => {
                warn!(topic = %topic, "channel dropped; reconnecting");
                let _ = status.send(ConnectionStatus::Disconnected);
                let _ = events.send(ChannelEvent::Disconnected);
            }
        }
    }

    let _ = status.send(ConnectionStatus::Disconnected);
    debug!(topic = %topic, "topic supervisor stopped");
}

/// One connected session. The heartbeat interval lives on this stack frame,
/// so it stops the moment the session ends.
async fn run_session(
    topic: &str,
    link: &mut dyn ChannelLink,
    config: &SyncConfig,
    events: &broadcast::Sender<ChannelEvent>,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    enum Action {
        Shutdown,
        Outbound(Option<Frame>),
        Heartbeat,
        Incoming(Option<TransportResult<Frame>>),
    }

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        let action = tokio::select! {
            _ = shutdown.changed() => Action::Shutdown,
            frame = outbound.recv() => Action::Outbound(frame),
            _ = heartbeat.tick() => Action::Heartbeat,
            incoming = link.recv() => Action::Incoming(incoming),
        };

        match action {
            Action::Shutdown | Action::Outbound(None) => return SessionEnd::Shutdown,
            Action::Outbound(Some(frame)) => {
                if link.send(frame).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
            Action::Heartbeat => {
                if link
                    .send(Frame::new(topic, EVENT_PING, Value::Null))
                    .await
                    .is_err()
                {
                    return SessionEnd::Dropped;
                }
            }
            Action::Incoming(None) | Action::Incoming(Some(Err(_))) => {
                return SessionEnd::Dropped;
            }
            Action::Incoming(Some(Ok(frame))) => dispatch(topic, frame, events),
        }
    }
}

/// Route one incoming frame to the topic's subscribers.
fn dispatch(topic: &str, frame: Frame, events: &broadcast::Sender<ChannelEvent>) {
    match event_suffix(topic, &frame.event) {
        None => warn!(topic, event = %frame.event, "frame for foreign topic; dropped"),
        Some(EVENT_PONG) => debug!(topic, "heartbeat pong"),
        Some(EVENT_ERROR) => {
            let message = frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("malformed error payload")
                .to_string();
            warn!(topic, %message, "server error event");
            let _ = events.send(ChannelEvent::ServerError { message });
        }
        Some(suffix) => {
            let _ = events.send(ChannelEvent::Payload {
                event: suffix.to_string(),
                data: frame.data,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::dto::channel::{EVENT_FIELD_UPDATE, EVENT_LATEST};
    use crate::services::loopback;

    fn test_config() -> Arc<SyncConfig> {
        Arc::new(SyncConfig {
            max_connect_attempts: 3,
            reconnect_delay: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(30),
            ..SyncConfig::default()
        })
    }

    struct FailingTransport {
        connects: AtomicUsize,
    }

    impl Transport for FailingTransport {
        fn connect(
            &self,
            _topic: &str,
        ) -> BoxFuture<'static, TransportResult<Box<dyn ChannelLink>>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(TransportError::Closed) })
        }
    }

    #[tokio::test]
    async fn n_acquires_and_releases_open_and_close_exactly_once() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let handles: Vec<_> = (0..3).map(|_| manager.acquire("xsmb")).collect();
        let mut session = server.accept().await.expect("one connection");
        assert_eq!(session.topic(), "xsmb");

        // The connect-time snapshot request arrives exactly once.
        let frame = session.recv().await.expect("get-latest frame");
        assert_eq!(frame.event, "xsmb:get-latest");
        assert!(server.try_accept().is_none());

        // Releasing all but the last reference keeps the channel open.
        manager.release("xsmb");
        manager.release("xsmb");
        let mut events = handles[2].subscribe();
        assert!(session.push(EVENT_LATEST, json!({"entityKey": "hcm"})));
        match events.recv().await.unwrap() {
            ChannelEvent::Connected => match events.recv().await.unwrap() {
                ChannelEvent::Payload { event, .. } => assert_eq!(event, EVENT_LATEST),
                other => panic!("unexpected event: {other:?}"),
            },
            ChannelEvent::Payload { event, .. } => assert_eq!(event, EVENT_LATEST),
            other => panic!("unexpected event: {other:?}"),
        }

        // The last release closes the link; the server observes EOF.
        manager.release("xsmb");
        assert!(session.recv().await.is_none());
        assert!(server.try_accept().is_none());
    }

    #[tokio::test]
    async fn subscribers_fan_out_over_one_connection() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let a = manager.acquire("xsmb");
        let b = manager.acquire("xsmb");
        let mut events_a = a.subscribe();
        let mut events_b = b.subscribe();

        let mut session = server.accept().await.unwrap();
        session.recv().await.unwrap(); // get-latest

        assert!(session.push(EVENT_FIELD_UPDATE, json!({"entityKey": "hcm"})));

        let mut seen = 0;
        for events in [&mut events_a, &mut events_b] {
            loop {
                match events.recv().await.unwrap() {
                    ChannelEvent::Payload { event, .. } => {
                        assert_eq!(event, EVENT_FIELD_UPDATE);
                        seen += 1;
                        break;
                    }
                    ChannelEvent::Connected => continue,
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
        assert_eq!(seen, 2);
        assert!(server.try_accept().is_none());

        manager.release("xsmb");
        manager.release("xsmb");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries_end_in_terminal_error() {
        let transport = Arc::new(FailingTransport {
            connects: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(transport.clone(), test_config());

        let handle = manager.acquire("xsmb");
        let mut events = handle.subscribe();

        match events.recv().await.unwrap() {
            ChannelEvent::ConnectionFailed { .. } => {}
            other => panic!("expected terminal error, got {other:?}"),
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        assert_eq!(*handle.status().borrow(), ConnectionStatus::Disconnected);

        manager.release("xsmb");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_only_while_connected() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let _handle = manager.acquire("xsmb");
        let mut session = server.accept().await.unwrap();
        session.recv().await.unwrap(); // get-latest

        tokio::time::advance(Duration::from_secs(31)).await;
        let frame = session.recv().await.unwrap();
        assert_eq!(frame.event, "xsmb:ping");

        // Closing the channel stops the heartbeat with it.
        manager.release("xsmb");
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_recoverable() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let handle = manager.acquire("xsmb");
        let mut events = handle.subscribe();
        let mut session = server.accept().await.unwrap();
        session.recv().await.unwrap(); // get-latest

        assert!(session.push(EVENT_ERROR, json!({"message": "draw not started"})));
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::ServerError { message } => {
                    assert_eq!(message, "draw not started");
                    break;
                }
                ChannelEvent::Connected => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // Channel is still open afterwards.
        assert!(session.push(EVENT_LATEST, json!({"entityKey": "hcm"})));
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::Payload { event, .. } => {
                    assert_eq!(event, EVENT_LATEST);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        manager.release("xsmb");
    }

    struct FlakyTransport {
        inner: loopback::LoopbackTransport,
        attempts: AtomicUsize,
        failures: usize,
    }

    impl Transport for FlakyTransport {
        fn connect(
            &self,
            topic: &str,
        ) -> BoxFuture<'static, TransportResult<Box<dyn ChannelLink>>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Box::pin(async { Err(TransportError::Closed) });
            }
            self.inner.connect(topic)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_after_terminal_failure_reopens_the_channel() {
        let (inner, mut server) = loopback::pair();
        let transport = Arc::new(FlakyTransport {
            inner,
            attempts: AtomicUsize::new(0),
            failures: 3,
        });
        let manager = ConnectionManager::new(transport, test_config());

        let first = manager.acquire("xsmb");
        let mut events = first.subscribe();
        match events.recv().await.unwrap() {
            ChannelEvent::ConnectionFailed { .. } => {}
            other => panic!("expected terminal error, got {other:?}"),
        }
        // Let the exhausted supervisor run to completion before reacquiring.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = manager.acquire("xsmb");
        let mut session = server.accept().await.expect("fresh connection");
        let frame = session.recv().await.unwrap();
        assert_eq!(frame.event, "xsmb:get-latest");

        let mut events = second.subscribe();
        assert!(session.push(EVENT_LATEST, json!({"entityKey": "hcm"})));
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::Payload { event, .. } => {
                    assert_eq!(event, EVENT_LATEST);
                    break;
                }
                ChannelEvent::Connected => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // The pre-failure holder's reference carried over: both must release
        // before the channel closes.
        manager.release("xsmb");
        manager.release("xsmb");
        assert!(session.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_without_a_server_reports_unavailable() {
        let (transport, server) = loopback::pair();
        drop(server);
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let handle = manager.acquire("xsmb");
        let mut events = handle.subscribe();
        match events.recv().await.unwrap() {
            ChannelEvent::ConnectionFailed { message } => {
                assert!(message.contains("transport unavailable"), "{message}");
            }
            other => panic!("expected terminal error, got {other:?}"),
        }
        manager.release("xsmb");
    }

    #[tokio::test]
    async fn reacquire_after_full_release_opens_a_fresh_channel() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let _first = manager.acquire("xsmb");
        let mut session = server.accept().await.unwrap();
        session.recv().await.unwrap(); // get-latest
        manager.release("xsmb");
        assert!(session.recv().await.is_none());

        let second = manager.acquire("xsmb");
        let mut session = server.accept().await.expect("fresh connection");
        let frame = session.recv().await.unwrap();
        assert_eq!(frame.event, "xsmb:get-latest");

        let mut events = second.subscribe();
        assert!(session.push(EVENT_LATEST, json!({"entityKey": "hcm"})));
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::Payload { event, .. } => {
                    assert_eq!(event, EVENT_LATEST);
                    break;
                }
                ChannelEvent::Connected => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        manager.release("xsmb");
    }

    #[tokio::test]
    async fn reconnect_requests_snapshot_again() {
        let (transport, mut server) = loopback::pair();
        let manager = ConnectionManager::new(Arc::new(transport), test_config());

        let handle = manager.acquire("xsmb");
        let mut events = handle.subscribe();

        let mut first = server.accept().await.unwrap();
        let frame = first.recv().await.unwrap();
        assert_eq!(frame.event, "xsmb:get-latest");

        // Drop the server session; the manager reconnects and re-requests.
        drop(first);
        let mut second = server.accept().await.unwrap();
        let frame = second.recv().await.unwrap();
        assert_eq!(frame.event, "xsmb:get-latest");

        let mut saw_disconnect = false;
        let mut saw_reconnect = false;
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                ChannelEvent::Disconnected => saw_disconnect = true,
                ChannelEvent::Connected if saw_disconnect => {
                    saw_reconnect = true;
                    break;
                }
                ChannelEvent::Connected => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_disconnect && saw_reconnect);

        manager.release("xsmb");
    }
}
