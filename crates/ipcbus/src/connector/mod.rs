// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-side connection to a broker.
//!
//! A [`Connector`] owns one duplex link (socket or in-process) and its
//! framing. Peers attach with [`Connector::handshake`]; inbound frames are
//! dispatched to the attached [`InboundHandler`]s by peer key.
//!
//! Lifecycle: `Idle -> Connecting -> Connected -> ShuttingDown -> Closed`.
//! `Closed` is terminal; a closed connector is replaced, never reopened.

mod local;
mod pool;
mod socket;

pub use pool::ConnectorPool;

use crate::broker::BrokerHandle;
use crate::codec::{encoded_frame_len, DEFAULT_MAX_MESSAGE_SIZE};
use crate::config::ConnectOptions;
use crate::error::ConnectionError;
use crate::logging::LogLevel;
use crate::message::{Message, MessageKind, Payload};
use crate::peer::{Peer, PeerKey};
use crate::wire::{Outbound, OutboundTx};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Handshake deadline for in-process links.
const LOCAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
}

/// Receiver of inbound frames for one attached peer.
///
/// Called from the connector's reader task; implementations must not block.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, message: &Message, payload: Option<&Payload>);

    /// The link is gone. Called once.
    fn on_closed(&self);
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub peer: Peer,
    /// Traffic log level announced by the broker.
    pub log_level: LogLevel,
}

/// What a connector links to.
#[derive(Debug, Clone)]
pub(crate) enum LinkTarget {
    Socket(ConnectOptions),
    Local(BrokerHandle),
}

impl LinkTarget {
    fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Socket(options) => options.timeout(),
            Self::Local(_) => Some(LOCAL_HANDSHAKE_TIMEOUT),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Socket(options) => options.describe(),
            Self::Local(_) => "local".to_string(),
        }
    }
}

/// Where a transport gets its connector from.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Dedicated socket connection.
    Socket(ConnectOptions),
    /// In-process link to a broker running in this process.
    Local(BrokerHandle),
    /// Connection shared with other transports of this process.
    Shared(ConnectorPool),
}

impl Endpoint {
    /// Connector to use for the next connect attempt.
    pub fn connector(&self) -> Connector {
        match self {
            Self::Socket(options) => Connector::socket(options.clone()),
            Self::Local(handle) => Connector::local(handle.clone()),
            Self::Shared(pool) => pool.connector(),
        }
    }

    /// Handshake and close deadline.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Socket(options) => options.timeout(),
            Self::Local(_) => Some(LOCAL_HANDSHAKE_TIMEOUT),
            Self::Shared(pool) => pool.timeout(),
        }
    }
}

enum AckOutcome {
    Accepted(LogLevel),
    Rejected(String),
    Closed,
}

struct Attached {
    peer: Peer,
    handler: Weak<dyn InboundHandler>,
}

pub(crate) struct ConnectorInner {
    target: LinkTarget,
    max_message_size: usize,
    state: watch::Sender<ConnectorState>,
    handlers: Mutex<HashMap<PeerKey, Attached>>,
    acks: Mutex<HashMap<PeerKey, oneshot::Sender<AckOutcome>>>,
    outbound: Mutex<Option<OutboundTx>>,
    open_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Connection to a broker, shared by the peers attached to it.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("target", &self.inner.target.describe())
            .field("state", &self.state())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl Connector {
    pub fn socket(options: ConnectOptions) -> Self {
        Self::new(LinkTarget::Socket(options))
    }

    pub fn local(handle: BrokerHandle) -> Self {
        Self::new(LinkTarget::Local(handle))
    }

    pub(crate) fn new(target: LinkTarget) -> Self {
        let (state, _) = watch::channel(ConnectorState::Idle);
        Self {
            inner: Arc::new(ConnectorInner {
                target,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                state,
                handlers: Mutex::new(HashMap::new()),
                acks: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                open_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Whether two handles refer to the same connection.
    pub fn same_link(&self, other: &Connector) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach `peer`, opening the link first if needed.
    ///
    /// `timeout` covers both the dial and the broker's acknowledgment;
    /// `None` waits indefinitely.
    pub async fn handshake(
        &self,
        peer: &Peer,
        handler: Weak<dyn InboundHandler>,
        timeout: Option<Duration>,
    ) -> Result<Handshake, ConnectionError> {
        let key = peer.key();
        let attempt = self.attach(peer, &key, handler);
        let result = match timeout {
            Some(after) => tokio::time::timeout(after, attempt)
                .await
                .unwrap_or(Err(ConnectionError::Timeout(after))),
            None => attempt.await,
        };

        if let Err(e) = &result {
            debug!("Handshake of {} failed: {}", peer, e);
            self.inner.acks.lock().remove(&key);
            let empty = {
                let mut handlers = self.inner.handlers.lock();
                handlers.remove(&key);
                handlers.is_empty()
            };
            if empty && self.state() == ConnectorState::Connected {
                self.begin_shutdown();
            }
        }
        result
    }

    async fn attach(
        &self,
        peer: &Peer,
        key: &PeerKey,
        handler: Weak<dyn InboundHandler>,
    ) -> Result<Handshake, ConnectionError> {
        self.open().await?;

        let (tx, rx) = oneshot::channel();
        self.inner.acks.lock().insert(key.clone(), tx);
        self.inner.handlers.lock().insert(
            key.clone(),
            Attached {
                peer: peer.clone(),
                handler,
            },
        );

        let hello = Message::new(MessageKind::Handshake, "", peer.clone());
        if !self.post_message(hello, None) {
            return Err(ConnectionError::Closed);
        }

        match rx.await {
            Ok(AckOutcome::Accepted(log_level)) => Ok(Handshake {
                peer: peer.clone(),
                log_level,
            }),
            Ok(AckOutcome::Rejected(reason)) => Err(ConnectionError::Handshake(reason)),
            Ok(AckOutcome::Closed) | Err(_) => Err(ConnectionError::Closed),
        }
    }

    async fn open(&self) -> Result<(), ConnectionError> {
        let _guard = self.inner.open_lock.lock().await;
        match self.state() {
            ConnectorState::Connected => return Ok(()),
            ConnectorState::ShuttingDown | ConnectorState::Closed => {
                return Err(ConnectionError::Closed)
            }
            ConnectorState::Idle | ConnectorState::Connecting => {}
        }
        self.inner.state.send_replace(ConnectorState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = match &self.inner.target {
            LinkTarget::Socket(options) => {
                socket::spawn(Arc::clone(&self.inner), options, rx, self.inner.max_message_size)
                    .await
            }
            LinkTarget::Local(handle) => local::spawn(Arc::clone(&self.inner), handle, rx),
        };

        let tasks = match spawned {
            Ok(tasks) => tasks,
            Err(e) => {
                self.inner.mark_closed();
                return Err(e);
            }
        };
        *self.inner.outbound.lock() = Some(tx);
        self.inner.tasks.lock().extend(tasks);

        let connected = self.inner.state.send_if_modified(|state| {
            if *state == ConnectorState::Connecting {
                *state = ConnectorState::Connected;
                true
            } else {
                false
            }
        });
        if !connected {
            self.inner.abort_tasks();
            self.inner.mark_closed();
            return Err(ConnectionError::Closed);
        }
        debug!("Connector linked to {}", self.inner.target.describe());
        Ok(())
    }

    /// Queue a frame. `false` unless connected.
    ///
    /// Frames over the link's size limit are refused here; the broker would
    /// otherwise drop the whole link, sibling peers included.
    pub fn post_message(&self, message: Message, payload: Option<Payload>) -> bool {
        if self.state() != ConnectorState::Connected {
            return false;
        }
        let size = encoded_frame_len(&message, payload.as_ref());
        if size > self.inner.max_message_size {
            warn!(
                channel = %message.channel,
                size,
                max = self.inner.max_message_size,
                "Refusing oversized frame"
            );
            return false;
        }
        self.inner
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Outbound::Frame(Arc::new(message), payload)).is_ok())
    }

    /// Detach one peer; shuts the link down when it was the last one.
    pub async fn release(&self, peer: &Peer, timeout: Option<Duration>) {
        let key = peer.key();
        let last = {
            let mut handlers = self.inner.handlers.lock();
            handlers.remove(&key);
            handlers.is_empty()
        };
        if last {
            self.shutdown(timeout).await;
        } else {
            self.post_message(Message::new(MessageKind::PeerClose, "", peer.clone()), None);
        }
    }

    /// Close the link and wait for it to go down.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        match self.state() {
            ConnectorState::Closed => return,
            ConnectorState::Idle => {
                self.inner.mark_closed();
                return;
            }
            _ => {}
        }
        self.begin_shutdown();

        let closed = self.closed();
        match timeout {
            Some(after) => {
                if tokio::time::timeout(after, closed).await.is_err() {
                    warn!(
                        "Connector to {} did not close within {:?}",
                        self.inner.target.describe(),
                        after
                    );
                }
            }
            None => closed.await,
        }
        self.inner.abort_tasks();
        self.inner.mark_closed();
    }

    fn begin_shutdown(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectorState::Closed {
                false
            } else {
                *state = ConnectorState::ShuttingDown;
                true
            }
        });
        if let Some(tx) = self.inner.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }
    }

    /// Resolves once the connector is `Closed`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectorState::Closed).await;
    }
}

impl ConnectorInner {
    pub(crate) fn dispatch(&self, message: &Message, payload: Option<&Payload>) {
        if let MessageKind::HandshakeAck { log_level, error } = &message.kind {
            let Some(target) = &message.target else {
                return;
            };
            if let Some(tx) = self.acks.lock().remove(&target.key()) {
                let outcome = match error {
                    Some(reason) => AckOutcome::Rejected(reason.clone()),
                    None => AckOutcome::Accepted(*log_level),
                };
                let _ = tx.send(outcome);
            }
            return;
        }

        // Collected first so handlers may call back into the connector.
        let handlers: Vec<Arc<dyn InboundHandler>> = {
            let attached = self.handlers.lock();
            match &message.target {
                Some(target) => attached
                    .get(&target.key())
                    .and_then(|a| a.handler.upgrade())
                    .into_iter()
                    .collect(),
                None => {
                    let sender = message.peer.key();
                    attached
                        .iter()
                        .filter(|(key, _)| **key != sender)
                        .filter_map(|(_, a)| a.handler.upgrade())
                        .collect()
                }
            }
        };

        if handlers.is_empty() {
            trace!(
                "No handler for {} on '{}'",
                message.kind_name(),
                message.channel
            );
        }
        for handler in handlers {
            handler.on_message(message, payload);
        }
    }

    /// Transition to `Closed` and notify everyone. Idempotent.
    pub(crate) fn mark_closed(&self) {
        if self.state.send_replace(ConnectorState::Closed) == ConnectorState::Closed {
            return;
        }
        self.outbound.lock().take();

        let acks: Vec<_> = self.acks.lock().drain().collect();
        for (_, tx) in acks {
            let _ = tx.send(AckOutcome::Closed);
        }

        let attached: Vec<Attached> = self.handlers.lock().drain().map(|(_, a)| a).collect();
        debug!(
            "Connector to {} closed ({} peers attached)",
            self.target.describe(),
            attached.len()
        );
        for a in attached {
            if let Some(handler) = a.handler.upgrade() {
                trace!("Notifying {} of close", a.peer);
                handler.on_closed();
            }
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::codec::Value;
    use crate::config::BrokerConfig;
    use crate::peer::ProcessType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, Vec<Value>)>>,
        closed: AtomicUsize,
    }

    impl InboundHandler for Recorder {
        fn on_message(&self, message: &Message, payload: Option<&Payload>) {
            let args = payload.map(|p| p.to_args().unwrap()).unwrap_or_default();
            self.messages.lock().push((message.channel.clone(), args));
        }

        fn on_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn InboundHandler> {
        let handler: Arc<dyn InboundHandler> = recorder.clone();
        Arc::downgrade(&handler)
    }

    async fn broker() -> BrokerHandle {
        Broker::new(BrokerConfig::listening(ConnectOptions::tcp(0)))
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    fn worker(id: &str) -> Peer {
        Peer::new(ProcessType::Worker).with_id(id)
    }

    #[tokio::test]
    async fn test_handshake_over_socket_then_shutdown() {
        let handle = broker().await;
        let connector = Connector::socket(handle.connect_options());
        let recorder = Arc::new(Recorder::default());

        let hs = connector
            .handshake(&worker("a"), weak(&recorder), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(hs.peer.id, "a");
        assert_eq!(hs.log_level, LogLevel::Off);
        assert!(connector.is_connected());

        connector.shutdown(Some(Duration::from_secs(2))).await;
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert!(!connector.post_message(Message::new(MessageKind::Send, "x", worker("a")), None));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_refused_dial_closes_connector() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Connector::socket(ConnectOptions::tcp(port));
        let recorder = Arc::new(Recorder::default());
        let err = connector
            .handshake(&worker("a"), weak(&recorder), Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Refused(_) | ConnectionError::Io(_) | ConnectionError::Timeout(_)
        ));
        assert_eq!(connector.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_max_peers_rejects_handshake() {
        let mut config = BrokerConfig::listening(ConnectOptions::tcp(0));
        config.max_peers = 1;
        let handle = Broker::new(config).unwrap().start().await.unwrap();
        let connector = Connector::local(handle.clone());
        let recorder = Arc::new(Recorder::default());

        connector
            .handshake(&worker("a"), weak(&recorder), None)
            .await
            .unwrap();
        let err = connector
            .handshake(&worker("b"), weak(&recorder), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
        assert!(connector.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_targeted_dispatch_reaches_only_target() {
        let handle = broker().await;
        let connector = Connector::local(handle.clone());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        connector.handshake(&worker("a"), weak(&a), None).await.unwrap();
        connector.handshake(&worker("b"), weak(&b), None).await.unwrap();

        let direct = Message::new(MessageKind::Send, "direct", worker("a")).with_target(worker("b"));
        assert!(connector.post_message(direct, Some(Payload::Args(vec![Value::Int(1)]))));

        tokio::time::timeout(Duration::from_secs(2), async {
            while b.messages.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(a.messages.lock().is_empty());
        assert_eq!(b.messages.lock()[0], ("direct".to_string(), vec![Value::Int(1)]));

        connector.release(&worker("a"), None).await;
        assert!(connector.is_connected());
        connector.release(&worker("b"), Some(Duration::from_secs(2))).await;
        assert_eq!(connector.state(), ConnectorState::Closed);
        handle.shutdown();
    }
}
