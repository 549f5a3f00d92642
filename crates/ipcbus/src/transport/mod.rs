// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-facing API: send, request and listen over a connector.
//!
//! A [`Transport`] is one peer. It keeps its own listener table and request
//! correlator and takes a connector from its [`Endpoint`] on every
//! (re)connect. Listeners run synchronously on the connector's reader task.

mod event;
mod listener;
mod reconnect;

pub use event::{BusEvent, RequestResponder};
pub use listener::{Listener, ListenerId};
pub use reconnect::{ReconnectPolicy, ReconnectingTransport};

use crate::codec::Value;
use crate::config::timeout_from_ms;
use crate::connector::{Connector, ConnectorState, Endpoint, Handshake, InboundHandler};
use crate::correlator::{RequestCorrelator, Response};
use crate::error::{ConnectionError, RequestError};
use crate::logging::{LogLevel, Roundtrip};
use crate::message::{Message, MessageKind, Payload, RequestDescriptor, ResponseDescriptor};
use crate::peer::Peer;
use crate::query::{QueryCollector, QueryReport};
use chrono::{DateTime, Utc};
use listener::ListenerTable;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

pub(crate) struct TransportInner {
    peer: Peer,
    endpoint: Endpoint,
    connector: Mutex<Option<Connector>>,
    handshake: Mutex<Option<Handshake>>,
    listeners: Mutex<ListenerTable>,
    correlator: Arc<RequestCorrelator>,
    queries: QueryCollector,
    connected: watch::Sender<bool>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// One bus peer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.inner.peer)
            .field("connected", &self.is_connected())
            .field("listeners", &self.listener_count(None))
            .finish()
    }
}

impl Transport {
    pub fn new(peer: Peer, endpoint: Endpoint) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(TransportInner {
                peer,
                endpoint,
                connector: Mutex::new(None),
                handshake: Mutex::new(None),
                listeners: Mutex::new(ListenerTable::default()),
                correlator: RequestCorrelator::new(),
                queries: QueryCollector::default(),
                connected,
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Log level announced by the broker at handshake.
    pub fn log_level(&self) -> LogLevel {
        self.inner.log_level()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect and handshake; re-subscribes every registered listener.
    ///
    /// Returns the current handshake when already connected.
    pub async fn connect(&self) -> Result<Handshake, ConnectionError> {
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(hs) = self.inner.handshake.lock().clone() {
            if self.is_connected() {
                return Ok(hs);
            }
        }

        let connector = self.inner.endpoint.connector();
        let handler: Weak<dyn InboundHandler> = {
            let strong: Arc<dyn InboundHandler> = self.inner.clone();
            Arc::downgrade(&strong)
        };
        *self.inner.connector.lock() = Some(connector.clone());

        let result = connector
            .handshake(&self.inner.peer, handler, self.inner.endpoint.timeout())
            .await;
        let hs = match result {
            Ok(hs) if connector.is_connected() => hs,
            Ok(_) => {
                self.inner.detach_connector(&connector);
                return Err(ConnectionError::Closed);
            }
            Err(e) => {
                self.inner.detach_connector(&connector);
                return Err(e);
            }
        };

        *self.inner.handshake.lock() = Some(hs.clone());

        // Listener changes post their own commands once `connected` is set,
        // so the flag flips and the table is replayed under one lock.
        let resubscribed = {
            let listeners = self.inner.listeners.lock();
            self.inner.connected.send_replace(true);
            let channels = listeners.subscriptions();
            for channel in &channels {
                self.inner
                    .post(command(MessageKind::AddChannelListener, channel, &self.inner.peer));
            }
            channels.len()
        };
        info!(
            peer = %self.inner.peer,
            log_level = %hs.log_level,
            resubscribed,
            "Transport connected"
        );
        Ok(hs)
    }

    /// Leave the bus. Pending requests fail with [`RequestError::Closed`].
    pub async fn close(&self) {
        let connector = self.inner.connector.lock().take();
        if let Some(connector) = connector {
            connector
                .release(&self.inner.peer, self.inner.endpoint.timeout())
                .await;
        }
        self.inner.handle_closed();
    }

    /// Resolves once the transport is not connected.
    pub async fn closed(&self) {
        let mut connected = self.inner.connected.subscribe();
        let _ = connected.wait_for(|c| !*c).await;
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Publish on `channel`. `false` when not connected.
    pub fn send(&self, channel: &str, args: Vec<Value>) -> bool {
        let message = Message::new(MessageKind::Send, channel, self.inner.peer.clone());
        self.inner.post_with(message, Some(Payload::Args(args)))
    }

    /// Send to one peer, ignoring channel subscriptions.
    pub fn send_to(&self, target: &Peer, channel: &str, args: Vec<Value>) -> bool {
        let message = Message::new(MessageKind::Send, channel, self.inner.peer.clone())
            .with_target(target.clone());
        self.inner.post_with(message, Some(Payload::Args(args)))
    }

    /// Publish an already-encoded payload.
    pub fn post_message(&self, channel: &str, payload: Payload) -> bool {
        let message = Message::new(MessageKind::Send, channel, self.inner.peer.clone());
        self.inner.post_with(message, Some(payload))
    }

    /// Request on `channel`; the first responder wins.
    ///
    /// A negative `timeout_ms` waits indefinitely.
    pub async fn request(
        &self,
        channel: &str,
        timeout_ms: i64,
        args: Vec<Value>,
    ) -> Result<Response, RequestError> {
        self.issue(None, channel, timeout_ms, args).await
    }

    /// Request answered by `target` only.
    pub async fn request_to(
        &self,
        target: &Peer,
        channel: &str,
        timeout_ms: i64,
        args: Vec<Value>,
    ) -> Result<Response, RequestError> {
        self.issue(Some(target), channel, timeout_ms, args).await
    }

    async fn issue(
        &self,
        target: Option<&Peer>,
        channel: &str,
        timeout_ms: i64,
        args: Vec<Value>,
    ) -> Result<Response, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let pending = self.inner.correlator.register(channel);
        let descriptor = RequestDescriptor {
            id: pending.id().to_string(),
            reply_channel: channel.to_string(),
        };
        let mut message = Message::new(
            MessageKind::Request(descriptor),
            channel,
            self.inner.peer.clone(),
        );
        if let Some(target) = target {
            message = message.with_target(target.clone());
        }

        if !self.inner.post_with(message, Some(Payload::Args(args))) {
            return Err(RequestError::NotConnected);
        }
        pending.wait(timeout_from_ms(timeout_ms)).await
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener<L>(&self, channel: &str, listener: L) -> ListenerId
    where
        L: Listener + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        let id = listeners.add(channel, Arc::new(listener));
        if self.is_connected() {
            self.inner
                .post(command(MessageKind::AddChannelListener, channel, &self.inner.peer));
        }
        id
    }

    /// Returns `false` for an unknown id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        match listeners.remove(id) {
            Some(channel) => {
                if self.is_connected() {
                    self.inner.post(command(
                        MessageKind::RemoveChannelListener,
                        &channel,
                        &self.inner.peer,
                    ));
                }
                true
            }
            None => false,
        }
    }

    /// Remove listeners of `channel`, or of every channel. Returns how many.
    pub fn remove_all_listeners(&self, channel: Option<&str>) -> usize {
        let mut listeners = self.inner.listeners.lock();
        let (removed, message) = match channel {
            Some(channel) => (
                listeners.remove_channel(channel),
                command(MessageKind::RemoveChannelAllListeners, channel, &self.inner.peer),
            ),
            None => (
                listeners.clear(),
                command(MessageKind::RemoveListeners, "", &self.inner.peer),
            ),
        };
        if removed > 0 && self.is_connected() {
            self.inner.post(message);
        }
        removed
    }

    pub fn listener_count(&self, channel: Option<&str>) -> usize {
        self.inner.listeners.lock().count(channel)
    }

    /// Deliveries on `channel` as an async stream.
    ///
    /// Dropping the subscription removes its listener.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(channel, move |event: &BusEvent, args: &[Value]| {
            let _ = tx.send(Delivery {
                event: event.clone(),
                args: args.to_vec(),
            });
        });
        Subscription {
            id,
            rx,
            transport: Arc::downgrade(&self.inner),
        }
    }

    // -----------------------------------------------------------------------
    // Query-state
    // -----------------------------------------------------------------------

    /// Collect subscription state from the broker and everything bridged to it.
    ///
    /// At the deadline the report holds whatever arrived.
    pub async fn query_state(&self, timeout: Option<Duration>) -> Result<QueryReport, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let (session, rx) = self.inner.queries.begin();
        let query = Message::new(
            MessageKind::QueryState {
                session: session.clone(),
            },
            "",
            self.inner.peer.clone(),
        );
        if !self.inner.post(query) {
            self.inner.queries.cancel();
            return Err(RequestError::NotConnected);
        }

        match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(_)) => Err(RequestError::Closed),
                Err(_) => Ok(self.inner.queries.expire(&session)),
            },
            None => rx.await.map_err(|_| RequestError::Closed),
        }
    }
}

fn command(kind: MessageKind, channel: &str, peer: &Peer) -> Message {
    Message::new(kind, channel, peer.clone())
}

// ---------------------------------------------------------------------------
// Subscription stream
// ---------------------------------------------------------------------------

/// One message received through a [`Subscription`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: BusEvent,
    pub args: Vec<Value>,
}

/// Listener adapter yielding deliveries in arrival order.
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Delivery>,
    transport: Weak<TransportInner>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.transport.upgrade() {
            Transport { inner }.remove_listener(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound path
// ---------------------------------------------------------------------------

impl TransportInner {
    fn log_level(&self) -> LogLevel {
        self.handshake
            .lock()
            .as_ref()
            .map_or(LogLevel::Off, |hs| hs.log_level)
    }

    fn current(&self) -> Option<Connector> {
        self.connector.lock().clone()
    }

    fn post(&self, message: Message) -> bool {
        self.post_with(message, None)
    }

    fn post_with(&self, message: Message, payload: Option<Payload>) -> bool {
        match self.current() {
            Some(connector) => connector.post_message(message, payload),
            None => false,
        }
    }

    fn detach_connector(&self, connector: &Connector) {
        let mut current = self.connector.lock();
        if current.as_ref().is_some_and(|c| c.same_link(connector)) {
            *current = None;
        }
    }

    fn handle_closed(&self) {
        let failed = self.correlator.fail_all(RequestError::Closed);
        self.queries.cancel();
        self.handshake.lock().take();
        if self.connected.send_replace(false) {
            info!(peer = %self.peer, failed_requests = failed, "Transport disconnected");
        }
    }

    fn dispatch_data(&self, message: &Message, payload: Option<&Payload>) {
        let received_at = Utc::now();
        let listeners = self.listeners.lock().listeners(&message.channel);
        if listeners.is_empty() {
            trace!("No listener for '{}'", message.channel);
            return;
        }

        let args = match payload.map(Payload::to_args).transpose() {
            Ok(args) => args.unwrap_or_default(),
            Err(e) => {
                warn!(channel = %message.channel, "Dropping message with bad args: {}", e);
                return;
            }
        };

        let connector = self.current();
        let request = match (&message.kind, &connector) {
            (MessageKind::Request(descriptor), Some(connector)) => {
                Some(Arc::new(RequestResponder::new(
                    connector.clone(),
                    self.peer.clone(),
                    message.peer.clone(),
                    descriptor.clone(),
                )))
            }
            _ => None,
        };
        let event = BusEvent {
            channel: message.channel.clone(),
            sender: message.peer.clone(),
            request,
        };

        for listener in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event, &args)));
            if let Err(panic) = outcome {
                let reason = panic_reason(panic.as_ref());
                warn!(channel = %message.channel, "Listener panicked: {}", reason);
                if let Some(responder) = &event.request {
                    responder.reject(format!("listener panicked: {}", reason));
                }
            }
        }

        if let Some(connector) = connector {
            if self.log_level().is_enabled() {
                self.ack_roundtrip(&connector, message, received_at);
            }
        }
    }

    fn ack_roundtrip(&self, connector: &Connector, message: &Message, received_at: DateTime<Utc>) {
        let record = Roundtrip {
            kind: message.kind_name().to_string(),
            receiver: self.peer.id.clone(),
            received_at,
            dispatched_at: Utc::now(),
        };
        match Value::from_serialize(&record) {
            Ok(value) => {
                let ack = Message::new(
                    MessageKind::LogRoundtrip,
                    message.channel.clone(),
                    self.peer.clone(),
                );
                connector.post_message(ack, Some(Payload::Args(vec![value])));
            }
            Err(e) => debug!("Cannot encode log roundtrip: {}", e),
        }
    }

    fn settle_response(
        &self,
        message: &Message,
        descriptor: &ResponseDescriptor,
        payload: Option<&Payload>,
    ) {
        let outcome = if descriptor.resolve {
            Ok(Response {
                sender: message.peer.clone(),
                channel: message.channel.clone(),
                payload: payload.cloned(),
            })
        } else {
            Err(RequestError::Rejected {
                sender: message.peer.clone(),
                err: first_arg(payload),
            })
        };
        if !self.correlator.settle(&descriptor.id, outcome) {
            debug!("Dropping late response {}", descriptor.id);
        }
    }
}

impl InboundHandler for TransportInner {
    fn on_message(&self, message: &Message, payload: Option<&Payload>) {
        match &message.kind {
            MessageKind::Send | MessageKind::Request(_) => self.dispatch_data(message, payload),
            MessageKind::RequestResponse(descriptor) => {
                self.settle_response(message, descriptor, payload)
            }
            MessageKind::QueryStateResponse { session } => {
                if !self
                    .queries
                    .offer(session, message.peer.clone(), first_arg(payload))
                {
                    debug!("Ignoring query-state reply for stale session {}", session);
                }
            }
            _ => trace!("Ignoring {} on '{}'", message.kind_name(), message.channel),
        }
    }

    fn on_closed(&self) {
        {
            let mut current = self.connector.lock();
            if current
                .as_ref()
                .is_some_and(|c| c.state() == ConnectorState::Closed)
            {
                *current = None;
            }
        }
        self.handle_closed();
    }
}

fn first_arg(payload: Option<&Payload>) -> Value {
    payload
        .and_then(|p| p.to_args().ok())
        .and_then(|args| args.into_iter().next())
        .unwrap_or_default()
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
