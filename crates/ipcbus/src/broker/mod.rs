// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel broker.
//!
//! The broker accepts peer connections, keeps the channel registry and
//! routes frames between connections. It can link to one other broker
//! (the bridge) so that two process trees share channels, and it can hand
//! traffic to an embedding host runtime through [`HostBridge`].
//!
//! ```text
//!   socket readers ──┐
//!   local links ─────┼──► BrokerEvent ──► Router ──► per-connection writers
//!   host inject ─────┘
//! ```

mod bridge;
mod connection;
mod router;

pub use bridge::{HostBridge, NullHostBridge};

use crate::config::{BrokerConfig, ConnectOptions};
use crate::error::BusError;
use crate::logging::{LogSink, TracingLogSink};
use crate::message::{Message, Payload};
use crate::wire::{Outbound, OutboundRx, OutboundTx};
use connection::Listener;
use router::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

/// Broker-local connection identifier.
pub type ConnId = u64;

/// How a connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnRole {
    /// Accepted from the listening socket (or attached in-process).
    Client,
    /// Dialed by this broker toward its upstream bridge.
    BridgeInitiator,
}

/// Input of the routing task.
pub(crate) enum BrokerEvent {
    Attach {
        conn: ConnId,
        tx: OutboundTx,
        remote: String,
        role: ConnRole,
    },
    Inbound {
        conn: ConnId,
        message: Arc<Message>,
        payload: Option<Payload>,
    },
    Detach {
        conn: ConnId,
    },
    /// Frame published by the host runtime.
    Inject {
        message: Arc<Message>,
        payload: Option<Payload>,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
    Shutdown,
}

/// Routing counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    /// Data frames delivered to at least one connection.
    pub messages_routed: u64,
    /// Payload bytes written across all deliveries.
    pub bytes_routed: u64,
    /// Data frames with no recipient.
    pub messages_dropped: u64,
    pub connections: usize,
    pub peers: usize,
    pub channels: usize,
    /// Whether a bridge link is up.
    pub bridged: bool,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct HandleInner {
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_conn: AtomicU64,
    local_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Handle to a running broker. Cheap to clone.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("local_addr", &self.inner.local_addr)
            .field("unix_path", &self.inner.unix_path)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BrokerHandle {
    /// Bound TCP address, if listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Options a client uses to reach this broker.
    pub fn connect_options(&self) -> ConnectOptions {
        match (self.inner.local_addr, &self.inner.unix_path) {
            (Some(addr), _) => ConnectOptions::tcp(addr.port()).with_host(addr.ip().to_string()),
            (None, Some(path)) => ConnectOptions::unix(path.clone()),
            (None, None) => ConnectOptions::default(),
        }
    }

    /// Current routing counters.
    pub async fn stats(&self) -> Result<BrokerStats, BusError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .events
            .send(BrokerEvent::Stats { reply })
            .map_err(|_| BusError::NotRunning)?;
        rx.await.map_err(|_| BusError::NotRunning)
    }

    /// Route a frame that originates in the host runtime.
    ///
    /// It is never handed back to [`HostBridge::broadcast_data`].
    pub fn inject(&self, message: Message, payload: Option<Payload>) -> bool {
        self.inner
            .events
            .send(BrokerEvent::Inject {
                message: Arc::new(message),
                payload,
            })
            .is_ok()
    }

    /// Attach an in-process connection, bypassing sockets.
    pub fn attach_local(&self) -> Result<LocalLink, BusError> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }
        let conn = self.next_conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .events
            .send(BrokerEvent::Attach {
                conn,
                tx,
                remote: format!("local:{}", conn),
                role: ConnRole::Client,
            })
            .map_err(|_| BusError::NotRunning)?;
        Ok(LocalLink {
            conn,
            events: self.inner.events.clone(),
            rx,
        })
    }

    /// Stop accepting, close every connection and stop routing.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let _ = self.inner.events.send(BrokerEvent::Shutdown);
    }

    /// Resolves once the routing task has stopped.
    pub async fn closed(&self) {
        let mut done = self.inner.done.clone();
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.done.borrow() && !*self.inner.shutdown.borrow()
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.inner.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<BrokerEvent> {
        self.inner.events.clone()
    }
}

// ---------------------------------------------------------------------------
// In-process link
// ---------------------------------------------------------------------------

/// Connection to the broker without a socket.
///
/// Dropping the link detaches it like a closed socket.
pub struct LocalLink {
    conn: ConnId,
    events: mpsc::UnboundedSender<BrokerEvent>,
    rx: OutboundRx,
}

impl LocalLink {
    pub fn id(&self) -> ConnId {
        self.conn
    }

    /// Hand a frame to the router. `false` once the broker is gone.
    pub(crate) fn send(&self, message: Arc<Message>, payload: Option<Payload>) -> bool {
        self.events
            .send(BrokerEvent::Inbound {
                conn: self.conn,
                message,
                payload,
            })
            .is_ok()
    }

    /// Next frame from the router; `None` once detached.
    pub(crate) async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        let _ = self.events.send(BrokerEvent::Detach { conn: self.conn });
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Broker builder.
pub struct Broker {
    config: Arc<BrokerConfig>,
    host: Arc<dyn HostBridge>,
    sink: Arc<dyn LogSink>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            host: Arc::new(NullHostBridge),
            sink: Arc::new(TracingLogSink),
        })
    }

    pub fn with_host_bridge(mut self, host: Arc<dyn HostBridge>) -> Self {
        self.host = host;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bind the listening socket and start routing.
    pub async fn start(self) -> Result<BrokerHandle, BusError> {
        let listener = Listener::bind(&self.config.listen).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let handle = BrokerHandle {
            inner: Arc::new(HandleInner {
                events: events_tx,
                next_conn: AtomicU64::new(1),
                local_addr: listener.local_addr(),
                unix_path: listener.unix_path(),
                shutdown: shutdown_tx,
                done: done_rx,
            }),
        };

        let router = Router::new(
            Arc::clone(&self.config),
            Arc::clone(&self.host),
            Arc::clone(&self.sink),
        );
        tokio::spawn(async move {
            router.run(events_rx).await;
            done_tx.send_replace(true);
        });

        let max_message_size = self.config.max_message_size;
        tokio::spawn(connection::accept_loop(
            listener,
            handle.clone(),
            self.config.listen.buffer_mode(),
            max_message_size,
            shutdown_rx.clone(),
        ));

        if let Some(bridge) = self.config.bridge.as_ref().filter(|b| !b.server) {
            tokio::spawn(bridge::run_dialer(
                bridge.clone(),
                self.config.bridge_retry(),
                handle.clone(),
                max_message_size,
                shutdown_rx,
            ));
        }

        info!(
            "Broker '{}' listening on {}",
            self.config.name,
            self.config.listen.describe()
        );
        if let Some(addr) = handle.local_addr() {
            info!("Bound to {}", addr);
        }
        Ok(handle)
    }
}
