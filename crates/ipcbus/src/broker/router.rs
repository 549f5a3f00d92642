// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing actor.
//!
//! One task owns the registry, the connection table and the bridge state.
//! Reader tasks feed it [`BrokerEvent`]s, so the registry mutation and the
//! fan-out of a frame happen as one step.
//!
//! # Routing
//!
//! | Frame | Delivered to |
//! |-------|--------------|
//! | `Send`/`Request` with target | target's connection, else host if `is_target`, else bridge, else dropped |
//! | `Send`/`Request` broadcast | each connection hosting a subscriber other than the sender, the bridge if interested, the host |
//! | `RequestResponse`/`QueryStateResponse` | target only |
//! | subscription commands | registry; net changes go to the bridge and the host |

use super::bridge::HostBridge;
use super::{BrokerEvent, BrokerStats, ConnId, ConnRole};
use crate::codec::Value;
use crate::config::{BrokerConfig, ConnectOptions};
use crate::logging::{LogEntry, LogSink, Roundtrip};
use crate::message::{Message, MessageKind, Payload};
use crate::peer::{Peer, PeerKey, ProcessType};
use crate::registry::{ChannelEvent, ChannelRegistry};
use crate::wire::{Outbound, OutboundTx};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Router-side view of one connection.
struct Conn {
    tx: OutboundTx,
    remote: String,
    role: ConnRole,
    peers: HashMap<PeerKey, Peer>,
    /// Remote channel interest, bridge connections only.
    interest: HashSet<String>,
}

impl Conn {
    fn send(&self, message: &Arc<Message>, payload: &Option<Payload>) -> bool {
        self.tx
            .send(Outbound::Frame(Arc::clone(message), payload.clone()))
            .is_ok()
    }
}

/// Where a frame entered the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Conn(ConnId),
    Host,
    /// Generated by the router.
    Local,
}

pub(crate) struct Router {
    config: Arc<BrokerConfig>,
    host: Arc<dyn HostBridge>,
    sink: Arc<dyn LogSink>,
    identity: Peer,
    registry: ChannelRegistry<ConnId>,
    conns: HashMap<ConnId, Conn>,
    peers: HashMap<PeerKey, ConnId>,
    bridge: Option<ConnId>,
    stats: BrokerStats,
}

impl Router {
    pub(crate) fn new(
        config: Arc<BrokerConfig>,
        host: Arc<dyn HostBridge>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let identity = Peer::new(ProcessType::Bridge).with_name(config.name.clone());
        Self {
            config,
            host,
            sink,
            identity,
            registry: ChannelRegistry::new(),
            conns: HashMap::new(),
            peers: HashMap::new(),
            bridge: None,
            stats: BrokerStats::default(),
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Attach {
                    conn,
                    tx,
                    remote,
                    role,
                } => self.attach(conn, tx, remote, role),
                BrokerEvent::Inbound {
                    conn,
                    message,
                    payload,
                } => {
                    if self.conns.contains_key(&conn) {
                        self.handle(Origin::Conn(conn), message, payload);
                    }
                }
                BrokerEvent::Detach { conn } => self.detach(conn),
                BrokerEvent::Inject { message, payload } => {
                    self.handle(Origin::Host, message, payload)
                }
                BrokerEvent::Stats { reply } => {
                    let _ = reply.send(self.snapshot_stats());
                }
                BrokerEvent::Shutdown => break,
            }
        }

        for conn in self.conns.values() {
            let _ = conn.tx.send(Outbound::Close);
        }
        info!("Router stopped ({} connections closed)", self.conns.len());
    }

    fn snapshot_stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.conns.len(),
            peers: self.peers.len(),
            channels: self.registry.channel_count(),
            bridged: self.bridge.is_some(),
            ..self.stats.clone()
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    fn attach(&mut self, conn: ConnId, tx: OutboundTx, remote: String, role: ConnRole) {
        debug!("Attached connection {} ({})", conn, remote);
        self.conns.insert(
            conn,
            Conn {
                tx,
                remote,
                role,
                peers: HashMap::new(),
                interest: HashSet::new(),
            },
        );

        if role == ConnRole::BridgeInitiator {
            if self.bridge.is_some() {
                warn!("Bridge already linked, dropping dialed connection {}", conn);
                self.close_conn(conn);
                return;
            }
            self.bridge = Some(conn);
            let handshake = Message::new(MessageKind::Handshake, "", self.identity.clone());
            let connect = self.bridge_connect_message();
            self.send_to(conn, handshake, None);
            self.send_to(conn, connect, None);
        }
    }

    fn detach(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        debug!("Detached connection {} ({})", conn_id, conn.remote);

        for (key, peer) in conn.peers {
            if self.peers.get(&key) == Some(&conn_id) {
                self.peers.remove(&key);
            }
            for event in self.registry.remove(&key) {
                self.propagate(event, &peer);
            }
        }

        if self.bridge == Some(conn_id) {
            self.bridge = None;
            info!("Bridge link {} closed", conn.remote);
            self.host.broadcast_close(&self.bridge_options());
        }
    }

    fn close_conn(&mut self, conn: ConnId) {
        if let Some(c) = self.conns.get(&conn) {
            let _ = c.tx.send(Outbound::Close);
        }
    }

    fn bridge_options(&self) -> ConnectOptions {
        self.config.bridge.clone().unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn handle(&mut self, origin: Origin, message: Arc<Message>, payload: Option<Payload>) {
        trace!(
            channel = %message.channel,
            kind = message.kind_name(),
            peer = %message.peer.id,
            "inbound"
        );

        match &message.kind {
            MessageKind::Send | MessageKind::Request(_) => {
                self.log_traffic(&message, payload.as_ref());
                match message.target.clone() {
                    Some(target) => {
                        self.route_targeted(origin, target, Arc::clone(&message), payload)
                    }
                    None => self.route_broadcast(origin, Arc::clone(&message), payload),
                }
            }
            MessageKind::RequestResponse(_) | MessageKind::QueryStateResponse { .. } => {
                self.log_traffic(&message, payload.as_ref());
                match message.target.clone() {
                    Some(target) => {
                        self.route_targeted(origin, target, Arc::clone(&message), payload)
                    }
                    None => {
                        debug!("Response without target on '{}'", message.channel);
                        self.stats.messages_dropped += 1;
                    }
                }
            }
            MessageKind::AddChannelListener
            | MessageKind::RemoveChannelListener
            | MessageKind::RemoveChannelAllListeners
            | MessageKind::RemoveListeners => self.handle_subscription(origin, &message),
            MessageKind::QueryState { session } => {
                self.handle_query_state(origin, &message, session.clone())
            }
            MessageKind::LogRoundtrip => self.handle_roundtrip(&message, payload.as_ref()),
            MessageKind::Handshake => {
                if let Origin::Conn(conn) = origin {
                    self.handle_handshake(conn, &message);
                }
            }
            MessageKind::PeerClose => {
                if let Origin::Conn(conn) = origin {
                    self.unregister_peer(conn, &message.peer.key());
                }
            }
            MessageKind::BridgeConnect { channels } => {
                if let Origin::Conn(conn) = origin {
                    self.handle_bridge_connect(conn, channels);
                }
            }
            MessageKind::BridgeClose => {
                if let Origin::Conn(conn) = origin {
                    if self.bridge == Some(conn) {
                        self.close_conn(conn);
                    }
                }
            }
            MessageKind::HandshakeAck { error, .. } => {
                if let Some(error) = error {
                    warn!("Upstream rejected bridge handshake: {}", error);
                }
            }
        }
    }

    fn is_bridge(&self, origin: Origin) -> bool {
        matches!(origin, Origin::Conn(c) if self.bridge == Some(c))
    }

    fn route_targeted(
        &mut self,
        origin: Origin,
        target: Peer,
        message: Arc<Message>,
        payload: Option<Payload>,
    ) {
        let bytes = payload.as_ref().map_or(0, Payload::wire_len) as u64;

        if let Some(conn) = self.peers.get(&target.key()).and_then(|c| self.conns.get(c)) {
            if conn.send(&message, &payload) {
                self.count_routed(bytes);
                return;
            }
        }

        if origin != Origin::Host && self.host.is_target(&message) {
            self.host.broadcast_data(&message, payload.as_ref());
            self.count_routed(bytes);
            return;
        }

        if !self.is_bridge(origin) {
            if let Some(bridge) = self.bridge.and_then(|b| self.conns.get(&b)) {
                if bridge.send(&message, &payload) {
                    self.count_routed(bytes);
                    return;
                }
            }
        }

        debug!(
            "No route for {} on '{}' to {}",
            message.kind_name(),
            message.channel,
            target.id
        );
        self.stats.messages_dropped += 1;
    }

    fn route_broadcast(&mut self, origin: Origin, message: Arc<Message>, payload: Option<Payload>) {
        let sender = message.peer.key();
        let recipients = self.registry.channel_conns(&message.channel, Some(&sender));

        let to_bridge = if self.is_bridge(origin) {
            None
        } else {
            self.bridge.filter(|b| {
                self.conns
                    .get(b)
                    .is_some_and(|c| c.interest.contains(&message.channel))
            })
        };

        let copies = recipients.len() + usize::from(to_bridge.is_some());
        let payload = match payload {
            Some(Payload::Args(args)) if copies > 1 => Some(Payload::encode_raw(&args)),
            other => other,
        };
        let bytes = payload.as_ref().map_or(0, Payload::wire_len) as u64;

        let mut delivered = 0u64;
        for conn in recipients.iter().chain(to_bridge.iter()) {
            if self.conns.get(conn).is_some_and(|c| c.send(&message, &payload)) {
                delivered += 1;
            }
        }

        if origin != Origin::Host {
            self.host.broadcast_data(&message, payload.as_ref());
        }

        if delivered == 0 {
            trace!("No remote subscribers on '{}'", message.channel);
            self.stats.messages_dropped += 1;
        } else {
            self.stats.messages_routed += 1;
            self.stats.bytes_routed += bytes * delivered;
        }
    }

    fn count_routed(&mut self, bytes: u64) {
        self.stats.messages_routed += 1;
        self.stats.bytes_routed += bytes;
    }

    fn send_to(&self, conn: ConnId, message: Message, payload: Option<Payload>) {
        if let Some(c) = self.conns.get(&conn) {
            c.send(&Arc::new(message), &payload);
        }
    }

    fn log_traffic(&self, message: &Message, payload: Option<&Payload>) {
        let level = self.config.log_level;
        if level.is_enabled() {
            self.sink
                .write_log(&LogEntry::for_level(level, message, payload));
        }
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    fn handle_handshake(&mut self, conn_id: ConnId, message: &Message) {
        let peer = message.peer.clone();

        // Brokers dialing in as a bridge are acknowledged but not counted.
        if peer.process_type == ProcessType::Bridge {
            self.send_to(conn_id, self.ack(&peer, None), None);
            return;
        }

        let key = peer.key();
        if !self.peers.contains_key(&key) && self.peers.len() >= self.config.max_peers {
            warn!("Max peers reached, rejecting {}", peer);
            self.send_to(
                conn_id,
                self.ack(&peer, Some("max peers reached".into())),
                None,
            );
            if self.conns.get(&conn_id).is_some_and(|c| c.peers.is_empty()) {
                self.close_conn(conn_id);
            }
            return;
        }

        if let Some(previous) = self.peers.insert(key.clone(), conn_id) {
            if previous != conn_id {
                warn!("Peer {} moved from connection {} to {}", key, previous, conn_id);
                if let Some(old) = self.conns.get_mut(&previous) {
                    old.peers.remove(&key);
                }
                for event in self.registry.remove(&key) {
                    self.propagate(event, &peer);
                }
            }
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.peers.insert(key, peer.clone());
        }
        info!("Registered peer {}", peer);
        self.send_to(conn_id, self.ack(&peer, None), None);
    }

    fn ack(&self, peer: &Peer, error: Option<String>) -> Message {
        Message::new(
            MessageKind::HandshakeAck {
                log_level: self.config.log_level,
                error,
            },
            "",
            self.identity.clone(),
        )
        .with_target(peer.clone())
    }

    fn unregister_peer(&mut self, conn_id: ConnId, key: &PeerKey) {
        let Some(peer) = self
            .conns
            .get_mut(&conn_id)
            .and_then(|c| c.peers.remove(key))
        else {
            return;
        };
        if self.peers.get(key) == Some(&conn_id) {
            self.peers.remove(key);
        }
        for event in self.registry.remove(key) {
            self.propagate(event, &peer);
        }
        debug!("Peer {} left connection {}", peer, conn_id);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    fn handle_subscription(&mut self, origin: Origin, message: &Message) {
        let channel = message.channel.as_str();

        match origin {
            Origin::Conn(conn) if self.bridge == Some(conn) => {
                if let Some(c) = self.conns.get_mut(&conn) {
                    match message.kind {
                        MessageKind::AddChannelListener => {
                            c.interest.insert(channel.to_string());
                        }
                        MessageKind::RemoveListeners => c.interest.clear(),
                        _ => {
                            c.interest.remove(channel);
                        }
                    }
                }
                // Remote interest is relayed to host-side listeners too.
                self.host.broadcast_command(message);
            }
            Origin::Conn(conn) => {
                let key = message.peer.key();
                let events: Vec<ChannelEvent> = match message.kind {
                    MessageKind::AddChannelListener => {
                        self.registry.add_ref(channel, &key, conn).into_iter().collect()
                    }
                    MessageKind::RemoveChannelListener => {
                        self.registry.release(channel, &key).into_iter().collect()
                    }
                    MessageKind::RemoveChannelAllListeners => {
                        self.registry.release_all(channel, &key).into_iter().collect()
                    }
                    _ => self.registry.remove(&key),
                };
                for event in events {
                    self.propagate(event, &message.peer);
                }
            }
            Origin::Host | Origin::Local => {
                // Host-side interest is ref-counted by the host itself.
                if let Some(b) = self.bridge {
                    self.send_to(b, message.clone(), None);
                }
            }
        }
    }

    /// Forward a net channel change to the bridge and the host.
    fn propagate(&mut self, event: ChannelEvent, peer: &Peer) {
        let (kind, channel) = match event {
            ChannelEvent::ChannelAdded(c) => (MessageKind::AddChannelListener, c),
            ChannelEvent::ChannelRemoved(c) => (MessageKind::RemoveChannelListener, c),
        };
        debug!("Channel {} '{}'", kind.name(), channel);

        if let Some(b) = self.bridge {
            let delta = Message::new(kind.clone(), channel.clone(), self.identity.clone());
            self.send_to(b, delta, None);
        }
        self.host
            .broadcast_command(&Message::new(kind, channel, peer.clone()));
    }

    // -----------------------------------------------------------------------
    // Bridge
    // -----------------------------------------------------------------------

    fn local_channels(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .registry
            .channels()
            .into_iter()
            .chain(self.host.channels())
            .collect();
        set.into_iter().collect()
    }

    fn bridge_connect_message(&self) -> Message {
        Message::new(
            MessageKind::BridgeConnect {
                channels: self.local_channels(),
            },
            "",
            self.identity.clone(),
        )
    }

    fn handle_bridge_connect(&mut self, conn_id: ConnId, channels: &[String]) {
        let initiated = self
            .conns
            .get(&conn_id)
            .is_some_and(|c| c.role == ConnRole::BridgeInitiator);

        if !initiated {
            let accepts = self.config.bridge.as_ref().is_some_and(|b| b.server);
            if !accepts || self.bridge.is_some_and(|b| b != conn_id) {
                warn!("Refusing bridge link on connection {}", conn_id);
                let refuse = Message::new(MessageKind::BridgeClose, "", self.identity.clone());
                self.send_to(conn_id, refuse, None);
                self.close_conn(conn_id);
                return;
            }
            self.bridge = Some(conn_id);
            let reply = self.bridge_connect_message();
            self.send_to(conn_id, reply, None);
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.interest = channels.iter().cloned().collect();
            info!(
                "Bridge linked with {} ({} remote channels)",
                conn.remote,
                conn.interest.len()
            );
        }
        self.host.broadcast_connect(&self.bridge_options());
    }

    // -----------------------------------------------------------------------
    // Query-state and log roundtrip
    // -----------------------------------------------------------------------

    fn handle_query_state(&mut self, origin: Origin, message: &Message, session: String) {
        let mut expect = 0i64;
        if !self.is_bridge(origin) && origin != Origin::Host {
            if let Some(b) = self.bridge {
                self.send_to(b, message.clone(), None);
                expect = 1;
            }
        }

        let channels = Value::from_serialize(&self.registry.snapshot())
            .unwrap_or(Value::Null)
            .get("channels")
            .cloned()
            .unwrap_or(Value::Null);
        let report = Value::object([
            ("broker", Value::from(self.config.name.as_str())),
            ("channels", channels),
            ("peers", Value::Int(self.peers.len() as i64)),
            ("host", self.host.query_state()),
            ("expect", Value::Int(expect)),
        ]);

        let response = Message::new(
            MessageKind::QueryStateResponse { session },
            message.channel.clone(),
            self.identity.clone(),
        )
        .with_target(message.peer.clone());

        self.route_targeted(
            Origin::Local,
            message.peer.clone(),
            Arc::new(response),
            Some(Payload::Args(vec![report])),
        );
    }

    fn handle_roundtrip(&self, message: &Message, payload: Option<&Payload>) {
        if !self.config.log_level.is_enabled() {
            return;
        }
        let record = payload
            .and_then(|p| p.to_args().ok())
            .and_then(|args| args.into_iter().next())
            .and_then(|v| v.deserialize_into::<Roundtrip>().ok());
        match record {
            Some(rt) => self
                .sink
                .write_log(&LogEntry::new(message).with_roundtrip(rt)),
            None => debug!("Malformed log roundtrip from {}", message.peer.id),
        }
    }
}
