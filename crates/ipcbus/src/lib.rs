// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inter-process message bus
//!
//! Peers publish and subscribe to named channels through a central broker,
//! send fire-and-forget messages and issue correlated request/response
//! calls. Brokers can link to one upstream broker so that two process
//! trees share their channels.
//!
//! # Features
//!
//! - **Pub/Sub**: ref-counted channel subscriptions with loopback suppression
//! - **Request/Response**: correlated replies with per-request timeouts
//! - **Directed delivery**: `send_to` / `request_to` bypass channel routing
//! - **Bridging**: subscription deltas mirrored to an upstream broker
//! - **Query-state**: aggregated subscription snapshot across brokers
//!
//! # Quick Start
//!
//! ```no_run
//! use ipcbus::{Broker, BrokerConfig, ConnectOptions, Endpoint, Peer, ProcessType, Transport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(BrokerConfig::listening(ConnectOptions::tcp(7410)))?
//!     .start()
//!     .await?;
//!
//! let transport = Transport::new(
//!     Peer::new(ProcessType::Worker),
//!     Endpoint::Socket(broker.connect_options()),
//! );
//! transport.connect().await?;
//! transport.add_listener("news", |event: &ipcbus::BusEvent, args: &[ipcbus::Value]| {
//!     println!("{} from {}: {:?}", event.channel, event.sender, args);
//! });
//! transport.send("news", vec!["hello".into()]);
//! # Ok(())
//! # }
//! ```
//!
//! # Wire Format
//!
//! Frames are self-describing encoded arrays `[message]` or
//! `[message, args]`, written back to back. See [`codec`].

pub mod broker;
pub mod codec;
pub mod config;
pub mod connector;
pub mod context;
pub mod correlator;
pub mod error;
pub mod logging;
pub mod message;
pub mod peer;
pub mod query;
pub mod registry;
pub mod transport;
mod wire;

pub use broker::{Broker, BrokerHandle, BrokerStats, HostBridge, LocalLink, NullHostBridge};
pub use codec::{Frame, FrameReader, Value};
pub use config::{BrokerConfig, ConfigError, ConnectOptions, SocketBuffer};
pub use connector::{Connector, ConnectorPool, ConnectorState, Endpoint, Handshake};
pub use context::BusContext;
pub use correlator::{RequestCorrelator, Response};
pub use error::{BusError, ConnectionError, ProtocolError, RequestError, Result};
pub use logging::{LogEntry, LogLevel, LogSink, TracingLogSink};
pub use message::{Message, MessageKind, Payload};
pub use peer::{Peer, PeerKey, ProcessType};
pub use query::{QueryReply, QueryReport};
pub use registry::{ChannelEvent, ChannelRegistry};
pub use transport::{
    BusEvent, Delivery, ListenerId, ReconnectPolicy, ReconnectingTransport, Subscription,
    Transport,
};
