// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide bus context.
//!
//! Created once at process start and passed to whatever needs a transport.
//! Every transport it creates shares one connector and is addressed as a
//! sub-endpoint of the process peer.

use crate::broker::BrokerHandle;
use crate::config::ConnectOptions;
use crate::connector::{ConnectorPool, Endpoint};
use crate::peer::{Peer, ProcessType};
use crate::transport::{ReconnectPolicy, ReconnectingTransport, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BusContext {
    process: Peer,
    pool: ConnectorPool,
    next_endpoint: Arc<AtomicU64>,
}

impl BusContext {
    /// Context reaching the broker over a socket.
    pub fn socket(process_type: ProcessType, options: ConnectOptions) -> Self {
        Self::with_pool(process_type, ConnectorPool::socket(options))
    }

    /// Context for a process that runs the broker itself.
    pub fn local(process_type: ProcessType, handle: BrokerHandle) -> Self {
        Self::with_pool(process_type, ConnectorPool::local(handle))
    }

    fn with_pool(process_type: ProcessType, pool: ConnectorPool) -> Self {
        Self {
            process: Peer::new(process_type),
            pool,
            next_endpoint: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name the process peer.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.process = self.process.with_name(name);
        self
    }

    /// Identity shared by every transport of this process.
    pub fn process(&self) -> &Peer {
        &self.process
    }

    pub fn pool(&self) -> &ConnectorPool {
        &self.pool
    }

    /// New transport on the shared connector, with its own sub-endpoint id.
    pub fn create_transport(&self) -> Transport {
        let n = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let peer = self.process.clone().with_sub_endpoint(n.to_string());
        Transport::new(peer, Endpoint::Shared(self.pool.clone()))
    }

    pub fn create_reconnecting(&self, policy: ReconnectPolicy) -> ReconnectingTransport {
        ReconnectingTransport::new(self.create_transport(), policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transports_get_distinct_keys() {
        let ctx = BusContext::socket(ProcessType::Worker, ConnectOptions::tcp(1)).with_name("w");
        let a = ctx.create_transport();
        let b = ctx.create_transport();
        assert_eq!(a.peer().id, ctx.process().id);
        assert_eq!(a.peer().id, b.peer().id);
        assert_ne!(a.peer().key(), b.peer().key());
        assert_eq!(b.peer().name.as_deref(), Some("w"));
    }
}
