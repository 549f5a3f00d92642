// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One connector shared by several transports of a process.

use super::{Connector, ConnectorState, LinkTarget};
use crate::broker::BrokerHandle;
use crate::config::ConnectOptions;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Hands out the live shared connector, replacing it once it has closed.
///
/// Every sharer writes through the connector's single writer task, so
/// frames from one transport keep their order.
#[derive(Debug, Clone)]
pub struct ConnectorPool {
    target: LinkTarget,
    current: Arc<Mutex<Option<Connector>>>,
}

impl ConnectorPool {
    pub fn socket(options: ConnectOptions) -> Self {
        Self::new(LinkTarget::Socket(options))
    }

    pub fn local(handle: BrokerHandle) -> Self {
        Self::new(LinkTarget::Local(handle))
    }

    fn new(target: LinkTarget) -> Self {
        Self {
            target,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connector(&self) -> Connector {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(c) if c.state() != ConnectorState::Closed => c.clone(),
            _ => {
                let fresh = Connector::new(self.target.clone());
                *current = Some(fresh.clone());
                fresh
            }
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.target.timeout()
    }

    /// Peers attached to the live connector.
    pub fn peer_count(&self) -> usize {
        self.current.lock().as_ref().map_or(0, Connector::peer_count)
    }
}
