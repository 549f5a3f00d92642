// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-runtime bridge seam and the upstream bridge dialer.

use super::connection::spawn_connection;
use super::{BrokerHandle, ConnRole};
use crate::codec::Value;
use crate::config::ConnectOptions;
use crate::error::ConnectionError;
use crate::message::{Message, Payload};
use crate::wire;
use backon::{BackoffBuilder, ConstantBuilder};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Bridge between the broker and an embedding host runtime's own
/// cross-process messaging.
///
/// The broker calls these from its routing task; implementations must not
/// block. Traffic coming from the host enters through
/// [`BrokerHandle::inject`].
pub trait HostBridge: Send + Sync {
    /// A bridge link came up.
    fn broadcast_connect(&self, options: &ConnectOptions);

    /// A bridge link went down.
    fn broadcast_close(&self, options: &ConnectOptions);

    /// Subscription delta (`AddChannelListener` / `RemoveChannelListener`).
    fn broadcast_command(&self, message: &Message);

    /// Data frame for host-side listeners.
    fn broadcast_data(&self, message: &Message, payload: Option<&Payload>);

    /// Whether the message's target lives in the host runtime.
    fn is_target(&self, message: &Message) -> bool;

    /// Channels host-side listeners are subscribed to.
    fn channels(&self) -> Vec<String>;

    /// Host-side contribution to a query-state report.
    fn query_state(&self) -> Value;
}

// ---------------------------------------------------------------------------
// Null bridge (no host runtime)
// ---------------------------------------------------------------------------

/// Host bridge that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHostBridge;

impl HostBridge for NullHostBridge {
    fn broadcast_connect(&self, _options: &ConnectOptions) {}

    fn broadcast_close(&self, _options: &ConnectOptions) {}

    fn broadcast_command(&self, _message: &Message) {}

    fn broadcast_data(&self, _message: &Message, _payload: Option<&Payload>) {}

    fn is_target(&self, _message: &Message) -> bool {
        false
    }

    fn channels(&self) -> Vec<String> {
        Vec::new()
    }

    fn query_state(&self) -> Value {
        Value::Undefined
    }
}

// ---------------------------------------------------------------------------
// Upstream dialer
// ---------------------------------------------------------------------------

/// Keep a bridge link to `options` open until shutdown.
///
/// Dials with a constant backoff, hands the socket to the router as a
/// bridge connection, and redials after it drops.
pub(crate) async fn run_dialer(
    options: ConnectOptions,
    retry: Duration,
    handle: BrokerHandle,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff = ConstantBuilder::default()
        .with_delay(retry)
        .with_max_times(usize::MAX);
    let target = options.describe();

    while !*shutdown.borrow() {
        let mut delays = backoff.build();
        let dialed = loop {
            let attempt = tokio::select! {
                result = wire::dial(&options) => result,
                _ = shutdown.changed() => return,
            };
            match attempt {
                Ok(halves) => break Some(halves),
                Err(ConnectionError::Timeout(after)) => {
                    warn!(bridge = %target, ?after, "Bridge dial timed out");
                }
                Err(e) => warn!(bridge = %target, error = %e, "Bridge dial failed"),
            }
            match delays.next() {
                Some(delay) => tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                },
                None => break None,
            }
        };

        let Some((reader, writer)) = dialed else {
            warn!(bridge = %target, "Giving up on bridge link");
            return;
        };

        info!(bridge = %target, "Bridge link connected");
        let link = spawn_connection(
            &handle,
            reader,
            writer,
            target.clone(),
            ConnRole::BridgeInitiator,
            options.buffer_mode(),
            max_message_size,
        );

        tokio::select! {
            _ = link => warn!(bridge = %target, "Bridge link lost, redialing"),
            _ = shutdown.changed() => return,
        }
        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = shutdown.changed() => return,
        }
    }
}
