// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for integration tests.

#![allow(dead_code)]

use ipcbus::{
    Broker, BrokerConfig, BrokerHandle, BusEvent, ConnectOptions, Endpoint, Peer, ProcessType,
    Transport, Value,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_broker() -> BrokerHandle {
    start_with(BrokerConfig::listening(ConnectOptions::tcp(0))).await
}

pub async fn start_with(config: BrokerConfig) -> BrokerHandle {
    Broker::new(config)
        .expect("valid config")
        .start()
        .await
        .expect("broker starts")
}

/// Connected socket transport for a fresh worker peer named `name`.
pub async fn worker(handle: &BrokerHandle, name: &str) -> Transport {
    let transport = Transport::new(
        Peer::new(ProcessType::Worker).with_name(name),
        Endpoint::Socket(handle.connect_options()),
    );
    transport.connect().await.expect("handshake");
    transport
}

/// Connected in-process transport.
pub async fn local_worker(handle: &BrokerHandle, name: &str) -> Transport {
    let transport = Transport::new(
        Peer::new(ProcessType::Worker).with_name(name),
        Endpoint::Local(handle.clone()),
    );
    transport.connect().await.expect("handshake");
    transport
}

/// Round-trip through the broker: every frame `transport` sent earlier
/// has been routed once this returns.
pub async fn sync(transport: &Transport) {
    transport
        .query_state(Some(WAIT))
        .await
        .expect("query-state round trip");
}

/// Poll `cond` until it holds.
pub async fn eventually<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Poll an async condition until it holds.
pub async fn eventually_async<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Records `(channel, first arg)` for every delivery.
#[derive(Clone, Default)]
pub struct Inbox {
    seen: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Inbox {
    pub fn listen(&self, transport: &Transport, channel: &str) {
        let seen = Arc::clone(&self.seen);
        transport.add_listener(channel, move |event: &BusEvent, args: &[Value]| {
            let first = args.first().cloned().unwrap_or_default();
            seen.lock().push((event.channel.clone(), first));
        });
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn on(&self, channel: &str) -> Vec<Value> {
        self.seen
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn has(&self, channel: &str) -> bool {
        self.seen.lock().iter().any(|(c, _)| c == channel)
    }
}
