// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport that reconnects after the link drops.

use super::Transport;
use crate::connector::Handshake;
use crate::error::ConnectionError;
use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_retries: Option<usize>) -> Self {
        Self { delay, max_retries }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_retries.unwrap_or(usize::MAX))
    }
}

type ClosedCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ClosedHook(Mutex<Option<ClosedCallback>>);

impl ClosedHook {
    fn fire(&self) {
        let callback = self.0.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Wraps a [`Transport`] and keeps it connected.
///
/// The `on_closed` callback runs once: when retries are exhausted or after
/// [`ReconnectingTransport::close`].
pub struct ReconnectingTransport {
    transport: Transport,
    policy: ReconnectPolicy,
    stop: watch::Sender<bool>,
    hook: Arc<ClosedHook>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingTransport {
    pub fn new(transport: Transport, policy: ReconnectPolicy) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            transport,
            policy,
            stop,
            hook: Arc::new(ClosedHook::default()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.hook.0.lock() = Some(Box::new(callback));
    }

    /// Connect (with retries) and start watching the link.
    pub async fn connect(&self) -> Result<Handshake, ConnectionError> {
        let mut stop = self.stop.subscribe();
        match connect_with_retry(&self.transport, &self.policy, &mut stop).await {
            Ok(hs) => {
                let task = tokio::spawn(supervise(
                    self.transport.clone(),
                    self.policy,
                    stop,
                    Arc::clone(&self.hook),
                ));
                if let Some(previous) = self.supervisor.lock().replace(task) {
                    previous.abort();
                }
                Ok(hs)
            }
            Err(e) => {
                self.hook.fire();
                Err(e)
            }
        }
    }

    /// Stop reconnecting and close the transport.
    pub async fn close(&self) {
        self.stop.send_replace(true);
        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            task.abort();
        }
        self.transport.close().await;
        self.hook.fire();
    }
}

impl Drop for ReconnectingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}

async fn supervise(
    transport: Transport,
    policy: ReconnectPolicy,
    mut stop: watch::Receiver<bool>,
    hook: Arc<ClosedHook>,
) {
    loop {
        tokio::select! {
            _ = transport.closed() => {}
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
        if *stop.borrow() {
            return;
        }

        warn!(peer = %transport.peer(), "Connection lost, reconnecting");
        match connect_with_retry(&transport, &policy, &mut stop).await {
            Ok(_) => info!(peer = %transport.peer(), "Reconnected"),
            Err(e) => {
                if !*stop.borrow() {
                    warn!(peer = %transport.peer(), error = %e, "Giving up reconnecting");
                    hook.fire();
                }
                return;
            }
        }
    }
}

async fn connect_with_retry(
    transport: &Transport,
    policy: &ReconnectPolicy,
    stop: &mut watch::Receiver<bool>,
) -> Result<Handshake, ConnectionError> {
    let attempt = (|| {
        let transport = transport.clone();
        async move { transport.connect().await }
    })
    .retry(policy.backoff())
    .notify(|err: &ConnectionError, delay: Duration| {
        warn!(error = %err, ?delay, "Connect failed, retrying");
    });

    tokio::select! {
        result = attempt => result,
        _ = stop.wait_for(|stopped| *stopped) => Err(ConnectionError::Closed),
    }
}
