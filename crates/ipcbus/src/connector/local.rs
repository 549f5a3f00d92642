// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process link to a broker in the same process.

use super::ConnectorInner;
use crate::broker::BrokerHandle;
use crate::error::ConnectionError;
use crate::wire::{Outbound, OutboundRx};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

pub(super) fn spawn(
    inner: Arc<ConnectorInner>,
    handle: &BrokerHandle,
    mut rx: OutboundRx,
) -> Result<Vec<AbortHandle>, ConnectionError> {
    let mut link = handle
        .attach_local()
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(message, payload)) => {
                        if !link.send(message, payload) {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
                inbound = link.recv() => match inbound {
                    Some(Outbound::Frame(message, payload)) => {
                        inner.dispatch(&message, payload.as_ref());
                    }
                    Some(Outbound::Close) | None => break,
                },
            }
        }
        debug!("Local link {} detached", link.id());
        drop(link);
        inner.mark_closed();
    });

    Ok(vec![task.abort_handle()])
}
