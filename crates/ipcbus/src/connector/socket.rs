// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket-backed link.

use super::ConnectorInner;
use crate::config::ConnectOptions;
use crate::error::ConnectionError;
use crate::wire::{self, OutboundRx};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Dial `options` and start the reader and writer tasks.
pub(super) async fn spawn(
    inner: Arc<ConnectorInner>,
    options: &ConnectOptions,
    mut rx: OutboundRx,
    max_message_size: usize,
) -> Result<Vec<AbortHandle>, ConnectionError> {
    let (mut reader, writer) = wire::dial(options).await?;
    let target = options.describe();
    let mode = options.buffer_mode();

    let writer_target = target.clone();
    let write_task = tokio::spawn(async move {
        if let Err(e) = wire::write_loop(writer, &mut rx, mode).await {
            debug!("Write side to {} ended: {}", writer_target, e);
        }
    });

    let read_task = tokio::spawn(async move {
        let result = wire::read_loop(&mut reader, max_message_size, |frame| {
            inner.dispatch(&frame.message, frame.payload.as_ref());
        })
        .await;
        if let Err(e) = result {
            warn!("Link to {} failed: {}", target, e);
        }
        inner.mark_closed();
    });

    Ok(vec![write_task.abort_handle(), read_task.abort_handle()])
}
