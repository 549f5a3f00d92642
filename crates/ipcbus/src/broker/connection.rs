// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening socket and per-connection I/O tasks.

use super::{BrokerEvent, BrokerHandle, ConnRole};
use crate::config::{ConnectOptions, SocketBuffer};
use crate::error::BusError;
use crate::wire::{self, BoxedReader, BoxedWriter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bound listening socket.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl Listener {
    pub(crate) async fn bind(options: &ConnectOptions) -> Result<Self, BusError> {
        if let Some(addr) = options.tcp_address() {
            return Ok(Self::Tcp(TcpListener::bind(&addr).await?));
        }
        match &options.path {
            #[cfg(unix)]
            Some(path) => {
                // A stale socket file from a previous run blocks bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Self::Unix(tokio::net::UnixListener::bind(path)?, path.clone()))
            }
            _ => Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot listen on {}", options.describe()),
            ))),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(..) => None,
        }
    }

    pub(crate) fn unix_path(&self) -> Option<PathBuf> {
        match self {
            Self::Tcp(_) => None,
            #[cfg(unix)]
            Self::Unix(_, path) => Some(path.clone()),
        }
    }

    async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter, String)> {
        match self {
            Self::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = wire::split_tcp(stream);
                Ok((r, w, addr.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                let (r, w) = wire::split_unix(stream);
                Ok((r, w, format!("unix:{}", path.display())))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accept connections until shutdown.
pub(crate) async fn accept_loop(
    listener: Listener,
    handle: BrokerHandle,
    mode: SocketBuffer,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((reader, writer, remote)) => {
                        info!("New connection from {}", remote);
                        spawn_connection(
                            &handle,
                            reader,
                            writer,
                            remote,
                            ConnRole::Client,
                            mode,
                            max_message_size,
                        );
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Register a socket with the router and start its reader and writer.
///
/// The returned task finishes once the connection is gone.
pub(crate) fn spawn_connection(
    handle: &BrokerHandle,
    mut reader: BoxedReader,
    writer: BoxedWriter,
    remote: String,
    role: ConnRole,
    mode: SocketBuffer,
    max_message_size: usize,
) -> JoinHandle<()> {
    let conn = handle.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = handle.events();
    let _ = events.send(BrokerEvent::Attach {
        conn,
        tx,
        remote: remote.clone(),
        role,
    });

    let writer_remote = remote.clone();
    let writer_task = tokio::spawn(async move {
        if let Err(e) = wire::write_loop(writer, &mut rx, mode).await {
            debug!("Write side of {} ended: {}", writer_remote, e);
        }
    });

    tokio::spawn(async move {
        let result = wire::read_loop(&mut reader, max_message_size, |frame| {
            let _ = events.send(BrokerEvent::Inbound {
                conn,
                message: Arc::new(frame.message),
                payload: frame.payload,
            });
        })
        .await;

        match result {
            Ok(()) => info!("Connection closed: {}", remote),
            Err(e) => warn!("Read error from {}: {}", remote, e),
        }

        let _ = events.send(BrokerEvent::Detach { conn });
        // The router drops the outbound sender on detach, which ends the writer.
        let _ = writer_task.await;
    })
}
