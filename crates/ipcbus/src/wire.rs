// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket plumbing shared by connectors and the broker.

use crate::codec::{encode_frame, Frame, FrameReader};
use crate::config::{ConnectOptions, SocketBuffer};
use crate::error::ConnectionError;
use crate::message::{Message, Payload};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{trace, warn};

const READ_CHUNK: usize = 16 * 1024;
const DELAYED_CAPACITY: usize = 64 * 1024;
const UNBUFFERED_CAPACITY: usize = 8 * 1024;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Item queued for a connection's writer.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Frame(Arc<Message>, Option<Payload>),
    /// Flush, close the write side and stop.
    Close,
}

pub(crate) type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub(crate) type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Split a TCP stream into boxed halves.
pub(crate) fn split_tcp(stream: TcpStream) -> (BoxedReader, BoxedWriter) {
    let (r, w) = stream.into_split();
    (Box::new(r), Box::new(w))
}

#[cfg(unix)]
pub(crate) fn split_unix(stream: tokio::net::UnixStream) -> (BoxedReader, BoxedWriter) {
    let (r, w) = stream.into_split();
    (Box::new(r), Box::new(w))
}

/// Open a socket to `options` (TCP when a port is set, else the Unix path).
pub(crate) async fn dial(
    options: &ConnectOptions,
) -> Result<(BoxedReader, BoxedWriter), ConnectionError> {
    match options.timeout() {
        Some(after) => tokio::time::timeout(after, open(options))
            .await
            .unwrap_or(Err(ConnectionError::Timeout(after))),
        None => open(options).await,
    }
}

async fn open(options: &ConnectOptions) -> Result<(BoxedReader, BoxedWriter), ConnectionError> {
    if let Some(addr) = options.tcp_address() {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(ConnectionError::from_dial)?;
        stream.set_nodelay(options.buffer_mode() == SocketBuffer::Unbuffered)?;
        return Ok(split_tcp(stream));
    }

    match &options.path {
        #[cfg(unix)]
        Some(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(ConnectionError::from_dial)?;
            Ok(split_unix(stream))
        }
        #[cfg(not(unix))]
        Some(path) => Err(ConnectionError::Refused(format!(
            "unix sockets unsupported on this platform: {}",
            path.display()
        ))),
        None => Err(ConnectionError::Refused("no port or path to dial".into())),
    }
}

/// Read frames until EOF, calling `on_frame` for each.
///
/// Frames that fail to decode are logged and skipped; a corrupt header
/// ends the loop with an error.
pub(crate) async fn read_loop<R, F>(
    reader: &mut R,
    max_message_size: usize,
    mut on_frame: F,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(Frame),
{
    let mut frames = FrameReader::new(max_message_size);
    loop {
        frames.buffer_mut().reserve(READ_CHUNK);
        let n = reader.read_buf(frames.buffer_mut()).await?;
        if n == 0 {
            if frames.buffered() > 0 {
                trace!("EOF with {} partial bytes buffered", frames.buffered());
            }
            return Ok(());
        }

        loop {
            match frames.try_decode_one() {
                Ok(Some(frame)) => on_frame(frame),
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }
        frames.compact();
    }
}

/// Drain `rx` into `writer` until closed or told to close.
pub(crate) async fn write_loop<W>(
    writer: W,
    rx: &mut OutboundRx,
    mode: SocketBuffer,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let capacity = match mode {
        SocketBuffer::Unbuffered => UNBUFFERED_CAPACITY,
        SocketBuffer::Delayed => DELAYED_CAPACITY,
        SocketBuffer::Buffered(n) => n.max(1),
    };
    let mut writer = BufWriter::with_capacity(capacity, writer);

    while let Some(item) = rx.recv().await {
        let mut closing = !write_item(&mut writer, item).await?;

        if mode != SocketBuffer::Unbuffered {
            while !closing {
                match rx.try_recv() {
                    Ok(item) => closing = !write_item(&mut writer, item).await?,
                    Err(_) => break,
                }
            }
        }

        writer.flush().await?;
        if closing {
            break;
        }
    }

    writer.shutdown().await
}

/// Returns `false` for [`Outbound::Close`].
async fn write_item<W>(writer: &mut BufWriter<W>, item: Outbound) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match item {
        Outbound::Frame(message, payload) => {
            for buf in encode_frame(&message, payload.as_ref()) {
                writer.write_all(&buf).await?;
            }
            Ok(true)
        }
        Outbound::Close => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::message::MessageKind;
    use crate::peer::{Peer, ProcessType};

    fn frame(channel: &str, n: i64) -> Outbound {
        Outbound::Frame(
            Arc::new(Message::new(
                MessageKind::Send,
                channel,
                Peer::new(ProcessType::SocketClient).with_id("p"),
            )),
            Some(Payload::Args(vec![Value::Int(n)])),
        )
    }

    async fn pipe(mode: SocketBuffer) -> Vec<Frame> {
        let (client, mut server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..20 {
            tx.send(frame("x", i)).unwrap();
        }
        tx.send(Outbound::Close).unwrap();

        let writer = tokio::spawn(async move { write_loop(client, &mut rx, mode).await });
        let mut frames = Vec::new();
        read_loop(&mut server, 1024, |f| frames.push(f)).await.unwrap();
        writer.await.unwrap().unwrap();
        frames
    }

    #[tokio::test]
    async fn test_order_preserved_in_every_mode() {
        for mode in [
            SocketBuffer::Unbuffered,
            SocketBuffer::Delayed,
            SocketBuffer::Buffered(16),
        ] {
            let frames = pipe(mode).await;
            let values: Vec<i64> = frames
                .iter()
                .map(|f| f.payload.as_ref().unwrap().to_args().unwrap()[0].as_i64().unwrap())
                .collect();
            assert_eq!(values, (0..20).collect::<Vec<_>>(), "mode {:?}", mode);
        }
    }

    #[tokio::test]
    async fn test_corrupt_header_ends_read_loop() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x42, 0, 0, 0, 0]).await.unwrap();
        drop(client);
        let result = read_loop(&mut server, 1024, |_| {}).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    }
}
