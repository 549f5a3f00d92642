// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire framing.
//!
//! A frame is an encoded array of one or two elements, `[message]` or
//! `[message, args]`. Frames are written back to back; the 5-byte array
//! header (tag + byte length) is enough to know whether a whole frame has
//! arrived.

pub mod value;

pub use value::Value;

use crate::error::ProtocolError;
use crate::message::{Message, Payload};
use bytes::{BufMut, Bytes, BytesMut};
use value::{Cursor, CONTAINER_HEADER_SIZE, TAG_ARRAY};

/// Default upper bound for one frame (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// A decoded message with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    /// `None` for a `[message]` tuple.
    pub payload: Option<Payload>,
}

/// Encode one frame.
///
/// Returns the header + message buffer, followed by the args block as its
/// own buffer when the payload is already encoded, so that a shared raw
/// payload is never copied.
pub fn encode_frame(message: &Message, payload: Option<&Payload>) -> Vec<Bytes> {
    let mut head = BytesMut::with_capacity(128);
    head.put_u8(TAG_ARRAY);
    let len_pos = head.len();
    head.put_u32_le(0);
    head.put_u32_le(if payload.is_some() { 2 } else { 1 });
    message.to_value().encode(&mut head);

    let raw = match payload {
        Some(Payload::Args(args)) => {
            value::encode_array(&mut head, args);
            None
        }
        Some(Payload::Raw(bytes)) => Some(bytes.clone()),
        None => None,
    };

    let byte_len = head.len() - CONTAINER_HEADER_SIZE + raw.as_ref().map_or(0, Bytes::len);
    head[len_pos..len_pos + 4].copy_from_slice(&(byte_len as u32).to_le_bytes());

    let mut out = Vec::with_capacity(2);
    out.push(head.freeze());
    out.extend(raw);
    out
}

/// Total length of an encoded frame.
pub fn frame_len(buffers: &[Bytes]) -> usize {
    buffers.iter().map(Bytes::len).sum()
}

/// Length [`encode_frame`] would produce, without encoding the args.
pub fn encoded_frame_len(message: &Message, payload: Option<&Payload>) -> usize {
    CONTAINER_HEADER_SIZE
        + 4
        + message.to_value().encoded_len()
        + payload.map_or(0, Payload::wire_len)
}

/// Incremental frame decoder for a byte stream.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_message_size: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameReader {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_READ_CAPACITY),
            max_message_size,
        }
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Buffer to read into directly, for callers using `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` while the frame is incomplete; partial bytes stay
    /// buffered. A non-fatal error means the frame was consumed and dropped,
    /// a fatal one means the stream cannot be resynchronised.
    pub fn try_decode_one(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < CONTAINER_HEADER_SIZE {
            return Ok(None);
        }

        let tag = self.buf[0];
        if tag != TAG_ARRAY {
            return Err(ProtocolError::BadFrameHeader(tag));
        }
        let byte_len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let total = CONTAINER_HEADER_SIZE + byte_len as usize;
        if total > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let frame = self.buf.split_to(total).freeze();
        decode_frame(&frame).map(Some)
    }

    /// Release memory held by an idle reader.
    pub fn compact(&mut self) {
        if self.buf.is_empty() && self.buf.capacity() > INITIAL_READ_CAPACITY * 4 {
            self.buf = BytesMut::with_capacity(INITIAL_READ_CAPACITY);
        }
    }
}

/// Decode one complete frame; args stay encoded.
pub fn decode_frame(frame: &Bytes) -> Result<Frame, ProtocolError> {
    let mut cursor = Cursor::new(frame);
    let tag = cursor.read_u8()?;
    if tag != TAG_ARRAY {
        return Err(ProtocolError::BadFrameHeader(tag));
    }
    let byte_len = cursor.read_u32()? as usize;
    if byte_len != cursor.remaining() {
        return Err(ProtocolError::Truncated {
            needed: byte_len,
            available: cursor.remaining(),
        });
    }
    let count = cursor.read_u32()?;
    if count != 1 && count != 2 {
        return Err(ProtocolError::InvalidMessage(format!(
            "frame must hold 1 or 2 elements, got {}",
            count
        )));
    }

    let message = Message::from_value(&cursor.read_value()?)?;
    let payload = if count == 2 {
        Some(Payload::from_encoded(cursor.read_raw_value()?)?)
    } else {
        None
    };

    if cursor.remaining() != 0 {
        return Err(ProtocolError::InvalidMessage(format!(
            "{} trailing bytes in frame at offset {}",
            cursor.remaining(),
            cursor.position()
        )));
    }

    Ok(Frame { message, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, RequestDescriptor};
    use crate::peer::{Peer, ProcessType};

    fn message(channel: &str) -> Message {
        Message::new(
            MessageKind::Send,
            channel,
            Peer::new(ProcessType::SocketClient).with_id("sender"),
        )
    }

    fn concat(buffers: &[Bytes]) -> Vec<u8> {
        buffers.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn test_raw_payload_is_a_separate_buffer() {
        let payload = Payload::encode_raw(&[Value::Int(1)]);
        let buffers = encode_frame(&message("x"), Some(&payload));
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[1], payload.encoded());

        let buffers = encode_frame(&message("x"), Some(&Payload::Args(vec![Value::Int(1)])));
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn test_absent_empty_and_undefined_args_are_distinct() {
        let m = message("x");
        let cases = [
            None,
            Some(Payload::Args(vec![])),
            Some(Payload::Args(vec![Value::Undefined])),
        ];

        let mut reader = FrameReader::default();
        for payload in &cases {
            reader.feed(&concat(&encode_frame(&m, payload.as_ref())));
        }

        let absent = reader.try_decode_one().unwrap().unwrap();
        assert!(absent.payload.is_none());

        let empty = reader.try_decode_one().unwrap().unwrap();
        assert_eq!(empty.payload.unwrap().to_args().unwrap(), vec![]);

        let undefined = reader.try_decode_one().unwrap().unwrap();
        assert_eq!(
            undefined.payload.unwrap().to_args().unwrap(),
            vec![Value::Undefined]
        );
        assert!(reader.try_decode_one().unwrap().is_none());
    }

    #[test]
    fn test_split_at_every_offset() {
        let m = Message::new(
            MessageKind::Request(RequestDescriptor {
                id: "r-1".into(),
                reply_channel: "reply".into(),
            }),
            "svc",
            Peer::new(ProcessType::Worker).with_id("w"),
        );
        let args = vec![
            Value::from("héllo"),
            Value::Float(0.1),
            Value::from(vec![0u8, 1, 2, 255]),
            Value::object([("n", Value::Int(-7))]),
            Value::Bool(true),
            Value::Int(7),
            Value::Undefined,
            Value::Null,
            Value::Array(vec![Value::Bool(false), Value::Array(vec![Value::from("deep")])]),
        ];
        let mut bytes = concat(&encode_frame(&m, Some(&Payload::Args(args.clone()))));
        bytes.extend(concat(&encode_frame(&message("next"), None)));

        for split in 0..=bytes.len() {
            let mut reader = FrameReader::default();
            let mut frames = Vec::new();

            reader.feed(&bytes[..split]);
            while let Some(frame) = reader.try_decode_one().unwrap() {
                frames.push(frame);
            }
            reader.feed(&bytes[split..]);
            while let Some(frame) = reader.try_decode_one().unwrap() {
                frames.push(frame);
            }

            assert_eq!(frames.len(), 2, "split at {}", split);
            assert_eq!(frames[0].message, m);
            assert_eq!(
                frames[0].payload.as_ref().unwrap().to_args().unwrap(),
                args
            );
            assert_eq!(frames[1].message.channel, "next");
            assert_eq!(reader.buffered(), 0);
        }
    }

    #[test]
    fn test_decoded_args_stay_raw() {
        let payload = Payload::Args(vec![Value::from("a")]);
        let bytes = concat(&encode_frame(&message("x"), Some(&payload)));
        let mut reader = FrameReader::default();
        reader.feed(&bytes);
        let frame = reader.try_decode_one().unwrap().unwrap();
        let decoded = frame.payload.unwrap();
        assert!(decoded.is_raw());
        assert_eq!(decoded.encoded(), payload.encoded());
    }

    #[test]
    fn test_bad_header_is_fatal() {
        let mut reader = FrameReader::default();
        reader.feed(&[0x06, 0, 0, 0, 0]);
        let err = reader.try_decode_one().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let mut reader = FrameReader::new(64);
        let big = Payload::Args(vec![Value::from("x".repeat(100))]);
        reader.feed(&concat(&encode_frame(&message("x"), Some(&big))));
        assert!(matches!(
            reader.try_decode_one(),
            Err(ProtocolError::FrameTooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_bad_frame_body_drops_only_that_frame() {
        let mut bad = BytesMut::new();
        bad.put_u8(TAG_ARRAY);
        let pos = bad.len();
        bad.put_u32_le(0);
        bad.put_u32_le(1);
        Value::object([("k", Value::Int(77))]).encode(&mut bad);
        let len = (bad.len() - CONTAINER_HEADER_SIZE) as u32;
        bad[pos..pos + 4].copy_from_slice(&len.to_le_bytes());

        let mut reader = FrameReader::default();
        reader.feed(&bad);
        reader.feed(&concat(&encode_frame(&message("ok"), None)));

        let err = reader.try_decode_one().unwrap_err();
        assert!(!err.is_fatal());
        let next = reader.try_decode_one().unwrap().unwrap();
        assert_eq!(next.message.channel, "ok");
    }

    fn deep_array(depth: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        for level in (1..=depth).rev() {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32_le((5 + 9 * (level - 1)) as u32);
            buf.put_u32_le(1);
        }
        buf.put_u8(value::TAG_NULL);
        buf
    }

    #[test]
    fn test_deeply_nested_frame_is_dropped() {
        let inner = deep_array(10_000);
        let mut bad = BytesMut::new();
        bad.put_u8(TAG_ARRAY);
        bad.put_u32_le((4 + inner.len()) as u32);
        bad.put_u32_le(1);
        bad.extend_from_slice(&inner);

        let mut reader = FrameReader::default();
        reader.feed(&bad);
        reader.feed(&concat(&encode_frame(&message("ok"), None)));

        let err = reader.try_decode_one().unwrap_err();
        assert!(!err.is_fatal());
        let next = reader.try_decode_one().unwrap().unwrap();
        assert_eq!(next.message.channel, "ok");
    }

    #[test]
    fn test_deeply_nested_args_fail_on_decode() {
        let mut args = BytesMut::new();
        let inner = deep_array(10_000);
        args.put_u8(TAG_ARRAY);
        args.put_u32_le((4 + inner.len()) as u32);
        args.put_u32_le(1);
        args.extend_from_slice(&inner);

        let payload = Payload::from_encoded(args.freeze()).unwrap();
        let mut reader = FrameReader::default();
        reader.feed(&concat(&encode_frame(&message("x"), Some(&payload))));
        let frame = reader.try_decode_one().unwrap().unwrap();
        let err = frame.payload.unwrap().to_args().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_frame_len_matches_wire() {
        let payload = Payload::encode_raw(&[Value::Int(2)]);
        let buffers = encode_frame(&message("x"), Some(&payload));
        let bytes = concat(&buffers);
        let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(declared + CONTAINER_HEADER_SIZE, frame_len(&buffers));
    }

    #[test]
    fn test_encoded_frame_len_without_encoding() {
        let m = message("x").with_target(Peer::new(ProcessType::Worker).with_id("t"));
        let args = vec![Value::from("abc"), Value::object([("k", Value::Int(1))])];
        for payload in [
            None,
            Some(Payload::Args(args.clone())),
            Some(Payload::encode_raw(&args)),
        ] {
            assert_eq!(
                encoded_frame_len(&m, payload.as_ref()),
                frame_len(&encode_frame(&m, payload.as_ref()))
            );
        }
    }
}
