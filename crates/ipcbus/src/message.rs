// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus messages.
//!
//! A [`Message`] is the routing envelope; its arguments travel next to it as
//! an optional [`Payload`]. On the wire the pair is the tuple
//! `[message]` or `[message, args]` (see [`crate::codec`]).

use crate::codec::value::{array_encoded_len, encode_array, Cursor, TAG_ARRAY};
use crate::codec::Value;
use crate::error::ProtocolError;
use crate::logging::LogLevel;
use crate::peer::Peer;
use bytes::{Bytes, BytesMut};

/// Correlation data attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Request id, unique per requester.
    pub id: String,
    /// Channel the response is delivered on.
    pub reply_channel: String,
}

/// Correlation data attached to a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    /// Id of the request being answered.
    pub id: String,
    /// `true` if the responder resolved, `false` if it rejected.
    pub resolve: bool,
}

/// Message kind with the data each kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Send,
    Request(RequestDescriptor),
    RequestResponse(ResponseDescriptor),
    AddChannelListener,
    RemoveChannelListener,
    RemoveChannelAllListeners,
    /// Drop every subscription of the sender.
    RemoveListeners,
    QueryState {
        session: String,
    },
    /// Snapshot travels in args[0].
    QueryStateResponse {
        session: String,
    },
    /// Timing record travels in args[0].
    LogRoundtrip,
    BridgeConnect {
        channels: Vec<String>,
    },
    BridgeClose,
    /// Sent by the connecting side; `peer` is the connecting peer.
    Handshake,
    /// Broker reply to [`MessageKind::Handshake`]; targeted at the new peer.
    HandshakeAck {
        log_level: LogLevel,
        error: Option<String>,
    },
    /// The sender leaves a connection that other peers keep using.
    PeerClose,
}

/// Which inbound handler a kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Data,
    Response,
    Command,
    LogRoundtrip,
    Handshake,
}

impl MessageKind {
    pub fn code(&self) -> i64 {
        match self {
            Self::Send => 0,
            Self::Request(_) => 1,
            Self::RequestResponse(_) => 2,
            Self::AddChannelListener => 3,
            Self::RemoveChannelListener => 4,
            Self::RemoveChannelAllListeners => 5,
            Self::RemoveListeners => 6,
            Self::QueryState { .. } => 7,
            Self::QueryStateResponse { .. } => 8,
            Self::LogRoundtrip => 9,
            Self::BridgeConnect { .. } => 10,
            Self::BridgeClose => 11,
            Self::Handshake => 12,
            Self::HandshakeAck { .. } => 13,
            Self::PeerClose => 14,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Request(_) => "request",
            Self::RequestResponse(_) => "request-response",
            Self::AddChannelListener => "add-channel-listener",
            Self::RemoveChannelListener => "remove-channel-listener",
            Self::RemoveChannelAllListeners => "remove-channel-all-listeners",
            Self::RemoveListeners => "remove-listeners",
            Self::QueryState { .. } => "query-state",
            Self::QueryStateResponse { .. } => "query-state-response",
            Self::LogRoundtrip => "log-roundtrip",
            Self::BridgeConnect { .. } => "bridge-connect",
            Self::BridgeClose => "bridge-close",
            Self::Handshake => "handshake",
            Self::HandshakeAck { .. } => "handshake-ack",
            Self::PeerClose => "peer-close",
        }
    }

    pub fn class(&self) -> KindClass {
        match self {
            Self::Send | Self::Request(_) => KindClass::Data,
            Self::RequestResponse(_) | Self::QueryStateResponse { .. } => KindClass::Response,
            Self::LogRoundtrip => KindClass::LogRoundtrip,
            Self::Handshake | Self::HandshakeAck { .. } | Self::PeerClose => KindClass::Handshake,
            Self::AddChannelListener
            | Self::RemoveChannelListener
            | Self::RemoveChannelAllListeners
            | Self::RemoveListeners
            | Self::QueryState { .. }
            | Self::BridgeConnect { .. }
            | Self::BridgeClose => KindClass::Command,
        }
    }
}

/// Routing envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub kind: MessageKind,
    /// Originating peer.
    pub peer: Peer,
    /// Explicit destination; bypasses channel routing when set.
    pub target: Option<Peer>,
}

impl Message {
    pub fn new(kind: MessageKind, channel: impl Into<String>, peer: Peer) -> Self {
        Self {
            channel: channel.into(),
            kind,
            peer,
            target: None,
        }
    }

    pub fn with_target(mut self, target: Peer) -> Self {
        self.target = Some(target);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            ("k".to_string(), Value::Int(self.kind.code())),
            ("c".to_string(), Value::from(self.channel.as_str())),
            ("p".to_string(), self.peer.to_value()),
        ];
        if let Some(target) = &self.target {
            entries.push(("t".to_string(), target.to_value()));
        }
        match &self.kind {
            MessageKind::Request(req) => entries.push((
                "r".to_string(),
                Value::object([
                    ("id", Value::from(req.id.as_str())),
                    ("c", Value::from(req.reply_channel.as_str())),
                ]),
            )),
            MessageKind::RequestResponse(res) => entries.push((
                "r".to_string(),
                Value::object([
                    ("id", Value::from(res.id.as_str())),
                    ("ok", Value::Bool(res.resolve)),
                ]),
            )),
            MessageKind::QueryState { session } | MessageKind::QueryStateResponse { session } => {
                entries.push(("s".to_string(), Value::from(session.as_str())));
            }
            MessageKind::BridgeConnect { channels } => entries.push((
                "l".to_string(),
                Value::Array(channels.iter().map(|c| Value::from(c.as_str())).collect()),
            )),
            MessageKind::HandshakeAck { log_level, error } => {
                entries.push(("lv".to_string(), Value::Int(log_level.code())));
                if let Some(error) = error {
                    entries.push(("e".to_string(), Value::from(error.as_str())));
                }
            }
            _ => {}
        }
        Value::Object(entries)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let code = value
            .get("k")
            .and_then(Value::as_i64)
            .ok_or_else(|| invalid("message without kind"))?;
        let channel = value
            .get("c")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("message without channel"))?
            .to_string();
        let peer = Peer::from_value(value.get("p").ok_or_else(|| invalid("message without peer"))?)?;
        let target = value.get("t").map(Peer::from_value).transpose()?;

        let descriptor_id = || {
            value
                .get("r")
                .and_then(|r| r.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid("request descriptor without id"))
        };
        let session = || {
            value
                .get("s")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid("query without session"))
        };

        let kind = match code {
            0 => MessageKind::Send,
            1 => MessageKind::Request(RequestDescriptor {
                id: descriptor_id()?,
                reply_channel: value
                    .get("r")
                    .and_then(|r| r.get("c"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("request descriptor without reply channel"))?
                    .to_string(),
            }),
            2 => MessageKind::RequestResponse(ResponseDescriptor {
                id: descriptor_id()?,
                resolve: value
                    .get("r")
                    .and_then(|r| r.get("ok"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            3 => MessageKind::AddChannelListener,
            4 => MessageKind::RemoveChannelListener,
            5 => MessageKind::RemoveChannelAllListeners,
            6 => MessageKind::RemoveListeners,
            7 => MessageKind::QueryState { session: session()? },
            8 => MessageKind::QueryStateResponse { session: session()? },
            9 => MessageKind::LogRoundtrip,
            10 => MessageKind::BridgeConnect {
                channels: value
                    .get("l")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            11 => MessageKind::BridgeClose,
            12 => MessageKind::Handshake,
            13 => MessageKind::HandshakeAck {
                log_level: value
                    .get("lv")
                    .and_then(Value::as_i64)
                    .map(LogLevel::from_code)
                    .unwrap_or_default(),
                error: value.get("e").and_then(Value::as_str).map(str::to_string),
            },
            14 => MessageKind::PeerClose,
            other => return Err(ProtocolError::UnknownKind(other)),
        };

        Ok(Self {
            channel,
            kind,
            peer,
            target,
        })
    }
}

fn invalid(reason: &str) -> ProtocolError {
    ProtocolError::InvalidMessage(reason.to_string())
}

/// Message arguments.
///
/// The representation is fixed at construction: `Args` is still
/// structured, `Raw` is an already-encoded args array that the codec writes
/// verbatim. Frames read off a socket carry `Raw` payloads that are only
/// decoded when a listener needs them.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Args(Vec<Value>),
    Raw(Bytes),
}

impl Payload {
    /// Serialize args once, for fan-out to many destinations.
    pub fn encode_raw(args: &[Value]) -> Self {
        let mut buf = BytesMut::new();
        encode_array(&mut buf, args);
        Self::Raw(buf.freeze())
    }

    /// Wrap bytes that must already be an encoded array value.
    pub fn from_encoded(bytes: Bytes) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(&bytes);
        let tag = cursor.read_u8()?;
        if tag != TAG_ARRAY {
            return Err(ProtocolError::InvalidMessage(format!(
                "raw payload must be an array, got tag 0x{:02x}",
                tag
            )));
        }
        let byte_len = cursor.read_u32()? as usize;
        if cursor.remaining() != byte_len {
            return Err(ProtocolError::Truncated {
                needed: byte_len,
                available: cursor.remaining(),
            });
        }
        Ok(Self::Raw(bytes))
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// Decoded argument list.
    pub fn to_args(&self) -> Result<Vec<Value>, ProtocolError> {
        match self {
            Self::Args(args) => Ok(args.clone()),
            Self::Raw(bytes) => match Value::decode(bytes)? {
                Value::Array(items) => Ok(items),
                _ => Err(invalid("raw payload is not an array")),
            },
        }
    }

    pub fn into_args(self) -> Result<Vec<Value>, ProtocolError> {
        match self {
            Self::Args(args) => Ok(args),
            raw @ Self::Raw(_) => raw.to_args(),
        }
    }

    /// Encoded form; free for `Raw`.
    pub fn encoded(&self) -> Bytes {
        match self {
            Self::Args(args) => {
                let mut buf = BytesMut::new();
                encode_array(&mut buf, args);
                buf.freeze()
            }
            Self::Raw(bytes) => bytes.clone(),
        }
    }

    /// Size of the encoded args block.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Args(args) => array_encoded_len(args),
            Self::Raw(bytes) => bytes.len(),
        }
    }
}

impl From<Vec<Value>> for Payload {
    fn from(args: Vec<Value>) -> Self {
        Self::Args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ProcessType;

    fn peer() -> Peer {
        Peer::new(ProcessType::SocketClient).with_id("p1")
    }

    #[test]
    fn test_message_value_roundtrip_all_kinds() {
        let kinds = vec![
            MessageKind::Send,
            MessageKind::Request(RequestDescriptor {
                id: "r1".into(),
                reply_channel: "reply".into(),
            }),
            MessageKind::RequestResponse(ResponseDescriptor {
                id: "r1".into(),
                resolve: true,
            }),
            MessageKind::AddChannelListener,
            MessageKind::RemoveChannelListener,
            MessageKind::RemoveChannelAllListeners,
            MessageKind::RemoveListeners,
            MessageKind::QueryState {
                session: "s".into(),
            },
            MessageKind::QueryStateResponse {
                session: "s".into(),
            },
            MessageKind::LogRoundtrip,
            MessageKind::BridgeConnect {
                channels: vec!["a".into(), "b".into()],
            },
            MessageKind::BridgeClose,
            MessageKind::Handshake,
            MessageKind::HandshakeAck {
                log_level: LogLevel::Traffic,
                error: Some("full".into()),
            },
            MessageKind::PeerClose,
        ];

        for kind in kinds {
            let msg = Message::new(kind, "chan", peer());
            let back = Message::from_value(&msg.to_value()).unwrap();
            assert_eq!(back, msg, "kind {}", msg.kind_name());
        }
    }

    #[test]
    fn test_target_survives_encoding() {
        let target = Peer::new(ProcessType::Worker).with_sub_endpoint("7");
        let msg = Message::new(MessageKind::Send, "y", peer()).with_target(target.clone());
        let back = Message::from_value(&msg.to_value()).unwrap();
        assert_eq!(back.target, Some(target));
    }

    #[test]
    fn test_unknown_kind_is_reported() {
        let mut value = Message::new(MessageKind::Send, "x", peer()).to_value();
        if let Value::Object(entries) = &mut value {
            entries[0].1 = Value::Int(99);
        }
        assert_eq!(
            Message::from_value(&value),
            Err(ProtocolError::UnknownKind(99))
        );
    }

    #[test]
    fn test_kind_classes() {
        assert_eq!(MessageKind::Send.class(), KindClass::Data);
        assert_eq!(MessageKind::LogRoundtrip.class(), KindClass::LogRoundtrip);
        assert_eq!(MessageKind::BridgeClose.class(), KindClass::Command);
        assert_eq!(
            MessageKind::QueryStateResponse {
                session: String::new()
            }
            .class(),
            KindClass::Response
        );
    }

    #[test]
    fn test_raw_payload_decodes_lazily() {
        let args = vec![Value::Int(1), Value::from("two"), Value::Undefined];
        let raw = Payload::encode_raw(&args);
        assert!(raw.is_raw());
        assert_eq!(raw.to_args().unwrap(), args);
        assert_eq!(raw.encoded(), Payload::Args(args).encoded());
    }

    #[test]
    fn test_from_encoded_validates_header() {
        let not_array = Value::Int(3).to_bytes();
        assert!(Payload::from_encoded(not_array).is_err());

        let encoded = Payload::encode_raw(&[Value::Null]).encoded();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(Payload::from_encoded(truncated).is_err());
        assert!(Payload::from_encoded(encoded).is_ok());
    }
}
