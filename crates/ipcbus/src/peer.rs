// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus participant identity.

use crate::codec::Value;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    /// The process that owns the host runtime's dependent views/workers.
    Coordinator,
    /// A dependent process of a coordinator.
    Worker,
    /// A plain process connected to the broker over a socket.
    SocketClient,
    /// Another broker or registry linked through a bridge.
    Bridge,
}

impl ProcessType {
    pub fn code(self) -> i64 {
        match self {
            Self::Coordinator => 0,
            Self::Worker => 1,
            Self::SocketClient => 2,
            Self::Bridge => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Coordinator),
            1 => Some(Self::Worker),
            2 => Some(Self::SocketClient),
            3 => Some(Self::Bridge),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
            Self::SocketClient => "socket-client",
            Self::Bridge => "bridge",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressable bus participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Unique id (uuid v4 unless supplied by the caller).
    pub id: String,
    /// Process role.
    pub process_type: ProcessType,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Sub-endpoint id when several endpoints are multiplexed behind one
    /// connection (e.g. views of one worker process).
    #[serde(default)]
    pub sub_endpoint: Option<String>,
}

impl Peer {
    /// Create a peer with a freshly generated id.
    pub fn new(process_type: ProcessType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            process_type,
            name: None,
            sub_endpoint: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sub_endpoint(mut self, sub_endpoint: impl Into<String>) -> Self {
        self.sub_endpoint = Some(sub_endpoint.into());
        self
    }

    /// Registry key for this peer.
    pub fn key(&self) -> PeerKey {
        PeerKey::of(self)
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut entries = vec![
            ("id".to_string(), Value::from(self.id.as_str())),
            ("type".to_string(), Value::Int(self.process_type.code())),
        ];
        if let Some(name) = &self.name {
            entries.push(("name".to_string(), Value::from(name.as_str())));
        }
        if let Some(sub) = &self.sub_endpoint {
            entries.push(("sub".to_string(), Value::from(sub.as_str())));
        }
        Value::Object(entries)
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidMessage("peer without id".into()))?;
        let code = value
            .get("type")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::InvalidMessage("peer without type".into()))?;
        let process_type = ProcessType::from_code(code).ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("unknown process type {}", code))
        })?;
        Ok(Self {
            id: id.to_string(),
            process_type,
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
            sub_endpoint: value.get("sub").and_then(Value::as_str).map(str::to_string),
        })
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{} ({})", self.process_type, name, self.id),
            None => write!(f, "{}:{}", self.process_type, self.id),
        }
    }
}

/// Registry key derived from a [`Peer`].
///
/// Plain peers are keyed by id; multiplexed sub-endpoints append `/` and
/// their sub-endpoint id. `/` and `\` inside either part are escaped, so
/// the separator only ever appears once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn of(peer: &Peer) -> Self {
        let mut key = String::with_capacity(peer.id.len());
        push_escaped(&mut key, &peer.id);
        if let Some(sub) = &peer.sub_endpoint {
            key.push('/');
            push_escaped(&mut key, sub);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        if c == '/' || c == '\\' {
            key.push('\\');
        }
        key.push(c);
    }
}

impl From<&Peer> for PeerKey {
    fn from(peer: &Peer) -> Self {
        Self::of(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_ids_are_unique() {
        let a = Peer::new(ProcessType::Worker);
        let b = Peer::new(ProcessType::Worker);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_peer_key_for_sub_endpoints() {
        let base = Peer::new(ProcessType::Worker).with_id("w1");
        let view_a = base.clone().with_sub_endpoint("3");
        let view_b = base.clone().with_sub_endpoint("4");

        assert_eq!(base.key().as_str(), "w1");
        assert_eq!(view_a.key().as_str(), "w1/3");
        assert_ne!(view_a.key(), view_b.key());
    }

    #[test]
    fn test_peer_key_separator_in_id_does_not_collide() {
        let slashed = Peer::new(ProcessType::Worker).with_id("a/0");
        let sub = Peer::new(ProcessType::Worker).with_id("a").with_sub_endpoint("0");
        assert_ne!(slashed.key(), sub.key());
        assert_eq!(sub.key().as_str(), "a/0");

        let escaped = Peer::new(ProcessType::Worker).with_id("a\\").with_sub_endpoint("0");
        let nested = Peer::new(ProcessType::Worker).with_id("a").with_sub_endpoint("\\/0");
        assert_ne!(escaped.key(), nested.key());
        assert_ne!(
            Peer::new(ProcessType::Worker).with_id("a/b").with_sub_endpoint("c").key(),
            Peer::new(ProcessType::Worker).with_id("a").with_sub_endpoint("b/c").key()
        );
    }

    #[test]
    fn test_peer_value_roundtrip() {
        let peer = Peer::new(ProcessType::Coordinator)
            .with_name("main")
            .with_sub_endpoint("1");
        let back = Peer::from_value(&peer.to_value()).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_peer_value_rejects_unknown_type() {
        let value = Value::object([("id", Value::from("x")), ("type", Value::Int(42))]);
        assert!(Peer::from_value(&value).is_err());
    }

    #[test]
    fn test_process_type_serde_names() {
        let json = serde_json::to_string(&ProcessType::SocketClient).unwrap();
        assert_eq!(json, "\"socket-client\"");
    }
}
