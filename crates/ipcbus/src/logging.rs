// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Traffic logging hooks.
//!
//! The broker hands every routed frame to a [`LogSink`] when traffic
//! logging is enabled. Peers learn the level from the handshake ack and,
//! when it is not [`LogLevel::Off`], acknowledge each dispatched data
//! message with a `LogRoundtrip` record so the broker can log delivery
//! latency.

use crate::message::{Message, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest argument rendering kept in a log entry.
pub const MAX_LOGGED_ARGS: usize = 256;

/// Traffic log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Off,
    /// Channel, kind and peers only.
    Traffic,
    /// Traffic plus a truncated rendering of the arguments.
    Args,
}

impl LogLevel {
    pub fn code(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::Traffic => 1,
            Self::Args => 2,
        }
    }

    /// Unknown codes clamp to the nearest level.
    pub fn from_code(code: i64) -> Self {
        match code {
            i64::MIN..=0 => Self::Off,
            1 => Self::Traffic,
            _ => Self::Args,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(Self::Off),
            "traffic" | "1" => Some(Self::Traffic),
            "args" | "2" => Some(Self::Args),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Traffic => "traffic",
            Self::Args => "args",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery timing reported by a receiving peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roundtrip {
    /// Kind of the acknowledged message.
    pub kind: String,
    /// Peer that received the message.
    pub receiver: String,
    pub received_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
}

/// One logged frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub kind: String,
    /// Sender peer id.
    pub peer: String,
    pub target: Option<String>,
    /// Truncated JSON rendering of the arguments.
    pub args: Option<String>,
    pub roundtrip: Option<Roundtrip>,
}

impl LogEntry {
    pub fn new(message: &Message) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: message.channel.clone(),
            kind: message.kind_name().to_string(),
            peer: message.peer.id.clone(),
            target: message.target.as_ref().map(|t| t.id.clone()),
            args: None,
            roundtrip: None,
        }
    }

    /// Build the entry appropriate for `level`.
    pub fn for_level(level: LogLevel, message: &Message, payload: Option<&Payload>) -> Self {
        let mut entry = Self::new(message);
        if level == LogLevel::Args {
            entry.args = payload.map(render_args);
        }
        entry
    }

    pub fn with_roundtrip(mut self, roundtrip: Roundtrip) -> Self {
        self.roundtrip = Some(roundtrip);
        self
    }
}

fn render_args(payload: &Payload) -> String {
    let rendered = match payload.to_args() {
        Ok(args) => serde_json::Value::Array(args.iter().map(|v| v.to_json()).collect()).to_string(),
        Err(e) => format!("<undecodable: {}>", e),
    };
    truncate(rendered, MAX_LOGGED_ARGS)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push('…');
    s
}

/// Destination for traffic log entries.
pub trait LogSink: Send + Sync {
    fn write_log(&self, entry: &LogEntry);
}

/// Default sink: one `tracing` event per entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_log(&self, entry: &LogEntry) {
        match &entry.roundtrip {
            Some(rt) => {
                let dispatch_us = (rt.dispatched_at - rt.received_at).num_microseconds();
                tracing::info!(
                    target: "ipcbus::traffic",
                    channel = %entry.channel,
                    kind = %rt.kind,
                    peer = %entry.peer,
                    receiver = %rt.receiver,
                    dispatch_us,
                    "roundtrip"
                );
            }
            None => tracing::info!(
                target: "ipcbus::traffic",
                channel = %entry.channel,
                kind = %entry.kind,
                peer = %entry.peer,
                target_peer = entry.target.as_deref().unwrap_or("-"),
                args = entry.args.as_deref().unwrap_or(""),
                "frame"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::message::MessageKind;
    use crate::peer::{Peer, ProcessType};

    fn message() -> Message {
        Message::new(
            MessageKind::Send,
            "logs",
            Peer::new(ProcessType::Worker).with_id("w1"),
        )
    }

    #[test]
    fn test_level_codes_and_parsing() {
        assert_eq!(LogLevel::from_code(LogLevel::Args.code()), LogLevel::Args);
        assert_eq!(LogLevel::from_code(-3), LogLevel::Off);
        assert_eq!(LogLevel::from_code(9), LogLevel::Args);
        assert_eq!(LogLevel::parse("Traffic"), Some(LogLevel::Traffic));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert!(!LogLevel::Off.is_enabled());
    }

    #[test]
    fn test_entry_args_only_at_args_level() {
        let payload = Payload::Args(vec![Value::Int(3), Value::from("x")]);
        let traffic = LogEntry::for_level(LogLevel::Traffic, &message(), Some(&payload));
        assert!(traffic.args.is_none());

        let args = LogEntry::for_level(LogLevel::Args, &message(), Some(&payload));
        assert_eq!(args.args.as_deref(), Some("[3,\"x\"]"));
        assert_eq!(args.kind, "send");
        assert_eq!(args.peer, "w1");
    }

    #[test]
    fn test_long_args_are_truncated() {
        let payload = Payload::Args(vec![Value::from("é".repeat(400))]);
        let entry = LogEntry::for_level(LogLevel::Args, &message(), Some(&payload));
        let rendered = entry.args.unwrap();
        assert!(rendered.len() <= MAX_LOGGED_ARGS + '…'.len_utf8());
        assert!(rendered.ends_with('…'));
    }
}
